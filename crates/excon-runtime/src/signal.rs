//! Write-once asynchronous values with many readers.
//!
//! [`signal`] returns a [`Promise`], the only way to set the value, and an
//! [`Observer`] that can be cloned freely. `Promise::fulfil` consumes the
//! promise, so a value can be set at most once.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

pub struct Promise<T> {
    sender: oneshot::Sender<T>,
}

/// Resolves to the fulfilled value, or `None` if the promise was dropped
/// unfulfilled.
#[derive(Clone)]
pub struct Observer<T: Clone> {
    value: Shared<BoxFuture<'static, Option<T>>>,
}

pub fn signal<T>() -> (Promise<T>, Observer<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let value = receiver.map(Result::ok).boxed().shared();
    (Promise { sender }, Observer { value })
}

impl<T> Promise<T> {
    pub fn fulfil(self, value: T) {
        // Every observer may already be gone; that is fine.
        let _ = self.sender.send(value);
    }
}

impl<T: Clone> Observer<T> {
    pub async fn get(self) -> Option<T> {
        self.value.await
    }
}
