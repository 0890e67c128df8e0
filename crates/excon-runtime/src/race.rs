//! First-of-two composition of a helper's reply and its exit.
//!
//! `wait` and `usage` helpers are expected to block for a long time before
//! writing their reply. If such a helper dies without reporting, reading its
//! stdout alone could stall forever (a forked child may keep the pipe open),
//! so the reply is raced against the process exit and whichever arrives
//! first decides how the other is treated.

use std::future::Future;
use std::io;
use std::time::Duration;

use excon_protocol::{HelperCommand, Reply, codec};
use futures::future::{self, Either};

use crate::error::ContainerizerError;
use crate::invoke::ExitStatus;

/// How long stdout may stay open after a helper exited cleanly. Anything
/// the helper forked can keep the pipe open indefinitely.
pub const OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// Outcome of [`race`]: the side that resolved first, plus the other side
/// still pending.
pub enum Raced<R: Future, E: Future> {
    Replied { output: R::Output, status: E },
    Exited { status: E::Output, output: R },
}

/// Resolve as soon as either the reply or the exit status is available.
pub async fn race<R, E>(output: R, status: E) -> Raced<R, E>
where
    R: Future + Unpin,
    E: Future + Unpin,
{
    match future::select(output, status).await {
        Either::Left((output, status)) => Raced::Replied { output, status },
        Either::Right((status, output)) => Raced::Exited { status, output },
    }
}

impl<R, E> Raced<R, E>
where
    R: Future<Output = io::Result<Vec<u8>>>,
    E: Future<Output = ExitStatus>,
{
    /// Interpret the race for `command`.
    ///
    /// A non-zero or abnormal exit always fails, even if the helper printed
    /// something first. A zero exit with no decodable reply is a
    /// `MalformedReply`, as is a zero exit whose stdout stays open longer
    /// than [`OUTPUT_GRACE`]. When the exit wins and is non-zero, the
    /// pending output is dropped without being read.
    pub async fn settle<M: Reply>(self, command: HelperCommand) -> Result<M, ContainerizerError> {
        let output = match self {
            Raced::Replied { output, status } => {
                let status = status.await;
                check_status(command, status)?;
                output
            }
            Raced::Exited { status, output } => {
                check_status(command, status)?;
                tokio::time::timeout(OUTPUT_GRACE, output)
                    .await
                    .map_err(|_| ContainerizerError::MalformedReply {
                        command,
                        reason: format!(
                            "helper exited but stdout was still open after {}s",
                            OUTPUT_GRACE.as_secs()
                        ),
                    })?
            }
        };

        let bytes = output.map_err(|e| ContainerizerError::MalformedReply {
            command,
            reason: format!("failed to read stdout: {e}"),
        })?;

        match codec::decode::<M>(&bytes) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(ContainerizerError::MalformedReply {
                command,
                reason: format!("helper closed stdout without a {}", M::NAME),
            }),
            Err(e) => Err(ContainerizerError::MalformedReply {
                command,
                reason: e.to_string(),
            }),
        }
    }
}

fn check_status(command: HelperCommand, status: ExitStatus) -> Result<(), ContainerizerError> {
    if status.success() {
        Ok(())
    } else {
        Err(ContainerizerError::HelperExitFailure { command, status })
    }
}
