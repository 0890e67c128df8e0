//! Helper protocol for the excon external containerizer.
//!
//! ```text
//! <helper> launch   < LaunchRequest
//! <helper> update   < UpdateRequest
//! <helper> usage    < UsageRequest    > ResourceStatistics
//! <helper> wait     < WaitRequest     > Termination
//! <helper> destroy  < DestroyRequest
//! ```
//!
//! `wait` is expected to block on the helper side until the container's
//! executor has terminated.

pub mod codec;
pub mod error;
pub mod messages;

pub use error::ProtocolError;
pub use messages::{
    CommandInfo, ContainerId, DestroyRequest, ExecutorInfo, HelperCommand, LaunchRequest, Reply,
    Request, ResourceStatistics, Resources, TaskInfo, Termination, UpdateRequest, UsageRequest,
    WaitRequest,
};
