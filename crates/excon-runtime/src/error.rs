use excon_protocol::{ContainerId, HelperCommand, ProtocolError};
use thiserror::Error;

use crate::invoke::ExitStatus;

/// Failure of a containerizer operation.
///
/// `Clone` because a single termination outcome is handed to every caller
/// of `wait` on the same container.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContainerizerError {
    #[error("failed to spawn helper `{command}`: {reason}")]
    SpawnFailure {
        command: HelperCommand,
        reason: String,
    },

    #[error("helper `{command}` exited without a valid reply: {reason}")]
    MalformedReply {
        command: HelperCommand,
        reason: String,
    },

    #[error("helper `{command}` failed: {status}")]
    HelperExitFailure {
        command: HelperCommand,
        status: ExitStatus,
    },

    #[error("container {0} already exists")]
    DuplicateContainer(ContainerId),

    #[error("unknown container {0}")]
    UnknownContainer(ContainerId),

    #[error("recovery state is corrupt: {0}")]
    StateCorrupt(String),

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("containerizer has shut down")]
    Shutdown,
}

impl From<ProtocolError> for ContainerizerError {
    fn from(err: ProtocolError) -> Self {
        Self::Encode(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no excon.toml found (looked in the working directory and ~/.excon)")]
    NotFound,

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
