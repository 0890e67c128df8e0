//! Byte-level framing of helper messages.
//!
//! A request is a single JSON document written to the helper's stdin, which
//! is then closed. A reply is the helper's complete stdout. An empty (or
//! whitespace-only) stdout means the helper produced no reply at all, which
//! is distinct from a reply that fails to parse.

use crate::error::ProtocolError;
use crate::messages::{Reply, Request};

/// Serialize a request for the helper's stdin.
pub fn encode<R: Request>(request: &R) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(request).map_err(|source| ProtocolError::Encode {
        message: R::COMMAND.as_str(),
        source,
    })
}

/// Decode a reply from the helper's stdout.
///
/// Returns `Ok(None)` when the helper wrote nothing.
pub fn decode<M: Reply>(bytes: &[u8]) -> Result<Option<M>, ProtocolError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(bytes)
        .map(Some)
        .map_err(|source| ProtocolError::Decode {
            message: M::NAME,
            source,
        })
}
