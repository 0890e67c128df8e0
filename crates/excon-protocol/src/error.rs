use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode {message}: {source}")]
    Encode {
        message: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {message}: {source}")]
    Decode {
        message: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
