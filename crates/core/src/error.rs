use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("malformed session token: {0}")]
    MalformedToken(String),
}
