use quiltdb_core::Message;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// One outbound unit. `Text` carries the JSON encoding used when
/// `socket_string_mode` is on; `Record` hands the structured message to a
/// transport that moves native records.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Record(Message),
    Text(String),
}

impl Frame {
    /// Decode back to a message regardless of mode.
    pub fn into_message(self) -> Result<Message, quiltdb_core::CoreError> {
        match self {
            Frame::Record(msg) => Ok(msg),
            Frame::Text(text) => Message::decode_json(&text),
        }
    }
}

/// Send half of a peer connection. The replication core only ever calls
/// `send`; inbound traffic is pushed into the core by the embedding via
/// `Replicator::handle_message`.
pub trait PeerSocket {
    fn send(&self, frame: &Frame) -> Result<(), TransportError>;
}
