use thiserror::Error;

/// Errors surfaced by the DHT engine.
///
/// Everything triggered by network input is recovered inside the run loop;
/// only construction-time problems reach the caller.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no free transaction tag for destination")]
    TransactionExhausted,

    #[error("router is not running")]
    Stopped,
}
