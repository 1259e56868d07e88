//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Reach-dht crate error enum.
pub enum Error {
    /// Catch-all for malformed packet contents.
    #[error("Generic error: {0}")]
    Generic(String),

    /// A search could not start because the node store has no peer
    /// strictly closer to the target than this router.
    #[error("No reachable nodes closer to the target")]
    NoReachableNodes,

    /// Expected a 20 byte id, got something else.
    #[error("Invalid id size: {0}")]
    InvalidIdSize(usize),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Indicates that the message transaction_id is not two bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    /// The actor thread is no longer running.
    #[error("Dht actor thread shut down")]
    DhtIsShutdown,
}
