use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader (known leader: {})", .leader_id.as_deref().unwrap_or("none"))]
    NotLeader {
        leader_id: Option<String>,
        leader_address: Option<String>,
    },

    #[error("Node is not running")]
    NotRunning,

    #[error("Node already started")]
    AlreadyStarted,

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl RaftError {
    /// Whether a client may retry the same request later, possibly against
    /// another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. } | RaftError::NotRunning
        )
    }
}
