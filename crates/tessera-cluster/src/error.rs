use thiserror::Error;

use tessera_core::CoreError;

use crate::proto::NodeId;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("transport: {0}")]
    Transport(String),
    #[error("peer {0} unavailable")]
    PeerUnavailable(NodeId),
    #[error("no live owner for shard {shard} of table {table}")]
    NoLiveOwner { table: u32, shard: usize },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("kernel failed on shard {shard}: {message}")]
    KernelFailed { shard: usize, message: String },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("remote error: {0}")]
    Remote(String),
}

impl ClusterError {
    /// Missing keys are surfaced to the caller, never treated as fatal.
    pub fn is_missing_key(&self) -> bool {
        matches!(self, ClusterError::Core(CoreError::MissingKey))
    }

    /// Configuration and protocol errors stop the current run and poison
    /// the master until shutdown.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::Core(CoreError::UnknownType { .. })
                | ClusterError::Core(CoreError::Config(_))
                | ClusterError::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
