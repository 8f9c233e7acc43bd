//! System controller error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("partitioner request failed: {0}")]
    Partition(#[from] reqwest::Error),

    #[error("invalid reconcile key: {0}")]
    InvalidKey(String),

    #[error("state error: {0}")]
    State(#[from] edgegrid_state::StateError),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
