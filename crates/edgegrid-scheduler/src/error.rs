//! Scheduler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),

    #[error("optimizer request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid reconcile key: {0}")]
    InvalidKey(String),

    #[error("random source unavailable: {0}")]
    Random(String),

    #[error("state error: {0}")]
    State(#[from] edgegrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Split a `namespace/community` work-queue key.
pub(crate) fn split_key(key: &str) -> SchedulerResult<(&str, &str)> {
    match key.split_once('/') {
        Some((ns, community)) if !ns.is_empty() && !community.is_empty() => Ok((ns, community)),
        _ => Err(SchedulerError::InvalidKey(key.to_string())),
    }
}
