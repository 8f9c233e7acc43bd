//! Dispatcher error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("backend not found: {0}")]
    NotFound(String),

    #[error("invalid backend url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("no function in request path: {0}")]
    Unroutable(String),

    #[error("failed to build upstream request: {0}")]
    Request(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("state error: {0}")]
    State(#[from] edgegrid_state::StateError),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
