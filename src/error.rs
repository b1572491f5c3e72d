use thiserror::Error;

pub type CorvusResult<T, E = CorvusError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum CorvusError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl CorvusError {
    /// True when the failure means "no free frame and no evictable victim".
    /// The checked buffer-pool variants map exactly this kind to `None`.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, CorvusError::ResourceExhausted(_))
    }
}
