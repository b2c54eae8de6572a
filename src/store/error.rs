use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The log could not be written or read, or the write lock was not acquired in time.
    #[error("storage I/O failure: {0}")]
    Io(String),

    /// A write would break a schema constraint (foreign key, check, or row existence).
    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
