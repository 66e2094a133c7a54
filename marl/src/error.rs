use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("the store is busy")]
    Busy,
    #[error("file corruption detected: {0}")]
    Corrupt(String),
    #[error("garbage collection in progress")]
    GcRunning,
    #[error("store is read-only")]
    ReadOnly,
    #[error("object ids exhausted")]
    IdsExhausted,
    #[error("allocation of {0} bytes exceeds the object size limit")]
    TooLarge(u64),
    #[error("invalid object id {0}")]
    InvalidId(u64),
}

pub type Result<T> = std::result::Result<T, StoreError>;
