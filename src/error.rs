use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChronoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0} table full")]
    TableFull(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An on-disk invariant is broken. Callers must not continue the
    /// operation; the CLI exits the process.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ChronoError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChronoError::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, ChronoError>;
