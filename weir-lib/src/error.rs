use thiserror::Error;

/// Errors that can occur in the weir core
#[derive(Error, Debug)]
pub enum WeirError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, WeirError>;
