use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NimbusError>;

#[derive(Debug, Error)]
pub enum NimbusError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("operation rejected: {0}")]
    Rejected(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("dependency cycle: {0}")]
    CycleDetected(&'static str),
    #[error("configuration error: {0}")]
    Config(String),
}
