use ferry_engine::{FerryError, PipelineFailure};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Engine(#[from] FerryError),

    #[error("{0}")]
    Pipeline(#[from] PipelineFailure),
}

pub type Result<T> = std::result::Result<T, AppError>;
