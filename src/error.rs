use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Identity is valid but not permitted here. Callers sign the user out.
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("store read failed: {0}")]
    StoreRead(String),
    #[error("store write failed: {0}")]
    StoreWrite(String),
    /// Malformed model output or a failed API call. Retryable without limit.
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("session error: {0}")]
    Session(String),
    #[error("export failed: {0}")]
    Export(String),
}

pub type AppResult<T> = Result<T, AppError>;
