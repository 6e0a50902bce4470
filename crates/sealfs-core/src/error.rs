use thiserror::Error;

pub type SealfsResult<T> = Result<T, SealfsError>;

#[derive(Debug, Error)]
pub enum SealfsError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
