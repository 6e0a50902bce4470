use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("operation aborted")]
    Aborted,

    #[error("reader is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(#[from] opendal::Error),

    /// Failure raised by a layer wrapping the backend (e.g. encryption)
    #[error("{0}")]
    Layer(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StorageError {
    /// Whether retrying the whole operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Backend(e) => e.is_temporary(),
            StorageError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
            ),
            StorageError::NotFound(_)
            | StorageError::Aborted
            | StorageError::Closed
            | StorageError::Layer(_) => false,
        }
    }

    /// Borrow a layer error as its concrete type.
    pub fn layer_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            StorageError::Layer(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}
