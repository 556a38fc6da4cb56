use thiserror::Error;

/// Error taxonomy for the indexing service.
///
/// Per-file failures (`Decode`, `UnsupportedExtension`) are handled inside
/// the pipeline and never abort a batch; the remaining variants surface to
/// the caller.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to decode `{path}`: {reason}")]
    Decode { path: String, reason: String },

    #[error("unsupported extension: {0}")]
    UnsupportedExtension(String),

    /// Internal signal: the syntax tree contains ERROR nodes. The loader
    /// catches this and falls back to line segmentation.
    #[error("source does not parse cleanly")]
    ParseInvalid,

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// Infrastructure faults (worker task panics and the like) that fit no
    /// caller-facing category.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

impl From<sqlx::Error> for IndexError {
    fn from(e: sqlx::Error) -> Self {
        IndexError::VectorStore(e.to_string())
    }
}

impl From<qdrant_client::QdrantError> for IndexError {
    fn from(e: qdrant_client::QdrantError) -> Self {
        IndexError::VectorStore(e.to_string())
    }
}

impl From<reqwest::Error> for IndexError {
    fn from(e: reqwest::Error) -> Self {
        IndexError::Embedding(e.to_string())
    }
}
