//! Error types for cache and memory persistence

/// Working memory errors
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Reading or writing the memory file failed
    #[error("memory io error at {path}: {source}")]
    Io {
        /// File involved
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Entries could not be encoded
    #[error("memory serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Blocking writer task died
    #[error("memory writer task failed: {0}")]
    Task(String),
}

impl MemoryError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Whether retrying the write could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Task(_))
    }
}
