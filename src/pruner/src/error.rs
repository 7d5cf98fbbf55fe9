use common::store::StoreError;

/// Errors returned by pruning runs.
#[derive(Debug, thiserror::Error)]
pub enum PruneError {
    /// Invalid run parameters. Reported before any work is done.
    #[error("invalid prune configuration: {0}")]
    Config(String),

    /// A read or write against the store failed.
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },

    /// A sweep task panicked or was cancelled.
    #[error("prune task failed: {0}")]
    Task(String),
}

impl PruneError {
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Prefix the context of a store failure with `outer`.
    pub fn within(self, outer: &str) -> Self {
        match self {
            Self::Store { context, source } => Self::Store {
                context: format!("{outer}: {context}"),
                source,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, PruneError>;

/// Attach context to store failures.
pub trait StoreResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> StoreResultExt<T> for std::result::Result<T, StoreError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| PruneError::Store {
            context: context.into(),
            source,
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| PruneError::Store {
            context: f().into(),
            source,
        })
    }
}
