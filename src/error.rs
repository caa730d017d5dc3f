use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid shape, scale, chunk or run parameters; raised before any write.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A store node of this name already exists under its parent.
    #[error("store node {0} already exists")]
    DuplicateName(String),
    /// Aggregation inputs disagree on shape or voxel spacing.
    #[error("cannot sum {first} with {second}: {reason}")]
    IncompatibleSources {
        first: String,
        second: String,
        reason: String,
    },
    /// The store root exists and clobbering was not requested.
    #[error("{} exists", .0.display())]
    StoreExists(PathBuf),
    /// One or more work items failed inside worker processes.
    #[error("{} work item(s) failed: {}", .0.len(), summarize(.0))]
    WorkersFailed(Vec<WorkerFailure>),
    #[error("{0}")]
    General(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    ArrayCreate(#[from] zarrs::array::ArrayCreateError),
    #[error(transparent)]
    Array(#[from] zarrs::array::ArrayError),
    #[error(transparent)]
    Storage(#[from] zarrs::storage::StorageError),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }
}

/// A work item which did not complete, with enough context to retry it alone.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkerFailure {
    pub item: String,
    pub cause: String,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.item, self.cause)
    }
}

fn summarize(failures: &[WorkerFailure]) -> String {
    failures
        .iter()
        .map(WorkerFailure::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
