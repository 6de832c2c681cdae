use thiserror::Error;

/// Failure classes of the import engine. Only `Input` forces a fresh session;
/// every other variant leaves the session usable.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid import file: {0}")]
    Input(String),

    #[error("header mapping incomplete: {0}")]
    MappingIncomplete(String),

    #[error("{pending} fuzzy match(es) still awaiting confirmation")]
    ResolutionAmbiguous { pending: usize },

    #[error("external service failed: {0}")]
    ExternalService(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("cannot {action} at step {step}: {reason}")]
    InvalidTransition {
        step: &'static str,
        action: &'static str,
        reason: String,
    },

    #[error("a commit is already in flight")]
    CommitInFlight,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::Input(_) => "input_error",
            ImportError::MappingIncomplete(_) => "mapping_incomplete",
            ImportError::ResolutionAmbiguous { .. } => "resolution_ambiguous",
            ImportError::ExternalService(_) => "external_service_error",
            ImportError::Commit(_) => "commit_error",
            ImportError::InvalidTransition { .. } => "invalid_transition",
            ImportError::CommitInFlight => "commit_in_flight",
            ImportError::Store(_) => "db_query_failed",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ImportError::Input(_))
    }
}
