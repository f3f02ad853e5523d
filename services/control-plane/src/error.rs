//! Error types shared across the engine.
//!
//! Every public operation returns [`CoreError`]. Callers that expose the
//! engine over a transport map it to a status code with [`CoreError::class`].

use stevedore_id::AppId;

use crate::container::IllegalTransition;
use crate::outcome::OperationFailure;
use crate::store::StoreError;
use crate::validation::ValidationError;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors returned by the controller and its components.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The request was rejected before any side effect.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    /// One or more fatal backend operations failed. State that was reached
    /// is persisted; see the failures for what is left to repair.
    #[error("{} backend operation(s) failed", .failures.len())]
    Unavailable { failures: Vec<OperationFailure> },

    /// A transition was requested from a state that does not allow it.
    /// This is a bug in the caller, never a backend failure.
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("app {app} is busy with another operation, retry later")]
    LockContention { app: AppId },

    #[error("store error: {0}")]
    Store(String),
}

/// Coarse classification of a [`CoreError`], used for status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    InvalidRequest,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

impl ErrorClass {
    /// HTTP-style status code for this class.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Unavailable => 503,
            Self::Internal => 500,
        }
    }
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::InvalidRequest,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Conflict(_) | Self::LockContention { .. } => ErrorClass::Conflict,
            Self::Unavailable { .. } => ErrorClass::Unavailable,
            Self::IllegalTransition(_) | Self::Store(_) => ErrorClass::Internal,
        }
    }

    /// Whether repeating the identical request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::LockContention { .. })
    }

    /// Failures carried by an unavailable-class error.
    pub fn failures(&self) -> &[OperationFailure] {
        match self {
            Self::Unavailable { failures } => failures,
            _ => &[],
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            StoreError::Conflict { kind, id } => {
                Self::Conflict(format!("{kind} already exists: {id}"))
            }
            StoreError::Unavailable(message) => Self::Store(message),
        }
    }
}

impl From<stevedore_id::IdError> for CoreError {
    fn from(err: stevedore_id::IdError) -> Self {
        Self::Validation(ValidationError::from(err))
    }
}
