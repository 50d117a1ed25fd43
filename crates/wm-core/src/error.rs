use crate::registry::RegistryError;

/// Failure kinds surfaced by the machine manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid caller input.
    #[error("{0}")]
    BadRequest(String),

    /// A uniqueness invariant would be violated.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// The action is no longer valid in the current state.
    #[error("{0}")]
    Forbidden(String),

    /// Backend, provider or I/O failure.
    #[error("{0}")]
    Machine(String),

    /// Snapshot persistence failure.
    #[error("{0}")]
    Snapshot(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<wm_infra::Error> for Error {
    fn from(e: wm_infra::Error) -> Self {
        match e {
            wm_infra::Error::NotFound(msg) => Self::NotFound(msg),
            wm_infra::Error::Conflict(msg) => Self::Conflict(msg),
            other => Self::Machine(other.to_string()),
        }
    }
}

impl From<wm_db::Error> for Error {
    fn from(e: wm_db::Error) -> Self {
        match e {
            wm_db::Error::NotFound(msg) => Self::NotFound(msg),
            other => Self::Snapshot(other.to_string()),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) | RegistryError::NotReady(_) => Self::NotFound(e.to_string()),
            RegistryError::DuplicateId(_) | RegistryError::DuplicateName { .. } => {
                Self::Conflict(e.to_string())
            }
        }
    }
}
