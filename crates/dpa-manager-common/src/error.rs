//! Error taxonomy for managers and resource syncers.

use thiserror::Error;

/// A failure reported by a resource syncer or the kernel shim beneath it.
///
/// Syncer failures are always recoverable: the failing item stays dirty and
/// is retried on the next apply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("kernel {op} failed: {message}")]
    Kernel { op: String, message: String },

    #[error("interface {name} not present")]
    InterfaceMissing { name: String },

    #[error("resync failed: {message}")]
    Resync { message: String },
}

impl SyncError {
    pub fn kernel(op: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Kernel {
            op: op.into(),
            message: message.into(),
        }
    }

    pub fn interface_missing(name: impl Into<String>) -> Self {
        SyncError::InterfaceMissing { name: name.into() }
    }

    pub fn resync(message: impl Into<String>) -> Self {
        SyncError::Resync {
            message: message.into(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Error returned from [`crate::Manager::complete_deferred_work`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    /// Some items could not be reconciled this pass; they remain dirty.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Waiting on state owned by another manager or an external source.
    #[error("waiting for dependency: {dependency}")]
    Dependency { dependency: String },

    /// An invariant is broken or a resource pool is exhausted. The process
    /// must stop rather than run with partially enforced policy.
    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl ManagerError {
    pub fn transient(message: impl Into<String>) -> Self {
        ManagerError::Transient {
            message: message.into(),
        }
    }

    pub fn waiting_for(dependency: impl Into<String>) -> Self {
        ManagerError::Dependency {
            dependency: dependency.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ManagerError::Fatal {
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ManagerError::Fatal { .. })
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }
}

impl From<SyncError> for ManagerError {
    fn from(err: SyncError) -> Self {
        ManagerError::transient(err.to_string())
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;
