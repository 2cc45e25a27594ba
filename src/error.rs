//! Crate-wide error type.
//!
//! Kinds here correspond to the taxonomy in the reconciler design: almost
//! all variants are surfaced to the controller's `error_policy` as a
//! short requeue, never as a process abort. `FatalInvariant` is the sole
//! exception, raised only at startup.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("token transport error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("a dependency is not ready yet: {0}")]
    NotReadyYet(String),

    #[error("user misconfiguration: {0}")]
    UserMisconfig(String),

    #[error("required local identity ConfigMap kube-system/cluster-name is missing")]
    FatalInvariant,
}

impl Error {
    /// True for the error kinds that the reconciler loop may retry shortly
    /// without any user action (TRANSIENT-API / NOT-READY-YET in the
    /// error-handling taxonomy).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_) | Error::HttpError(_) | Error::NotReadyYet(_)
        )
    }
}
