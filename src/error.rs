//! Error types for the virtual kubelet

use thiserror::Error;

use crate::provider::ProviderError;

/// Result type for the virtual kubelet
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the virtual kubelet
///
/// Variants map onto the failure kinds the reconciliation engine reacts to.
/// Whether a work item is retried is decided by [`Error::is_retryable`].
#[derive(Debug, Error)]
pub enum Error {
    /// The object does not exist in the control plane or the provider
    #[error("not found: {0}")]
    NotFound(String),

    /// The object already exists in the control plane
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency failure on a resource version
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed input such as an invalid queue key or pod spec
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A retryable failure talking to the provider or the control plane
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The provider rejected the pod in a way that will not change on retry
    #[error("permanent backend error: {0}")]
    Permanent(String),

    /// The environment of a pod could not be resolved
    #[error("{0}")]
    Materialization(String),

    /// The root cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Programmer error
    #[error("internal error: {0}")]
    Internal(String),

    /// Kubernetes API error that did not map onto a more specific kind
    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),
}

impl Error {
    /// Whether the work queue should requeue a key that failed with this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::Conflict(_) | Error::KubeError(_) | Error::Materialization(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::AlreadyExists(resp.message.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(resp.message.clone()),
            _ => Error::KubeError(err),
        }
    }
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => Error::NotFound(msg),
            ProviderError::Permanent(msg) => Error::Permanent(msg),
            ProviderError::Transient(msg) => Error::Transient(msg),
            ProviderError::NotImplemented(what) => {
                Error::Internal(format!("provider does not implement {}", what))
            }
            ProviderError::Cancelled => Error::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} happened", reason),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn kube_errors_are_classified_by_status_code() {
        assert!(Error::from(api_error(404, "NotFound")).is_not_found());
        assert!(Error::from(api_error(409, "AlreadyExists")).is_already_exists());
        assert!(Error::from(api_error(409, "Conflict")).is_conflict());
        assert!(matches!(
            Error::from(api_error(500, "InternalError")),
            Error::KubeError(_)
        ));
    }

    #[test]
    fn permanent_provider_errors_are_not_retried() {
        let err: Error = ProviderError::Permanent("quota exceeded".to_string()).into();
        assert!(!err.is_retryable());

        let err: Error = ProviderError::Transient("timeout".to_string()).into();
        assert!(err.is_retryable());
    }
}
