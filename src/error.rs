//! Error types for the kubespiffe service

use thiserror::Error;

use crate::attest::AttestError;
use crate::keys::KeySourceError;
use crate::svid::CaError;
use crate::verify::VerifyError;

/// Main error type for kubespiffe operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Signing-key fetch error
    #[error("key source error: {0}")]
    KeySource(#[from] KeySourceError),

    /// Token verification error
    #[error("verification error: {0}")]
    Verify(#[from] VerifyError),

    /// Attestation error
    #[error("attestation error: {0}")]
    Attest(#[from] AttestError),

    /// Certificate authority error
    #[error("certificate authority error: {0}")]
    Ca(#[from] CaError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Server error
    #[error("server error: {0}")]
    Server(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a server error with the given message
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_carries_message() {
        let err = Error::config("TRUST_DOMAIN contains invalid characters");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("invalid characters"));
    }

    #[test]
    fn pipeline_errors_convert_into_top_level_error() {
        let err: Error = VerifyError::MissingKeyId.into();
        assert!(matches!(err, Error::Verify(_)));

        let err: Error = KeySourceError::Transport("connection refused".into()).into();
        assert!(err.to_string().contains("connection refused"));

        let err: Error = CaError::Signing("bad key".into()).into();
        assert!(matches!(err, Error::Ca(_)));
    }

    /// Everything that means "this token cannot be trusted" must stay
    /// distinguishable from failures on our side, so the transport can map
    /// the former to 401 and the latter to 5xx.
    #[test]
    fn verification_failures_stay_distinct_from_issuance_failures() {
        fn is_caller_fault(err: &Error) -> bool {
            matches!(err, Error::Verify(_) | Error::Attest(AttestError::ClaimShape(_)))
        }

        assert!(is_caller_fault(&VerifyError::MissingKeyId.into()));
        assert!(is_caller_fault(
            &AttestError::ClaimShape("missing kubernetes.io claim".into()).into()
        ));
        assert!(!is_caller_fault(&CaError::Signing("entropy".into()).into()));
        assert!(!is_caller_fault(
            &KeySourceError::Decode("not a JWKS".into()).into()
        ));
    }
}
