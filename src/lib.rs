//! Kubespiffe - SPIFFE-style SVID issuance for Kubernetes workloads
//!
//! Kubespiffe turns a projected service-account token into a short-lived
//! X.509 identity. A workload POSTs its token; the issuer verifies it
//! against the cluster's signing keys, attests the workload against a
//! `WorkloadRegistration` resource, and mints a five-minute certificate
//! carrying the workload's SPIFFE ID as a URI SAN.
//!
//! # Modules
//!
//! - [`keys`] - Signing key retrieval from the cluster JWKS endpoint
//! - [`verify`] - PSAT signature and claim verification
//! - [`attest`] - Workload-to-registration matching
//! - [`svid`] - Certificate authority and SVID minting
//! - [`crd`] - The WorkloadRegistration custom resource
//! - [`server`] - HTTP surface for in-cluster workloads
//! - [`config`] - Runtime configuration
//! - [`retry`] - Backoff helper for cluster API calls
//! - [`error`] - Error types for the issuer

#![deny(missing_docs)]

pub mod attest;
pub mod config;
pub mod crd;
pub mod error;
pub mod keys;
pub mod retry;
pub mod server;
pub mod svid;
pub mod verify;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Trust domain applied when a registration does not carry one
pub const DEFAULT_TRUST_DOMAIN: &str = "example.org";

/// Issuer projected bound tokens carry in-cluster
pub const KUBERNETES_ISSUER: &str = "https://kubernetes.default.svc.cluster.local";

/// Audience workload tokens must be projected for
pub const DEFAULT_AUDIENCE: &str = "kubespiffed";

/// In-cluster endpoint serving the apiserver's signing keys
pub const DEFAULT_JWKS_URL: &str = "https://kubernetes.default.svc/openid/v1/jwks";

/// Mounted service-account token used when fetching signing keys
pub const SERVICE_ACCOUNT_TOKEN_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Mounted CA bundle the key fetch is pinned to
pub const SERVICE_ACCOUNT_CA_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Default HTTP bind address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Timeout for one signing-key fetch
pub const JWKS_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
