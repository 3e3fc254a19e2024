//! Runtime configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Issuer configuration, resolved before startup
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the HTTP server binds
    pub bind_addr: SocketAddr,
    /// Trust domain applied to registrations that leave theirs empty
    pub trust_domain: String,
    /// Issuer expected in presented tokens
    pub issuer: String,
    /// Audience presented tokens must carry
    pub audience: String,
    /// Endpoint serving the cluster's signing keys
    pub jwks_url: String,
    /// Mounted service-account token used to authenticate the key fetch
    pub sa_token_path: PathBuf,
    /// Mounted CA bundle the key fetch is pinned to
    pub ca_bundle_path: PathBuf,
    /// Key fetch timeout
    pub fetch_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: crate::DEFAULT_BIND_ADDR.parse().expect("valid default addr"),
            trust_domain: crate::DEFAULT_TRUST_DOMAIN.to_string(),
            issuer: crate::KUBERNETES_ISSUER.to_string(),
            audience: crate::DEFAULT_AUDIENCE.to_string(),
            jwks_url: crate::DEFAULT_JWKS_URL.to_string(),
            sa_token_path: PathBuf::from(crate::SERVICE_ACCOUNT_TOKEN_PATH),
            ca_bundle_path: PathBuf::from(crate::SERVICE_ACCOUNT_CA_PATH),
            fetch_timeout: crate::JWKS_FETCH_TIMEOUT,
        }
    }
}
