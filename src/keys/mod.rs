//! Cluster signing-key source
//!
//! Fetches the JWKS document published by the Kubernetes API server, which
//! holds the public keys the cluster signs service-account tokens with. The
//! fetch authenticates with this pod's own bound service-account token and
//! trusts only the cluster CA bundle.
//!
//! Keys are fetched fresh for every verification attempt; the key set is
//! immutable once parsed and discarded after use.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// Signing-key fetch errors
#[derive(Debug, Error)]
pub enum KeySourceError {
    /// Local credential or CA bundle unreadable
    #[error("configuration error: {0}")]
    Configuration(String),

    /// HTTP request failed or returned a non-200 status
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body is not a well-formed JWKS document
    #[error("decoding JWKS: {0}")]
    Decode(String),
}

/// A single JWK record from the cluster JWKS
#[derive(Clone, Debug, Deserialize)]
pub struct Jwk {
    /// Key type (`RSA` for Kubernetes token signing keys)
    pub kty: String,
    /// Key identifier, matched against the token header's `kid`
    pub kid: Option<String>,
    /// Intended algorithm
    pub alg: Option<String>,
    /// RSA modulus, base64url without padding
    pub n: Option<String>,
    /// RSA public exponent, base64url without padding
    pub e: Option<String>,
}

/// The set of public signing keys currently trusted by the cluster issuer
#[derive(Clone, Debug, Deserialize)]
pub struct SigningKeySet {
    keys: Vec<Jwk>,
}

impl SigningKeySet {
    /// Build a key set from explicit records
    pub fn new(keys: Vec<Jwk>) -> Self {
        Self { keys }
    }

    /// Parse a JWKS document body
    pub fn from_json(body: &str) -> Result<Self, KeySourceError> {
        serde_json::from_str(body).map_err(|e| KeySourceError::Decode(e.to_string()))
    }

    /// Look up a key by its identifier. Exact match only; no fallback.
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }

    /// Number of keys in the set
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Source of the cluster's trusted signing keys
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the current signing key set
    async fn fetch(&self) -> Result<SigningKeySet, KeySourceError>;
}

/// Key source backed by the cluster's well-known JWKS endpoint
pub struct ClusterKeySource {
    jwks_url: String,
    token_path: PathBuf,
    ca_bundle_path: PathBuf,
    timeout: Duration,
}

impl ClusterKeySource {
    /// Create a key source from the service configuration
    pub fn new(config: &Config) -> Self {
        Self {
            jwks_url: config.jwks_url.clone(),
            token_path: config.sa_token_path.clone(),
            ca_bundle_path: config.ca_bundle_path.clone(),
            timeout: config.fetch_timeout,
        }
    }
}

#[async_trait]
impl KeySource for ClusterKeySource {
    async fn fetch(&self) -> Result<SigningKeySet, KeySourceError> {
        let token = tokio::fs::read_to_string(&self.token_path)
            .await
            .map_err(|e| {
                KeySourceError::Configuration(format!(
                    "reading service account token {}: {}",
                    self.token_path.display(),
                    e
                ))
            })?;

        let bundle = tokio::fs::read(&self.ca_bundle_path).await.map_err(|e| {
            KeySourceError::Configuration(format!(
                "reading CA bundle {}: {}",
                self.ca_bundle_path.display(),
                e
            ))
        })?;

        let roots = reqwest::Certificate::from_pem_bundle(&bundle)
            .map_err(|e| KeySourceError::Configuration(format!("parsing CA bundle: {}", e)))?;

        // Trust the cluster CA bundle and nothing else.
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .tls_built_in_root_certs(false);
        for root in roots {
            builder = builder.add_root_certificate(root);
        }
        let client = builder
            .build()
            .map_err(|e| KeySourceError::Configuration(format!("building HTTP client: {}", e)))?;

        let response = client
            .get(&self.jwks_url)
            .bearer_auth(token.trim())
            .send()
            .await
            .map_err(|e| KeySourceError::Transport(format!("fetching JWKS: {}", e)))?;

        if !response.status().is_success() {
            return Err(KeySourceError::Transport(format!(
                "unexpected response: {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| KeySourceError::Transport(format!("reading JWKS body: {}", e)))?;

        let keys = SigningKeySet::from_json(&body)?;
        debug!(key_count = keys.len(), "Fetched cluster JWKS");
        Ok(keys)
    }
}

/// Key source serving a fixed key set
///
/// Useful when the key set is obtained out of band, and for driving the
/// pipeline in tests without a live API server.
pub struct StaticKeySource {
    keys: SigningKeySet,
}

impl StaticKeySource {
    /// Create a static source from a parsed key set
    pub fn new(keys: SigningKeySet) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<SigningKeySet, KeySourceError> {
        Ok(self.keys.clone())
    }
}
