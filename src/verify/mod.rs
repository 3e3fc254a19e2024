//! PSAT verification
//!
//! Proves that a presented projected service-account token was signed by one
//! of the cluster's current signing keys, then validates its claims against
//! the configured issuer, audience, and the clock.
//!
//! # Security Model
//!
//! - The key is selected by the token header's `kid` only; there is no
//!   fallback to other keys in the set
//! - The signing algorithm is pinned to RS256. A token whose header names
//!   any other algorithm is rejected before signature comparison, so a
//!   symmetric-algorithm token can never be checked against key material
//! - Claims are deserialized into a typed structure exactly once, here;
//!   downstream stages never re-interpret raw claim values
//! - [`VerifiedClaims`] can only be constructed by a successful [`TokenVerifier::verify`]

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::keys::{Jwk, SigningKeySet};

/// Token verification errors
///
/// Every variant means the token cannot be trusted; the transport surfaces
/// all of them as unauthorized. Offending values are carried for logs only.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Token cannot be parsed at all
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// Token header has no key identifier
    #[error("missing kid in token header")]
    MissingKeyId,

    /// No key with the header's identifier exists in the signing key set
    #[error("no key found for kid: {0}")]
    UnknownKey(String),

    /// JWK record cannot be converted into a usable public key
    #[error("key format error: {0}")]
    KeyFormat(String),

    /// Signature mismatch, or the header names a non-pinned algorithm
    #[error("token signature verification failed: {0}")]
    Signature(String),

    /// Issuer claim does not equal the configured issuer
    #[error("invalid issuer: {0:?}")]
    InvalidIssuer(Option<String>),

    /// Audience claim does not include the configured audience
    #[error("token audience {0:?} does not include {1:?}")]
    InvalidAudience(Vec<String>, String),

    /// Expiry is not strictly in the future
    #[error("token expired at {0}")]
    TokenExpired(DateTime<Utc>),
}

/// Audience claim: a bare string or a set
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// No audience claim present
    #[default]
    None,
    /// Single audience value
    Single(String),
    /// Audience set
    Multiple(Vec<String>),
}

impl Audience {
    fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::None => false,
            Audience::Single(s) => s == audience,
            Audience::Multiple(v) => v.iter().any(|a| a == audience),
        }
    }

    fn into_vec(self) -> Vec<String> {
        match self {
            Audience::None => vec![],
            Audience::Single(s) => vec![s],
            Audience::Multiple(v) => v,
        }
    }
}

/// Name and UID of a Kubernetes object referenced by the token
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ResourceRef {
    /// Object name
    pub name: String,
    /// Object UID
    #[serde(default)]
    pub uid: String,
}

/// The nested `kubernetes.io` claim of a projected bound token
///
/// Accepts both the `serviceaccount` key Kubernetes emits and the
/// `serviceAccount` spelling some tooling produces.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct KubernetesWorkloadClaims {
    /// Namespace the pod runs in
    pub namespace: String,
    /// Node the pod is bound to
    #[serde(default)]
    pub node: Option<ResourceRef>,
    /// The pod itself
    pub pod: ResourceRef,
    /// Service account the pod runs as
    #[serde(rename = "serviceaccount", alias = "serviceAccount")]
    pub service_account: ResourceRef,
}

/// Raw claim set, deserialized during signature-verified decode
#[derive(Debug, Deserialize)]
struct TokenClaims {
    iss: Option<String>,
    #[serde(default)]
    aud: Audience,
    exp: Option<i64>,
    #[serde(rename = "kubernetes.io")]
    kubernetes: Option<KubernetesWorkloadClaims>,
}

/// Claims from a token whose signature and claims both validated
///
/// Only [`TokenVerifier::verify`] constructs this type: holding one is proof
/// the token was signed by a key in the set it was verified against.
#[derive(Clone, Debug)]
pub struct VerifiedClaims {
    issuer: String,
    audience: Vec<String>,
    expires_at: DateTime<Utc>,
    kubernetes: Option<KubernetesWorkloadClaims>,
}

impl VerifiedClaims {
    /// The token's issuer
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The token's audience set
    pub fn audience(&self) -> &[String] {
        &self.audience
    }

    /// When the token expires
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// The nested Kubernetes execution-context claim, if present
    pub fn kubernetes(&self) -> Option<&KubernetesWorkloadClaims> {
        self.kubernetes.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(kubernetes: Option<KubernetesWorkloadClaims>) -> Self {
        Self {
            issuer: crate::KUBERNETES_ISSUER.to_string(),
            audience: vec![crate::DEFAULT_AUDIENCE.to_string()],
            expires_at: Utc::now() + chrono::Duration::minutes(5),
            kubernetes,
        }
    }
}

/// Verifies PSATs against a signing key set and claim policy
#[derive(Clone, Debug)]
pub struct TokenVerifier {
    issuer: String,
    audience: String,
}

impl TokenVerifier {
    /// Create a verifier expecting the given issuer and audience
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// Verify a token against the supplied key set
    ///
    /// Stages, each short-circuiting: structural parse for `kid`, key
    /// lookup, JWK conversion, RS256-pinned signature check, then issuer /
    /// audience / expiry validation.
    pub fn verify(
        &self,
        token: &str,
        keys: &SigningKeySet,
    ) -> Result<VerifiedClaims, VerifyError> {
        // Structural parse only; no signature is checked here.
        let header =
            decode_header(token).map_err(|e| VerifyError::MalformedToken(e.to_string()))?;
        let kid = header.kid.ok_or(VerifyError::MissingKeyId)?;

        let jwk = keys
            .find(&kid)
            .ok_or_else(|| VerifyError::UnknownKey(kid.clone()))?;
        let key = decoding_key(jwk)?;

        // Pin the algorithm before any signature comparison. A token
        // claiming HS256 must never be checked against RSA key bytes.
        if header.alg != Algorithm::RS256 {
            return Err(VerifyError::Signature(format!(
                "unexpected signing algorithm: {:?}",
                header.alg
            )));
        }

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = Default::default();

        let data = decode::<TokenClaims>(token, &key, &validation).map_err(|e| match e.kind() {
            ErrorKind::Json(_) | ErrorKind::Base64(_) | ErrorKind::Utf8(_) => {
                VerifyError::MalformedToken(e.to_string())
            }
            _ => VerifyError::Signature(e.to_string()),
        })?;
        let claims = data.claims;

        if claims.iss.as_deref() != Some(self.issuer.as_str()) {
            return Err(VerifyError::InvalidIssuer(claims.iss));
        }

        if !claims.aud.contains(&self.audience) {
            return Err(VerifyError::InvalidAudience(
                claims.aud.into_vec(),
                self.audience.clone(),
            ));
        }

        let exp = claims
            .exp
            .ok_or_else(|| VerifyError::MalformedToken("missing exp claim".into()))?;
        let expires_at = DateTime::<Utc>::from_timestamp(exp, 0)
            .ok_or_else(|| VerifyError::MalformedToken(format!("exp out of range: {exp}")))?;
        if expires_at <= Utc::now() {
            return Err(VerifyError::TokenExpired(expires_at));
        }

        debug!(kid = %kid, expires_at = %expires_at, "Token verified");

        Ok(VerifiedClaims {
            issuer: self.issuer.clone(),
            audience: claims.aud.into_vec(),
            expires_at,
            kubernetes: claims.kubernetes,
        })
    }
}

/// Convert a JWK record into a verification key
///
/// Delegates the modulus/exponent decoding to the JOSE library; the
/// contract is that records missing `n` or `e` (or carrying malformed
/// base64url) are rejected, and both 2-byte and 3-byte big-endian exponent
/// encodings convert correctly.
fn decoding_key(jwk: &Jwk) -> Result<DecodingKey, VerifyError> {
    if jwk.kty != "RSA" {
        return Err(VerifyError::KeyFormat(format!(
            "unsupported key type: {}",
            jwk.kty
        )));
    }
    let n = jwk
        .n
        .as_ref()
        .ok_or_else(|| VerifyError::KeyFormat("RSA key missing 'n'".into()))?;
    let e = jwk
        .e
        .as_ref()
        .ok_or_else(|| VerifyError::KeyFormat("RSA key missing 'e'".into()))?;

    DecodingKey::from_rsa_components(n, e).map_err(|err| VerifyError::KeyFormat(err.to_string()))
}
