//! HTTP surface
//!
//! A small axum app exposing SVID issuance to in-cluster workloads. The
//! handler runs the verify, attest, issue pipeline; every failure maps to a
//! generic status body while the detail goes to the logs.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::attest::{AttestError, Attestor, Decision};
use crate::keys::{KeySource, KeySourceError};
use crate::svid::{CaError, CertificateAuthority};
use crate::verify::{TokenVerifier, VerifyError};

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    /// Where signing keys come from
    pub key_source: Arc<dyn KeySource>,
    /// Token verification policy
    pub verifier: TokenVerifier,
    /// Registration matching
    pub attestor: Attestor,
    /// The issuing CA
    pub ca: Arc<CertificateAuthority>,
    /// Trust domain applied when a registration leaves it empty
    pub trust_domain: String,
}

/// Errors a request can fail with
///
/// Response bodies stay generic; the offending detail is logged where the
/// error is converted, never sent back to the caller.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No bearer token on the request
    #[error("missing bearer token")]
    MissingBearer,

    /// Signing keys could not be fetched
    #[error(transparent)]
    KeySource(#[from] KeySourceError),

    /// Token failed verification
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Attestation could not run
    #[error(transparent)]
    Attest(#[from] AttestError),

    /// Workload attested to no registration
    #[error("workload rejected: {0}")]
    Rejected(String),

    /// SVID could not be minted
    #[error(transparent)]
    Issue(#[from] CaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::MissingBearer
            | ApiError::Verify(_)
            | ApiError::Rejected(_)
            | ApiError::Attest(AttestError::ClaimShape(_)) => {
                warn!(error = %self, "Request unauthorized");
                (StatusCode::UNAUTHORIZED, "unauthorized")
            }
            ApiError::KeySource(_) | ApiError::Attest(AttestError::Store(_)) => {
                error!(error = %self, "Upstream dependency unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
            }
            ApiError::Issue(_) => {
                error!(error = %self, "SVID issuance failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        };
        (status, Json(serde_json::json!({ "error": body }))).into_response()
    }
}

/// SVID issuance response
#[derive(Clone, Debug, Serialize)]
pub struct SvidResponse {
    /// The identity the certificate asserts
    pub spiffe_id: String,
    /// Leaf certificate, base64 DER
    pub svid: String,
    /// Leaf private key, PKCS#8 PEM
    pub private_key_pem: String,
    /// The issuing CA certificate, PEM
    pub ca_certificate_pem: String,
}

/// Pull the bearer token out of an Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Issue an SVID for the workload presenting a PSAT
///
/// Stages short-circuit in order: bearer extraction, key fetch, token
/// verification, attestation, issuance. Nothing past a failed stage runs;
/// in particular no key fetch happens for a request without a token.
pub async fn svid_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SvidResponse>, ApiError> {
    let token = extract_bearer_token(&headers).ok_or(ApiError::MissingBearer)?;

    let keys = state.key_source.fetch().await?;
    let claims = state.verifier.verify(token, &keys)?;

    let (identity, mut registration) = match state.attestor.attest(&claims).await? {
        Decision::Attested {
            identity,
            registration,
        } => (identity, registration),
        Decision::Rejected { reason, .. } => return Err(ApiError::Rejected(reason)),
    };

    if registration.trust_domain.is_empty() {
        registration.trust_domain = state.trust_domain.clone();
    }

    let svid = state.ca.issue(&identity, &registration)?;

    Ok(Json(SvidResponse {
        spiffe_id: svid.spiffe_id.to_string(),
        svid: BASE64.encode(&svid.certificate_der),
        private_key_pem: svid.private_key_pem,
        ca_certificate_pem: state.ca.ca_cert_pem().to_string(),
    }))
}

async fn healthz() -> &'static str {
    "ok"
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/svid", get(svid_handler).post(svid_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn start_server(
    state: AppState,
    bind_addr: std::net::SocketAddr,
) -> Result<(), crate::Error> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| crate::Error::server(format!("failed to bind {bind_addr}: {e}")))?;
    info!(addr = %bind_addr, "SVID issuer listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| crate::Error::server(e.to_string()))
}
