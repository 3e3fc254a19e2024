//! End-to-end issuance scenarios driven through the public API: a minted
//! PSAT goes through key lookup, verification, attestation, and issuance
//! exactly as an in-cluster workload's request would.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use kubespiffe::attest::{Attestor, MemoryRegistrationStore};
use kubespiffe::crd::WorkloadRegistrationSpec;
use kubespiffe::keys::{SigningKeySet, StaticKeySource};
use kubespiffe::server::{router, AppState};
use kubespiffe::svid::CertificateAuthority;
use kubespiffe::verify::TokenVerifier;
use kubespiffe::{DEFAULT_AUDIENCE, KUBERNETES_ISSUER};

const RSA_2048_PEM: &str = include_str!("fixtures/rsa2048.pem");
const JWKS_JSON: &str = include_str!("fixtures/jwks.json");
const KID: &str = "K1";

fn psat(namespace: &str, pod: &str, service_account: &str) -> String {
    let claims = json!({
        "iss": KUBERNETES_ISSUER,
        "aud": [DEFAULT_AUDIENCE],
        "exp": chrono::Utc::now().timestamp() + 600,
        "kubernetes.io": {
            "namespace": namespace,
            "node": { "name": "node-1", "uid": "node-uid" },
            "pod": { "name": pod, "uid": "pod-uid" },
            "serviceaccount": { "name": service_account, "uid": "sa-uid" },
        },
    });
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(RSA_2048_PEM.as_bytes()).unwrap();
    encode(&header, &claims, &key).unwrap()
}

fn issuer_state(store: MemoryRegistrationStore) -> AppState {
    let keys = SigningKeySet::from_json(JWKS_JSON).unwrap();
    AppState {
        key_source: Arc::new(StaticKeySource::new(keys)),
        verifier: TokenVerifier::new(KUBERNETES_ISSUER, DEFAULT_AUDIENCE),
        attestor: Attestor::new(Arc::new(store)),
        ca: Arc::new(CertificateAuthority::bootstrap("example.org").unwrap()),
        trust_domain: "example.org".to_string(),
    }
}

fn registration(spiffe_id: Option<&str>) -> WorkloadRegistrationSpec {
    WorkloadRegistrationSpec {
        trust_domain: "example.org".to_string(),
        trust_zone_id: "prod".to_string(),
        spiffe_id: spiffe_id.map(String::from),
    }
}

async fn issue(state: AppState, token: &str) -> (StatusCode, Value) {
    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/v1/svid")
                .method("POST")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn registered_deployment_pod_gets_a_chain_that_verifies() {
    let store = MemoryRegistrationStore::new();
    store.insert("payments", "checkout", registration(None));

    let (status, body) = issue(
        issuer_state(store),
        &psat("payments", "checkout-6f7d9b-k2x8", "checkout-sa"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["spiffe_id"],
        "spiffe://example.org/prod/payments/checkout-sa"
    );

    // The returned leaf chains to the returned CA.
    let leaf_der = BASE64.decode(body["svid"].as_str().unwrap()).unwrap();
    let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();

    let ca_pem = body["ca_certificate_pem"].as_str().unwrap();
    let ca_der = pem::parse(ca_pem.as_bytes()).unwrap().contents().to_vec();
    let (_, ca_cert) = X509Certificate::from_der(&ca_der).unwrap();
    assert!(leaf.verify_signature(Some(ca_cert.public_key())).is_ok());

    // Identity is in the SAN, lifetime is five minutes.
    let san = leaf.subject_alternative_name().unwrap().unwrap();
    assert!(san.value.general_names.iter().any(|n| matches!(
        n,
        GeneralName::URI("spiffe://example.org/prod/payments/checkout-sa")
    )));
    let lifetime =
        leaf.validity().not_after.timestamp() - leaf.validity().not_before.timestamp();
    assert_eq!(lifetime, 300);

    // The caller gets the leaf key.
    assert!(body["private_key_pem"]
        .as_str()
        .unwrap()
        .contains("BEGIN PRIVATE KEY"));
}

#[tokio::test]
async fn explicit_registration_spiffe_id_is_used_verbatim() {
    let store = MemoryRegistrationStore::new();
    store.insert(
        "payments",
        "checkout",
        registration(Some("spiffe://example.org/legacy/checkout")),
    );

    let (status, body) = issue(
        issuer_state(store),
        &psat("payments", "checkout-1", "checkout-sa"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["spiffe_id"], "spiffe://example.org/legacy/checkout");
}

#[tokio::test]
async fn workload_without_registration_is_refused() {
    let (status, body) = issue(
        issuer_state(MemoryRegistrationStore::new()),
        &psat("payments", "checkout-1", "checkout-sa"),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "unauthorized" }));
}

#[tokio::test]
async fn registration_in_wrong_namespace_does_not_authorize() {
    let store = MemoryRegistrationStore::new();
    store.insert("staging", "checkout", registration(None));

    let (status, _) = issue(
        issuer_state(store),
        &psat("payments", "checkout-1", "checkout-sa"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn token_signed_by_an_unknown_key_is_refused() {
    let store = MemoryRegistrationStore::new();
    store.insert("payments", "checkout", registration(None));

    let claims = json!({
        "iss": KUBERNETES_ISSUER,
        "aud": [DEFAULT_AUDIENCE],
        "exp": chrono::Utc::now().timestamp() + 600,
    });
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("rotated-out".to_string());
    let key = EncodingKey::from_rsa_pem(RSA_2048_PEM.as_bytes()).unwrap();
    let token = encode(&header, &claims, &key).unwrap();

    let (status, _) = issue(issuer_state(store), &token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn reissuance_rotates_the_leaf_but_keeps_the_identity() {
    let store = MemoryRegistrationStore::new();
    store.insert("payments", "checkout", registration(None));
    let state = issuer_state(store);
    let token = psat("payments", "checkout-1", "checkout-sa");

    let (status_a, body_a) = issue(state.clone(), &token).await;
    let (status_b, body_b) = issue(state, &token).await;

    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert_eq!(body_a["spiffe_id"], body_b["spiffe_id"]);
    assert_ne!(body_a["svid"], body_b["svid"]);
    assert_ne!(body_a["private_key_pem"], body_b["private_key_pem"]);
}
