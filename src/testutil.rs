//! Shared test fixtures: static RSA keys and token minting helpers.

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

use crate::keys::SigningKeySet;
use crate::{DEFAULT_AUDIENCE, KUBERNETES_ISSUER};

/// 2048-bit RSA key with the common e=65537 exponent
pub const RSA_2048_PEM: &str = include_str!("../tests/fixtures/rsa2048.pem");

/// Second e=65537 key, not present in the JWKS fixture
pub const RSA_2048_B_PEM: &str = include_str!("../tests/fixtures/rsa2048_b.pem");

/// Token signed by the e=257 key under kid `K2`, minted offline with
/// openssl and far-future expiry: the signing backend refuses to sign
/// with a two-byte exponent, so this signature cannot be produced here.
pub const PSAT_E257_JWT: &str = include_str!("../tests/fixtures/psat_e257.jwt");

/// JWKS document holding the public halves of both fixture keys
pub const JWKS_JSON: &str = include_str!("../tests/fixtures/jwks.json");

pub const KID_RSA_2048: &str = "K1";
pub const KID_RSA_2048_E257: &str = "K2";

pub fn test_key_set() -> SigningKeySet {
    SigningKeySet::from_json(JWKS_JSON).expect("fixture JWKS parses")
}

/// Claims shaped like a projected bound service-account token
pub fn psat_claims(namespace: &str, pod: &str, service_account: &str, exp: i64) -> Value {
    json!({
        "iss": KUBERNETES_ISSUER,
        "aud": [DEFAULT_AUDIENCE],
        "exp": exp,
        "kubernetes.io": {
            "namespace": namespace,
            "node": { "name": "node-1", "uid": "node-uid-1" },
            "pod": { "name": pod, "uid": "pod-uid-1" },
            "serviceaccount": { "name": service_account, "uid": "sa-uid-1" },
        },
    })
}

pub fn sign_token(key_pem: &str, kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(key_pem.as_bytes()).expect("fixture key parses");
    encode(&header, claims, &key).expect("token signs")
}

pub fn sign_token_without_kid(key_pem: &str, claims: &Value) -> String {
    let header = Header::new(Algorithm::RS256);
    let key = EncodingKey::from_rsa_pem(key_pem.as_bytes()).expect("fixture key parses");
    encode(&header, claims, &key).expect("token signs")
}

pub fn sign_token_hs256(kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_secret(b"not-an-rsa-key");
    encode(&header, claims, &key).expect("token signs")
}

/// A well-formed PSAT for the fixture cluster, valid for an hour
pub fn signed_psat(namespace: &str, pod: &str, service_account: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + 3600;
    let claims = psat_claims(namespace, pod, service_account, exp);
    sign_token(RSA_2048_PEM, KID_RSA_2048, &claims)
}
