//! SVID issuance
//!
//! Holds the in-memory certificate authority and mints short-lived X.509
//! SVIDs for attested workloads. The CA keypair is generated at startup
//! and held as PEM; leaf certificates carry the workload's SPIFFE ID as a
//! URI SAN and live for five minutes.

use std::fmt;

use dashmap::DashMap;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::attest::WorkloadIdentity;
use crate::crd::WorkloadRegistrationSpec;

/// Certificate authority lifetime
const CA_VALIDITY: Duration = Duration::hours(24);

/// Leaf SVID lifetime
const SVID_VALIDITY: Duration = Duration::minutes(5);

/// Issuance records kept for introspection
const ISSUANCE_RECORD_CAP: usize = 1024;

/// Certificate authority errors
#[derive(Debug, Error)]
pub enum CaError {
    /// CA keypair or self-signed certificate generation failed
    #[error("CA bootstrap failed: {0}")]
    Bootstrap(String),

    /// SPIFFE ID cannot be built or encoded into a SAN
    #[error("identity encoding failed: {0}")]
    IdentityEncoding(String),

    /// Leaf certificate signing failed
    #[error("certificate signing failed: {0}")]
    Signing(String),
}

/// A validated SPIFFE identity URI
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpiffeId(String);

impl SpiffeId {
    /// Parse and validate a SPIFFE URI
    ///
    /// Requires the `spiffe://` scheme, a non-empty trust domain of
    /// lowercase alphanumerics plus `.`, `-` and `_`, and non-empty path
    /// segments without `.` or `..` traversal.
    pub fn parse(value: &str) -> Result<Self, CaError> {
        let rest = value
            .strip_prefix("spiffe://")
            .ok_or_else(|| CaError::IdentityEncoding(format!("not a spiffe URI: {value:?}")))?;

        let (trust_domain, path) = match rest.split_once('/') {
            Some((td, path)) => (td, Some(path)),
            None => (rest, None),
        };

        if trust_domain.is_empty()
            || !trust_domain
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || ".-_".contains(c))
        {
            return Err(CaError::IdentityEncoding(format!(
                "invalid trust domain: {trust_domain:?}"
            )));
        }

        if let Some(path) = path {
            for segment in path.split('/') {
                if segment.is_empty() || segment == "." || segment == ".." {
                    return Err(CaError::IdentityEncoding(format!(
                        "invalid path segment in {value:?}"
                    )));
                }
                if !segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || ".-_".contains(c))
                {
                    return Err(CaError::IdentityEncoding(format!(
                        "invalid character in path segment {segment:?}"
                    )));
                }
            }
        }

        Ok(Self(value.to_string()))
    }

    /// Build the SPIFFE ID for a registration and workload
    ///
    /// An explicit `spiffeId` on the registration is used verbatim (after
    /// validation). Otherwise the ID is derived as
    /// `spiffe://<trustDomain>/<trustZoneId>/<namespace>/<serviceAccount>`.
    pub fn from_registration(
        registration: &WorkloadRegistrationSpec,
        identity: &WorkloadIdentity,
    ) -> Result<Self, CaError> {
        match &registration.spiffe_id {
            Some(explicit) => Self::parse(explicit),
            None => Self::parse(&format!(
                "spiffe://{}/{}/{}/{}",
                registration.trust_domain,
                registration.trust_zone_id,
                identity.namespace,
                identity.service_account
            )),
        }
    }

    /// The URI as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An SVID minted for one workload
#[derive(Clone, Debug)]
pub struct IssuedSvid {
    /// The identity the certificate asserts
    pub spiffe_id: SpiffeId,
    /// Leaf certificate, DER
    pub certificate_der: Vec<u8>,
    /// Leaf private key, PKCS#8 PEM
    pub private_key_pem: String,
}

/// In-memory certificate authority
///
/// The key material is generated at bootstrap and held only as PEM strings;
/// a signing `Issuer` is rebuilt from them per issuance. Issued leaves are
/// recorded by SPIFFE ID for introspection, capped at
/// [`ISSUANCE_RECORD_CAP`] entries.
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
    issued: DashMap<String, Vec<u8>>,
}

impl CertificateAuthority {
    /// Generate a fresh ECDSA P-256 CA, self-signed, valid for 24 hours
    pub fn bootstrap(trust_domain: &str) -> Result<Self, CaError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("kubespiffe CA for {trust_domain}"));
        dn.push(DnType::OrganizationName, "kubespiffe");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + CA_VALIDITY;
        params.serial_number = Some(SerialNumber::from_slice(
            &rand::random::<u64>().to_be_bytes(),
        ));

        let key = KeyPair::generate().map_err(|e| CaError::Bootstrap(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| CaError::Bootstrap(e.to_string()))?;

        info!(trust_domain = %trust_domain, not_after = %params.not_after, "Certificate authority bootstrapped");

        Ok(Self {
            ca_key_pem: key.serialize_pem(),
            ca_cert_pem: cert.pem(),
            issued: DashMap::new(),
        })
    }

    /// Mint a five-minute SVID for an attested workload
    pub fn issue(
        &self,
        identity: &WorkloadIdentity,
        registration: &WorkloadRegistrationSpec,
    ) -> Result<IssuedSvid, CaError> {
        let spiffe_id = SpiffeId::from_registration(registration, identity)?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, spiffe_id.as_str());
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let uri = Ia5String::try_from(spiffe_id.as_str())
            .map_err(|e| CaError::IdentityEncoding(e.to_string()))?;
        params.subject_alt_names = vec![SanType::URI(uri)];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + SVID_VALIDITY;
        params.serial_number = Some(SerialNumber::from_slice(
            &rand::random::<u64>().to_be_bytes(),
        ));

        let leaf_key = KeyPair::generate().map_err(|e| CaError::Signing(e.to_string()))?;
        let ca_key =
            KeyPair::from_pem(&self.ca_key_pem).map_err(|e| CaError::Signing(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| CaError::Signing(e.to_string()))?;
        let cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        let certificate_der = cert.der().to_vec();

        record_issuance(
            &self.issued,
            ISSUANCE_RECORD_CAP,
            spiffe_id.as_str(),
            &certificate_der,
        );

        info!(
            spiffe_id = %spiffe_id,
            pod = %identity.pod_name,
            namespace = %identity.namespace,
            not_after = %params.not_after,
            "SVID issued"
        );

        Ok(IssuedSvid {
            spiffe_id,
            certificate_der,
            private_key_pem: leaf_key.serialize_pem(),
        })
    }

    /// The CA certificate, PEM
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The most recent certificate issued for a SPIFFE ID
    pub fn issued_svid(&self, spiffe_id: &str) -> Option<Vec<u8>> {
        self.issued.get(spiffe_id).map(|c| c.value().clone())
    }

    /// Number of distinct identities with a recorded issuance
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}

/// Record an issuance, bounded to `cap` distinct identities
///
/// An already-recorded identity is refreshed in place under its entry lock.
/// New identities are admitted only while the record is below the cap; the
/// admission check reads the size before taking the entry lock, so the cap
/// is approximate when distinct new identities are issued concurrently.
fn record_issuance(issued: &DashMap<String, Vec<u8>>, cap: usize, spiffe_id: &str, der: &[u8]) {
    use dashmap::mapref::entry::Entry;

    // len() takes shard locks, so it cannot run while the entry is held.
    let recorded = issued.len();
    match issued.entry(spiffe_id.to_string()) {
        Entry::Occupied(mut entry) => {
            entry.insert(der.to_vec());
        }
        Entry::Vacant(entry) => {
            if recorded < cap {
                entry.insert(der.to_vec());
            }
        }
    }
}
