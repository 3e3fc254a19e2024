//! Custom Resource Definitions for kubespiffe
//!
//! A `WorkloadRegistration` is the operator-owned policy record that allows a
//! workload to receive an SVID. Attestation looks registrations up by the
//! name derived from the workload's pod name, within the workload's
//! namespace. The pipeline only ever reads these resources.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a WorkloadRegistration
///
/// The trust domain and trust zone become part of the SPIFFE identity issued
/// to matching workloads. An explicit `spiffeId` overrides the derived
/// identity entirely.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubespiffe.io",
    version = "v1alpha1",
    kind = "WorkloadRegistration",
    plural = "workloadregistrations",
    shortname = "wr",
    status = "WorkloadRegistrationStatus",
    namespaced,
    printcolumn = r#"{"name":"TrustDomain","type":"string","jsonPath":".spec.trustDomain"}"#,
    printcolumn = r#"{"name":"TrustZone","type":"string","jsonPath":".spec.trustZoneId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRegistrationSpec {
    /// SPIFFE trust domain identities are issued under (e.g. `example.org`)
    pub trust_domain: String,

    /// Trust zone identifier, used as the leading SPIFFE path segment
    pub trust_zone_id: String,

    /// Explicit SPIFFE ID for matching workloads; when set it is used
    /// verbatim instead of the derived `spiffe://<domain>/<zone>/...` form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spiffe_id: Option<String>,
}

/// Status for a WorkloadRegistration (currently empty)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct WorkloadRegistrationStatus {}
