//! Workload attestation
//!
//! Maps the Kubernetes execution context of a verified token onto a
//! [`WorkloadRegistration`] resource. A workload is attested when a
//! registration exists in its namespace under the name derived from its
//! pod; otherwise it is rejected with an auditable reason.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::Api;
use kube::Client;
use thiserror::Error;
use tracing::{info, warn};

use crate::crd::{WorkloadRegistration, WorkloadRegistrationSpec};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::verify::VerifiedClaims;

/// Attestation errors
#[derive(Debug, Error)]
pub enum AttestError {
    /// Verified token does not carry a usable Kubernetes claim
    #[error("token claims unusable for attestation: {0}")]
    ClaimShape(String),

    /// Registration store is unreachable
    #[error("registration store error: {0}")]
    Store(String),
}

/// Workload identity extracted from verified token claims
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadIdentity {
    /// Namespace the workload runs in
    pub namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Pod UID
    pub pod_uid: String,
    /// Service account name
    pub service_account: String,
    /// Service account UID
    pub service_account_uid: String,
    /// Node the pod is scheduled on, when the token carries it
    pub node_name: Option<String>,
}

/// Maps a workload identity onto the registration name to look up
pub trait WorkloadSelector: Send + Sync {
    /// Registration name for this workload
    fn registration_name(&self, identity: &WorkloadIdentity) -> String;
}

/// Selects by the pod name's first dash-separated segment
///
/// Deployment-managed pods are named `<deployment>-<replicaset-hash>-<pod-hash>`,
/// so the first segment is the stable workload name. Pods without a dash
/// select under their full name.
#[derive(Clone, Copy, Debug, Default)]
pub struct PodNamePrefixSelector;

impl WorkloadSelector for PodNamePrefixSelector {
    fn registration_name(&self, identity: &WorkloadIdentity) -> String {
        identity
            .pod_name
            .split('-')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// Source of workload registrations
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Fetch the registration with the given name in the given namespace
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadRegistration>, AttestError>;
}

/// Registration store backed by the Kubernetes API
///
/// Lookups are retried with backoff so a transient apiserver hiccup does
/// not reject an otherwise attestable workload.
pub struct KubeRegistrationStore {
    client: Client,
    retry: RetryConfig,
}

impl KubeRegistrationStore {
    /// Create a store over the given cluster client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::with_max_attempts(3),
        }
    }
}

#[async_trait]
impl RegistrationStore for KubeRegistrationStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadRegistration>, AttestError> {
        let api: Api<WorkloadRegistration> = Api::namespaced(self.client.clone(), namespace);
        retry_with_backoff(&self.retry, "get_workload_registration", || async {
            api.get_opt(name).await
        })
        .await
        .map_err(|e| AttestError::Store(e.to_string()))
    }
}

/// In-memory registration store
///
/// Used by tests and local runs; keyed by namespace and name like the
/// cluster-backed store.
#[derive(Default)]
pub struct MemoryRegistrationStore {
    registrations: DashMap<(String, String), WorkloadRegistration>,
}

impl MemoryRegistrationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a registration under a namespace and name
    pub fn insert(&self, namespace: &str, name: &str, spec: WorkloadRegistrationSpec) {
        self.registrations.insert(
            (namespace.to_string(), name.to_string()),
            WorkloadRegistration::new(name, spec),
        );
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadRegistration>, AttestError> {
        Ok(self
            .registrations
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.value().clone()))
    }
}

/// Outcome of attesting one workload
#[derive(Clone, Debug)]
pub enum Decision {
    /// A registration authorizes this workload
    Attested {
        /// The workload that was attested
        identity: WorkloadIdentity,
        /// The matched registration's spec
        registration: WorkloadRegistrationSpec,
    },
    /// No registration authorizes this workload
    Rejected {
        /// The workload that was rejected
        identity: WorkloadIdentity,
        /// Why, for the audit log
        reason: String,
    },
}

/// Attests verified workloads against the registration store
#[derive(Clone)]
pub struct Attestor {
    store: Arc<dyn RegistrationStore>,
    selector: Arc<dyn WorkloadSelector>,
}

impl Attestor {
    /// Create an attestor with the default pod-name-prefix selector
    pub fn new(store: Arc<dyn RegistrationStore>) -> Self {
        Self {
            store,
            selector: Arc::new(PodNamePrefixSelector),
        }
    }

    /// Replace the selection strategy
    pub fn with_selector(mut self, selector: Arc<dyn WorkloadSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Attest the workload behind a set of verified claims
    ///
    /// Returns `Err` only when the claims are unusable or the store fails;
    /// an unregistered workload is a `Rejected` decision, not an error.
    pub async fn attest(&self, claims: &VerifiedClaims) -> Result<Decision, AttestError> {
        let k8s = claims
            .kubernetes()
            .ok_or_else(|| AttestError::ClaimShape("missing kubernetes.io claim".into()))?;

        let identity = WorkloadIdentity {
            namespace: k8s.namespace.clone(),
            pod_name: k8s.pod.name.clone(),
            pod_uid: k8s.pod.uid.clone(),
            service_account: k8s.service_account.name.clone(),
            service_account_uid: k8s.service_account.uid.clone(),
            node_name: k8s.node.as_ref().map(|n| n.name.clone()),
        };

        let name = self.selector.registration_name(&identity);
        if name.is_empty() {
            let reason = format!("no registration name derivable from pod {:?}", identity.pod_name);
            warn!(
                pod = %identity.pod_name,
                namespace = %identity.namespace,
                "Workload rejected: {reason}"
            );
            return Ok(Decision::Rejected { identity, reason });
        }

        match self.store.get(&identity.namespace, &name).await? {
            Some(registration) => {
                info!(
                    pod = %identity.pod_name,
                    namespace = %identity.namespace,
                    service_account = %identity.service_account,
                    registration = %name,
                    "Pod attested"
                );
                Ok(Decision::Attested {
                    identity,
                    registration: registration.spec,
                })
            }
            None => {
                let reason =
                    format!("no WorkloadRegistration {:?} in namespace {:?}", name, identity.namespace);
                warn!(
                    pod = %identity.pod_name,
                    namespace = %identity.namespace,
                    registration = %name,
                    "Workload rejected: no matching registration"
                );
                Ok(Decision::Rejected { identity, reason })
            }
        }
    }
}
