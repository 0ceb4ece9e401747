//! Discovery enumerates the namespaced kinds the cluster can mirror.
//!
//! A kind is a candidate when the server advertises the full
//! get/list/watch/create/update/delete verb set on a namespaced,
//! non-subresource endpoint and it is not on the deny list. High-cardinality
//! kinds pass through with a one-time warning.

use std::{
    collections::BTreeSet,
    sync::{Mutex, RwLock},
    time::Duration,
};

use kube::{
    Client,
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope, pinned_kind, verbs},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{Error, Result};

// Kinds that are never mirrored: high-churn primitives, server-managed
// bookkeeping, and workload state that makes no sense copied across
// namespaces.
const DENY_KINDS: [&str; 13] = [
    "Pod",
    "Event",
    "Endpoints",
    "EndpointSlice",
    "Node",
    "Lease",
    "Job",
    "CronJob",
    "ReplicaSet",
    "ControllerRevision",
    "PodTemplate",
    "TokenRequest",
    "TokenReview",
];

// Operator-internal API groups: their objects are reconciled by their own
// controllers and mirroring them causes fights.
const DENY_GROUPS: [&str; 16] = [
    "cert-manager.io",
    "acme.cert-manager.io",
    "external-secrets.io",
    "argoproj.io",
    "kyverno.io",
    "cilium.io",
    "longhorn.io",
    "gateway.networking.k8s.io",
    "monitoring.coreos.com",
    "logging.banzaicloud.io",
    "velero.io",
    "tekton.dev",
    "operators.coreos.com",
    "snapshot.storage.k8s.io",
    "metrics.k8s.io",
    "events.k8s.io",
];

// Kinds that explode in object count on busy clusters. Allowed, but the
// operator gets one warning per process.
const HIGH_CARDINALITY: [&str; 6] = [
    "Role",
    "RoleBinding",
    "NetworkPolicy",
    "ServiceMonitor",
    "PodMonitor",
    "Ingress",
];

/// DiscoveredKind is one mirrorable kind with its resolved API coordinates.
#[derive(Clone, Debug)]
pub struct DiscoveredKind {
    /// The resolved API resource, plural included.
    pub resource: ApiResource,
}

impl DiscoveredKind {
    /// Key is the registration key and controller name stem,
    /// `kind.version.group` (group omitted for the core group).
    pub fn key(&self) -> String {
        kind_key(&self.resource)
    }
}

/// Kind_key derives the `kind.version.group` registration key.
pub fn kind_key(ar: &ApiResource) -> String {
    let kind = ar.kind.to_ascii_lowercase();
    if ar.group.is_empty() {
        format!("{}.{}", kind, ar.version)
    } else {
        format!("{}.{}.{}", kind, ar.version, ar.group)
    }
}

/// DiscoveryManager periodically publishes the current candidate kind set.
pub struct DiscoveryManager {
    client: Client,
    interval: Duration,
    explicit: Vec<String>,
    kinds: RwLock<Vec<DiscoveredKind>>,
    warned: Mutex<BTreeSet<String>>,
}

impl DiscoveryManager {
    /// New builds a manager. A non-empty `explicit` list of
    /// `Kind.version.group` strings disables auto-discovery.
    pub fn new(client: Client, interval: Duration, explicit: Vec<String>) -> DiscoveryManager {
        DiscoveryManager {
            client,
            interval,
            explicit,
            kinds: RwLock::new(Vec::new()),
            warned: Mutex::new(BTreeSet::new()),
        }
    }

    /// Current snapshots the last published kind set.
    pub fn current(&self) -> Vec<DiscoveredKind> {
        self.kinds.read().expect("discovery lock poisoned").clone()
    }

    /// Refresh re-enumerates the kind set and publishes it. Group-level
    /// failures are logged and skipped; the refresh fails only when nothing
    /// could be enumerated at all.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize> {
        let found = if self.explicit.is_empty() {
            self.discover().await?
        } else {
            self.resolve_explicit().await?
        };
        let ct = found.len();
        debug!(kinds = ct, "discovery refreshed");
        *self.kinds.write().expect("discovery lock poisoned") = found;
        Ok(ct)
    }

    /// Run refreshes immediately, then on every interval tick until
    /// cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("discovery manager stopping");
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "discovery refresh failed");
                    }
                }
            }
        }
    }

    async fn discover(&self) -> Result<Vec<DiscoveredKind>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;

        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !self.admissible(&ar, caps.scope == Scope::Namespaced, |v| {
                    caps.supports_operation(v)
                }) {
                    continue;
                }
                out.push(DiscoveredKind { resource: ar });
            }
        }
        Ok(out)
    }

    async fn resolve_explicit(&self) -> Result<Vec<DiscoveredKind>> {
        let mut out = Vec::new();
        for spec in &self.explicit {
            let Some(gvk) = parse_kind_spec(spec) else {
                warn!(spec, "unparseable kind, skipping");
                continue;
            };
            // Per-kind resolution failures are tolerated: the kind may not
            // exist on this cluster yet.
            match pinned_kind(&self.client, &gvk).await {
                Ok((ar, caps)) => {
                    if self.admissible(&ar, caps.scope == Scope::Namespaced, |v| {
                        caps.supports_operation(v)
                    }) {
                        out.push(DiscoveredKind { resource: ar });
                    }
                }
                Err(e) => debug!(spec, error = %e, "kind not resolvable"),
            }
        }
        Ok(out)
    }

    fn admissible(
        &self,
        ar: &ApiResource,
        namespaced: bool,
        supports: impl Fn(&str) -> bool,
    ) -> bool {
        if !namespaced || ar.plural.contains('/') {
            return false;
        }
        let required = [
            verbs::GET,
            verbs::LIST,
            verbs::WATCH,
            verbs::CREATE,
            verbs::UPDATE,
            verbs::DELETE,
        ];
        if !required.iter().all(|v| supports(v)) {
            return false;
        }
        if DENY_KINDS.contains(&ar.kind.as_str()) || DENY_GROUPS.contains(&ar.group.as_str()) {
            return false;
        }
        if HIGH_CARDINALITY.contains(&ar.kind.as_str()) {
            let mut warned = self.warned.lock().expect("discovery lock poisoned");
            if warned.insert(kind_key(ar)) {
                warn!(
                    kind = ar.kind,
                    group = ar.group,
                    "mirroring a high-cardinality kind; expect heavy list/watch traffic"
                );
            }
        }
        true
    }
}

/// Parse_kind_spec reads a `Kind.version.group` string; the group may be
/// empty (`Secret.v1`) or dotted (`Widget.v1.example.com`).
pub fn parse_kind_spec(spec: &str) -> Option<GroupVersionKind> {
    let mut parts = spec.splitn(3, '.');
    let kind = parts.next().filter(|s| !s.is_empty())?;
    let version = parts.next().filter(|s| !s.is_empty())?;
    let group = parts.next().unwrap_or("");
    Some(GroupVersionKind::gvk(group, version, kind))
}
