//! Manager lazily registers per-kind controllers as kinds come into use.
//!
//! A periodic scan lists, per candidate kind, any object carrying the
//! enablement label (always through the API server, never a cache: a
//! first-time-labeled object must not be missed). Kinds with at least one
//! such object get a source controller and a mirror controller. Nothing is
//! ever unregistered; inactive kinds simply receive no events.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use kube::api::{Api, DynamicObject, ListParams};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::discovery::{DiscoveredKind, DiscoveryManager};
use crate::{Context, ControllerFuture, Result, mirrors, sources};
use api::keys;

/// Registration is the per-kind controller state. There is no path back to
/// `NotRegistered`: the runtime cannot tear a controller down, so
/// registration only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// No controllers registered for the kind.
    NotRegistered,
    /// The source controller is running but the mirror controller failed to
    /// start; the mirror half is retried on every scan.
    SourceOnly,
    /// Both controllers are running.
    FullyRegistered,
}

// Decides the post-registration state given what just succeeded.
fn next_state(cur: Registration, source_ok: bool, mirror_ok: bool) -> Registration {
    use Registration::*;
    match (cur, source_ok, mirror_ok) {
        (NotRegistered, false, _) => NotRegistered,
        (NotRegistered, true, false) => SourceOnly,
        (NotRegistered, true, true) => FullyRegistered,
        (SourceOnly, _, true) => FullyRegistered,
        (SourceOnly, _, false) => SourceOnly,
        (FullyRegistered, _, _) => FullyRegistered,
    }
}

/// DynamicControllerManager owns the registration map and the scan loop.
pub struct DynamicControllerManager {
    ctx: Arc<Context>,
    discovery: Arc<DiscoveryManager>,
    cancel: CancellationToken,
    registry: RwLock<BTreeMap<String, Registration>>,
    active: RwLock<BTreeMap<String, DiscoveredKind>>,
}

impl DynamicControllerManager {
    /// New builds a manager. Controllers spawned later shut down on
    /// `cancel`.
    pub fn new(
        ctx: Arc<Context>,
        discovery: Arc<DiscoveryManager>,
        cancel: CancellationToken,
    ) -> DynamicControllerManager {
        DynamicControllerManager {
            ctx,
            discovery,
            cancel,
            registry: RwLock::new(BTreeMap::new()),
            active: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registration reports the state for a `kind.version.group` key.
    pub fn registration(&self, key: &str) -> Registration {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(Registration::NotRegistered)
    }

    /// Registered_kinds lists the kinds with at least a source controller
    /// running. The namespace watcher enumerates sources through this.
    pub fn registered_kinds(&self) -> Vec<DiscoveredKind> {
        self.active
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Scan walks the candidate kinds once, registering controllers for any
    /// kind that has become active. Per-kind list failures are ignored: the
    /// kind may not exist on this cluster.
    #[instrument(skip(self))]
    pub async fn scan(&self) -> Result<()> {
        let candidates = self.discovery.current();
        let total = candidates.len();
        let mut activated: usize = 0;

        for kind in candidates {
            let key = kind.key();
            if self.registration(&key) == Registration::FullyRegistered {
                continue;
            }
            let api: Api<DynamicObject> =
                Api::all_with(self.ctx.client.clone(), &kind.resource);
            let lp = ListParams::default()
                .labels(&format!("{}={}", keys::ENABLED_LABEL, keys::TRUE_VALUE))
                .limit(1);
            let list = match api.list(&lp).await {
                Ok(l) => l,
                Err(e) => {
                    debug!(kind = key, error = %e, "kind not listable, skipping");
                    continue;
                }
            };
            if list.items.is_empty() {
                continue;
            }
            activated = activated.saturating_add(1);
            self.register(&kind);
        }

        let open = self.ctx.breaker.open_circuits();
        if !open.is_empty() {
            warn!(circuits = ?open, "sources with open circuits");
        }
        info!(candidates = total, activated, "scan finished");
        Ok(())
    }

    // Registers whichever controller halves are still missing for the kind
    // and records the resulting state.
    fn register(&self, kind: &DiscoveredKind) {
        let key = kind.key();
        let cur = self.registration(&key);

        let (source_ok, mirror_ok) = match cur {
            Registration::FullyRegistered => return,
            Registration::SourceOnly => (true, self.spawn_mirror(kind)),
            Registration::NotRegistered => {
                let source_ok = self.spawn_source(kind);
                let mirror_ok = source_ok && self.spawn_mirror(kind);
                (source_ok, mirror_ok)
            }
        };

        let next = next_state(cur, source_ok, mirror_ok);
        if next != cur {
            info!(kind = key, state = ?next, "registration updated");
        }
        self.registry
            .write()
            .expect("registry lock poisoned")
            .insert(key.clone(), next);
        if source_ok {
            self.active
                .write()
                .expect("registry lock poisoned")
                .entry(key)
                .or_insert_with(|| kind.clone());
        }
    }

    fn spawn_source(&self, kind: &DiscoveredKind) -> bool {
        match sources::controller(self.cancel.clone(), self.ctx.clone(), kind) {
            Ok(fut) => {
                spawn_logged(kind.key(), fut);
                true
            }
            Err(e) => {
                warn!(kind = kind.key(), error = %e, "source controller failed to start");
                false
            }
        }
    }

    fn spawn_mirror(&self, kind: &DiscoveredKind) -> bool {
        match mirrors::controller(self.cancel.clone(), self.ctx.clone(), kind) {
            Ok(fut) => {
                spawn_logged(format!("{}-mirror", kind.key()), fut);
                true
            }
            Err(e) => {
                warn!(kind = kind.key(), error = %e, "mirror controller failed to start");
                false
            }
        }
    }

    /// Run performs the mandatory startup scan, then rescans on every
    /// interval tick until cancelled.
    pub async fn run(&self) {
        let mut tick = tokio::time::interval(self.ctx.settings.scan_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("dynamic controller manager stopping");
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.scan().await {
                        warn!(error = %e, "scan failed");
                    }
                }
            }
        }
    }
}

fn spawn_logged(name: String, fut: ControllerFuture) {
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(controller = name, error = %e, "controller exited with error");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_monotone() {
        use Registration::*;
        assert_eq!(next_state(NotRegistered, false, false), NotRegistered);
        assert_eq!(next_state(NotRegistered, true, false), SourceOnly);
        assert_eq!(next_state(NotRegistered, true, true), FullyRegistered);
        assert_eq!(next_state(SourceOnly, true, false), SourceOnly);
        assert_eq!(next_state(SourceOnly, true, true), FullyRegistered);
        // No transition ever leaves FullyRegistered.
        for s in [false, true] {
            for m in [false, true] {
                assert_eq!(next_state(FullyRegistered, s, m), FullyRegistered);
            }
        }
    }
}
