//! Namespaces watches namespace lifecycle and propagates it into the mirror
//! set.
//!
//! The watcher doubles as the feeder for the shared namespace cache. Newly
//! created namespaces and namespaces whose opt-in label changed trigger a
//! sweep over every enabled source of every registered kind; deletions are
//! ignored (finalizers already cover cleanup).

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::{WatchStreamExt, reflector, watcher};

use crate::manager::DynamicControllerManager;
use crate::prelude::*;
use crate::sources;

// Label propagation races the informer caches; a short settle pass runs
// again once the dust has had time to land.
const SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Watch runs the namespace watcher until cancelled. `writer` is the store
/// half handed to [`Context::new`]; events pass through it before diffing.
pub fn watch(
    cancel: CancellationToken,
    ctx: Arc<Context>,
    manager: Arc<DynamicControllerManager>,
    writer: reflector::store::Writer<Namespace>,
) -> ControllerFuture {
    async move {
        let api: Api<Namespace> = Api::all(ctx.client.clone());
        let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
        futures::pin_mut!(stream);

        // Last observed allow-mirrors value per namespace. The initial list
        // seeds this without firing: the startup scan already reconciles
        // existing state.
        let mut seen: BTreeMap<String, Option<String>> = BTreeMap::new();
        let mut initializing = true;

        info!("starting namespace watcher");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = stream.try_next() => ev,
            };
            match event {
                Err(e) => {
                    warn!(error = %e, "namespace watch error");
                    continue;
                }
                Ok(None) => break,
                Ok(Some(watcher::Event::Init)) => initializing = true,
                Ok(Some(watcher::Event::InitDone)) => initializing = false,
                Ok(Some(watcher::Event::InitApply(ns))) => {
                    seen.insert(ns.name_any(), allow_value(&ns));
                }
                Ok(Some(watcher::Event::Delete(ns))) => {
                    seen.remove(&ns.name_any());
                }
                Ok(Some(watcher::Event::Apply(ns))) => {
                    let name = ns.name_any();
                    let value = allow_value(&ns);
                    let prev = seen.insert(name.clone(), value.clone());
                    if initializing {
                        continue;
                    }
                    let relevant = match prev {
                        None => true,
                        Some(old) => old != value,
                    };
                    if !relevant {
                        continue;
                    }
                    info!(namespace = name, ?value, "namespace event");
                    propagate(&ctx, &manager, &name).await;

                    let ctx = ctx.clone();
                    let manager = manager.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => (),
                            _ = tokio::time::sleep(SETTLE_DELAY) => {
                                propagate(&ctx, &manager, &name).await;
                            }
                        }
                    });
                }
            }
        }
        debug!("namespace watcher finished");
        Ok(())
    }
    .boxed()
}

fn allow_value(ns: &Namespace) -> Option<String> {
    ns.labels().get(keys::ALLOW_MIRRORS_LABEL).cloned()
}

// Sweeps every enabled source of every registered kind against the event
// namespace. Failures are logged; the sweep always finishes.
async fn propagate(ctx: &Arc<Context>, manager: &Arc<DynamicControllerManager>, event_ns: &str) {
    for kind in manager.registered_kinds() {
        let api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &kind.resource);
        let lp = ListParams::default()
            .labels(&format!("{}={}", keys::ENABLED_LABEL, keys::TRUE_VALUE));
        let list = match api.list(&lp).await {
            Ok(l) => l,
            Err(e) => {
                warn!(kind = kind.key(), error = %e, "source list failed");
                continue;
            }
        };
        for src in list {
            if let Err(e) =
                sources::sync_source_to_namespace(ctx, &kind.resource, &src, event_ns).await
            {
                warn!(
                    kind = kind.key(),
                    source = src.name_any(),
                    error = %e,
                    "namespace propagation failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn opt_out_namespace_loses_its_mirror() {
        // Source targets `all`; namespace b flips to allow-mirrors=false.
        // The sweep must delete b's mirror and leave the others alone.
        let (kctx, fakeserver) = KindCtx::secret_tests_with(
            &[("default", None), ("a", None), ("b", Some(false)), ("c", None)],
            |s| s,
        );
        let mut src = secret::finalized(secret::test());
        src.metadata
            .annotations
            .get_or_insert_default()
            .insert(keys::TARGET_NAMESPACES_ANNOTATION.into(), "all".into());

        let mocksrv = fakeserver.run(Scenario::NamespaceOptOut(src.clone(), "b".into()));
        sources::sync_source_to_namespace(&kctx.ctx, &kctx.resource, &src, "b")
            .await
            .expect("propagation");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn new_namespace_gains_a_mirror() {
        let (kctx, fakeserver) = KindCtx::secret_tests(&["default", "app-1", "app-2"]);
        let src = secret::finalized(secret::test());
        let mocksrv = fakeserver.run(Scenario::NamespaceCreate(src.clone(), "app-2".into()));
        sources::sync_source_to_namespace(&kctx.ctx, &kctx.resource, &src, "app-2")
            .await
            .expect("propagation");
        timeout_after_1s(mocksrv).await;
    }
}
