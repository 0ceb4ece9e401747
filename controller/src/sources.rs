//! Sources holds the reconciler driving mirrors for one source kind.
//!
//! One controller instance is registered per active kind by the dynamic
//! manager. The watch is filtered server-side on the enablement label, so
//! only sources (and never mirrors) arrive here.

use std::sync::Arc;

use kube::runtime::controller::{Config as ControllerConfig, Error as CtrlErr};
use serde_json::json;
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::wrappers::SignalStream;

use crate::discovery::DiscoveredKind;
use crate::prelude::*;
use crate::{breaker, metrics, targets};
use mirror_templates::{MirrorBuilder, is_managed, is_mirror, needs_sync, source_ref};
use mirror_transform::{Rule, TemplateContext};

/// KindCtx is the per-kind reconcile context: the shared [`Context`] plus the
/// resolved API coordinates of the kind this controller owns.
pub struct KindCtx {
    /// Shared process context.
    pub ctx: Arc<Context>,
    /// The kind's API coordinates.
    pub resource: ApiResource,
    /// The registration key, `kind.version.group`.
    pub name: String,
}

/// Controller is the source controller for one discovered kind.
///
/// An error is returned if any setup fails.
#[instrument(skip_all, fields(kind = %kind.key()))]
pub fn controller(
    cancel: CancellationToken,
    ctx: Arc<Context>,
    kind: &DiscoveredKind,
) -> Result<ControllerFuture> {
    let client = ctx.client.clone();
    let resource = kind.resource.clone();
    let wc = watcher::Config::default()
        .labels(&format!("{}={}", keys::ENABLED_LABEL, keys::TRUE_VALUE));
    let sig = SignalStream::new(signal(SignalKind::user_defined1())?);
    let cfg = ControllerConfig::default()
        .concurrency(ctx.settings.workers)
        .debounce(ctx.settings.debounce);

    let kctx = Arc::new(KindCtx {
        ctx,
        resource: resource.clone(),
        name: kind.key(),
    });
    let api: Api<DynamicObject> = Api::all_with(client, &resource);
    let ctl = Controller::new_with(api, wc, resource)
        .with_config(cfg)
        .reconcile_all_on(sig)
        .graceful_shutdown_on(cancel.cancelled_owned());

    Ok(async move {
        info!(kind = kctx.name, "starting source controller");
        ctl.run(reconcile, error_policy, kctx)
            .for_each(|ret| {
                if let Err(err) = ret {
                    match err {
                        CtrlErr::ObjectNotFound(objref) => error!(%objref, "object not found"),
                        CtrlErr::ReconcilerFailed(error, objref) => {
                            error!(%objref, %error, "reconcile error")
                        }
                        CtrlErr::QueueError(error) => error!(%error, "queue error"),
                        CtrlErr::RunnerError(error) => error!(%error, "runner error"),
                    };
                }
                futures::future::ready(())
            })
            .await;
        debug!("source controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(obj: Arc<DynamicObject>, err: &Error, kctx: Arc<KindCtx>) -> Action {
    let key = breaker_key(&obj, &kctx);
    error!(
        error = err.to_string(),
        obj.metadata.name, obj.metadata.uid, "reconcile error"
    );
    // Exponential backoff scaled by the key's failure streak.
    let failures = kctx.ctx.breaker.consecutive_failures(&key).min(6);
    let delay = Duration::from_secs(5)
        .saturating_mul(1u32 << failures)
        .min(Duration::from_secs(300));
    Action::requeue(delay)
}

fn breaker_key(obj: &DynamicObject, kctx: &KindCtx) -> String {
    breaker::key(
        obj.namespace().as_deref().unwrap_or_default(),
        &obj.name_any(),
        &kctx.resource.kind,
    )
}

#[instrument(skip(kctx, obj), fields(
    kind = kctx.name,
    namespace = obj.namespace().unwrap_or_default(),
    name = obj.name_any(),
    resource_version = obj.metadata.resource_version,
))]
async fn reconcile(obj: Arc<DynamicObject>, kctx: Arc<KindCtx>) -> Result<Action> {
    let ctx = &kctx.ctx;
    let key = breaker_key(&obj, &kctx);
    if !ctx.breaker.allow_request(&key) {
        debug!("circuit open, skipping");
        return Ok(Action::requeue(ctx.breaker.reset_timeout()));
    }
    ctx.limiter.acquire().await;
    metrics::reconcile(&kctx.name);

    match reconcile_inner(obj, &kctx).await {
        Ok(action) => {
            ctx.breaker.record_success(&key);
            Ok(action)
        }
        Err(err) => {
            metrics::reconcile_failure(&kctx.name);
            if ctx.breaker.record_failure(&key, &err.to_string()) {
                warn!(key, error = %err, "circuit opened");
                metrics::breaker_opened(&kctx.name);
            }
            Err(err)
        }
    }
}

async fn reconcile_inner(mut obj: Arc<DynamicObject>, kctx: &Arc<KindCtx>) -> Result<Action> {
    let ctx = &kctx.ctx;
    let ns = obj.namespace().ok_or(Error::MissingName("namespace"))?;
    let name = obj.name_any();
    let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), &ns, &kctx.resource);

    // Watch events can outrun cache propagation; an optional re-read avoids
    // mirroring a stale payload.
    if ctx.settings.verify_source_freshness {
        match api.get_opt(&name).await? {
            None => return Ok(Action::await_change()),
            Some(fresh) => {
                if fresh.metadata.resource_version != obj.metadata.resource_version {
                    debug!("using fresher copy of source");
                    obj = Arc::new(fresh);
                }
            }
        }
    }

    // Mirrors are reconciled by the mirror controller only.
    if is_mirror(&obj.metadata) || is_managed(&obj.metadata) {
        return Ok(Action::await_change());
    }

    let settings = SourceSettings::from_meta(&obj.metadata);
    let has_finalizer = obj.finalizers().iter().any(|f| f == keys::FINALIZER);

    if obj.meta().deletion_timestamp.is_some() {
        if has_finalizer {
            info!("source deleting, removing mirrors");
            let failures = delete_all_mirrors(ctx, &kctx.resource, &obj).await;
            note_deletion_failures(&api, &obj, failures).await;
            remove_finalizer(&api, &obj).await?;
        }
        return Ok(Action::await_change());
    }

    if !settings.active() {
        if has_finalizer {
            info!("source disabled, removing mirrors");
            let failures = delete_all_mirrors(ctx, &kctx.resource, &obj).await;
            note_deletion_failures(&api, &obj, failures).await;
            remove_finalizer(&api, &obj).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer {
        add_finalizer(&api, &obj).await?;
        return Ok(Action::requeue(Duration::from_millis(250)));
    }

    for rejected in &settings.rejected {
        warn!(error = %rejected, "skipping invalid target pattern");
    }
    let mut target_list: Vec<String> = resolve_target_set(ctx, &ns, &settings)
        .into_iter()
        .collect();
    if target_list.len() > ctx.settings.max_targets {
        warn!(
            resolved = target_list.len(),
            max = ctx.settings.max_targets,
            "truncating target set"
        );
        target_list.truncate(ctx.settings.max_targets);
    }
    if target_list.is_empty() {
        debug!("no targets resolved");
        return Ok(Action::requeue(ctx.settings.reconcile_interval));
    }

    let strict = settings
        .transform_strict
        .unwrap_or(ctx.settings.transform_strict);
    let builder = MirrorBuilder::try_from(obj.as_ref())?;
    let rules = match &settings.transform {
        None => Vec::new(),
        Some(raw) => match ctx.transformer.parse(raw) {
            Ok(rules) => rules,
            Err(e) if strict => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "ignoring unparseable transform annotation");
                Vec::new()
            }
        },
    };

    let mut reconciled: usize = 0;
    let mut failed: Vec<String> = Vec::new();
    for tns in &target_list {
        match sync_target(ctx, &kctx.resource, &builder, &rules, strict, &obj, tns).await {
            Ok(()) => reconciled = reconciled.saturating_add(1),
            Err(e) => {
                warn!(target_ns = %tns, error = %e, "target reconcile failed");
                failed.push(tns.clone());
            }
        }
    }

    // Orphan cleanup: best-effort, never fatal.
    let target_set: BTreeSet<&String> = target_list.iter().collect();
    for info in ctx.namespace_view() {
        if info.name == ns || target_set.contains(&info.name) {
            continue;
        }
        if let Err(e) = delete_mirror_if_ours(ctx, &kctx.resource, &obj, &info.name).await {
            warn!(namespace = %info.name, error = %e, "orphan cleanup failed");
        }
    }

    write_status(ctx, &api, &obj, reconciled, &mut failed).await?;

    if failed.is_empty() {
        Ok(Action::requeue(ctx.settings.reconcile_interval))
    } else {
        Err(Error::TargetErrors {
            errored: failed.len(),
            total: target_list.len(),
        })
    }
}

/// Resolve_target_set computes the current target set for a source, from the
/// shared namespace cache.
pub(crate) fn resolve_target_set(
    ctx: &Context,
    source_ns: &str,
    settings: &SourceSettings,
) -> BTreeSet<String> {
    let view = ctx.namespace_view();
    targets::Resolve {
        patterns: &settings.targets,
        exclude: &settings.exclude,
        namespaces: &view,
        source_namespace: source_ns,
        filter: &ctx.filter,
        require_opt_in: ctx.settings.require_opt_in,
    }
    .run()
}

/// Sync_source_to_namespace reconciles exactly one `(source, namespace)`
/// pair, on behalf of the namespace watcher: the mirror is written or
/// refreshed when the namespace is in the source's target set, and a
/// lingering managed mirror is removed when it is not.
pub(crate) async fn sync_source_to_namespace(
    ctx: &Context,
    resource: &ApiResource,
    src: &DynamicObject,
    event_ns: &str,
) -> Result<()> {
    let settings = SourceSettings::from_meta(&src.metadata);
    if !settings.active() || is_mirror(&src.metadata) || is_managed(&src.metadata) {
        return Ok(());
    }
    let src_ns = src.namespace().ok_or(Error::MissingName("namespace"))?;
    if src_ns == event_ns {
        return Ok(());
    }

    if resolve_target_set(ctx, &src_ns, &settings).contains(event_ns) {
        let strict = settings
            .transform_strict
            .unwrap_or(ctx.settings.transform_strict);
        let builder = MirrorBuilder::try_from(src)?;
        let rules = match &settings.transform {
            None => Vec::new(),
            Some(raw) => match ctx.transformer.parse(raw) {
                Ok(rules) => rules,
                Err(e) if strict => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "ignoring unparseable transform annotation");
                    Vec::new()
                }
            },
        };
        sync_target(ctx, resource, &builder, &rules, strict, src, event_ns).await
    } else {
        delete_mirror_if_ours(ctx, resource, src, event_ns)
            .await
            .map(|_| ())
    }
}

/// Sync_target brings the mirror in `tns` in line with the source, creating
/// it if absent. Foreign objects of the same name are left untouched.
pub(crate) async fn sync_target(
    ctx: &Context,
    resource: &ApiResource,
    builder: &MirrorBuilder,
    rules: &[Rule],
    strict: bool,
    src: &DynamicObject,
    tns: &str,
) -> Result<()> {
    let name = src.name_any();
    let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), tns, resource);
    let existing = api.get_opt(&name).await?;

    if let Some(m) = &existing {
        if !is_managed(&m.metadata) {
            debug!(target_ns = tns, "foreign object with mirror's name, skipping");
            return Ok(());
        }
    }

    let payload = if rules.is_empty() {
        None
    } else {
        let tctx = template_context(src, tns);
        let applied = ctx
            .transformer
            .apply(rules, builder.payload().clone(), &tctx, strict)
            .await?;
        Some(applied.payload)
    };

    match existing {
        Some(mut m) => {
            if !needs_sync(builder.generation(), builder.hash(), &m.metadata) {
                trace!(target_ns = tns, "mirror up to date");
                return Ok(());
            }
            builder.update(&mut m, payload);
            if ctx.settings.dry_run {
                info!(target_ns = tns, name, "dry-run: would update mirror");
                return Ok(());
            }
            api.replace(&name, &CREATE_PARAMS, &m).await?;
            metrics::mirror_written(&resource.kind);
        }
        None => {
            let m = builder.build(tns, payload);
            if ctx.settings.dry_run {
                info!(target_ns = tns, name, "dry-run: would create mirror");
                return Ok(());
            }
            api.create(&CREATE_PARAMS, &m).await?;
            metrics::mirror_written(&resource.kind);
        }
    }
    Ok(())
}

/// Delete_mirror_if_ours removes the mirror of `src` in `tns`, if one exists,
/// is managed by this controller, and points back at the source. Reports
/// whether a delete was issued.
pub(crate) async fn delete_mirror_if_ours(
    ctx: &Context,
    resource: &ApiResource,
    src: &DynamicObject,
    tns: &str,
) -> Result<bool> {
    let name = src.name_any();
    let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), tns, resource);
    let Some(m) = api.get_opt(&name).await? else {
        return Ok(false);
    };
    if !is_managed(&m.metadata) {
        return Ok(false);
    }
    let Some(backref) = source_ref(&m.metadata) else {
        return Ok(false);
    };
    if Some(backref.namespace.as_str()) != src.namespace().as_deref() || backref.name != name {
        return Ok(false);
    }
    if ctx.settings.dry_run {
        info!(target_ns = tns, name, "dry-run: would delete mirror");
        return Ok(false);
    }
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {
            metrics::mirror_deleted(&resource.kind);
            Ok(true)
        }
        // Deleted under us; that is the goal state.
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// Removes the source's mirror from every namespace, returning how many
// namespaces failed. Failures are logged per-namespace; the traversal always
// completes so the finalizer can come off afterwards.
async fn delete_all_mirrors(ctx: &Context, resource: &ApiResource, src: &DynamicObject) -> usize {
    let source_ns = src.namespace().unwrap_or_default();
    let mut deleted: usize = 0;
    let mut failed: usize = 0;
    for info in ctx.namespace_view() {
        if info.name == source_ns {
            continue;
        }
        match delete_mirror_if_ours(ctx, resource, src, &info.name).await {
            Ok(true) => deleted = deleted.saturating_add(1),
            Ok(false) => (),
            Err(e) => {
                warn!(namespace = %info.name, error = %e, "mirror delete failed");
                failed = failed.saturating_add(1);
            }
        }
    }
    debug!(deleted, failed, "mirror cleanup pass finished");
    failed
}

// Bumps the deletion-attempts annotation when a cleanup pass hit failures,
// so operators can see how often cleanup has been retried. Best-effort: the
// finalizer still comes off afterwards.
async fn note_deletion_failures(api: &Api<DynamicObject>, obj: &DynamicObject, failures: usize) {
    if failures == 0 {
        return;
    }
    let attempts = obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(keys::DELETION_ATTEMPTS_ANNOTATION))
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        .saturating_add(1);
    let mut annotations = serde_json::Map::new();
    annotations.insert(
        keys::DELETION_ATTEMPTS_ANNOTATION.to_string(),
        serde_json::Value::String(attempts.to_string()),
    );
    let patch = json!({ "metadata": { "annotations": annotations } });
    if let Err(e) = api
        .patch(&obj.name_any(), &PATCH_PARAMS, &Patch::Merge(&patch))
        .await
    {
        warn!(error = %e, "unable to record deletion attempts");
    }
}

async fn add_finalizer(api: &Api<DynamicObject>, obj: &DynamicObject) -> Result<()> {
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(keys::FINALIZER.to_string());
    patch_finalizers(api, &obj.name_any(), finalizers).await
}

async fn remove_finalizer(api: &Api<DynamicObject>, obj: &DynamicObject) -> Result<()> {
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != keys::FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(api, &obj.name_any(), finalizers).await
}

async fn patch_finalizers(
    api: &Api<DynamicObject>,
    name: &str,
    finalizers: Vec<String>,
) -> Result<()> {
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PATCH_PARAMS, &Patch::Merge(&patch)).await?;
    Ok(())
}

// Records `reconciled:N,errors:M` (and the failed namespaces) on the source,
// but only when the value actually changed, so a settled reconcile makes no
// writes at all.
async fn write_status(
    ctx: &Context,
    api: &Api<DynamicObject>,
    obj: &DynamicObject,
    reconciled: usize,
    failed: &mut Vec<String>,
) -> Result<()> {
    failed.sort();
    let status = format!("reconciled:{},errors:{}", reconciled, failed.len());
    let failed_csv = failed.join(",");

    let current = |k: &str| {
        obj.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(k))
            .map(String::as_str)
    };
    let failed_current = current(keys::FAILED_TARGETS_ANNOTATION).unwrap_or_default();
    if current(keys::SYNC_STATUS_ANNOTATION) == Some(&status) && failed_current == failed_csv {
        return Ok(());
    }
    if ctx.settings.dry_run {
        return Ok(());
    }

    let failed_value = if failed.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::Value::String(failed_csv)
    };
    let mut annotations = serde_json::Map::new();
    annotations.insert(
        keys::SYNC_STATUS_ANNOTATION.to_string(),
        serde_json::Value::String(status),
    );
    annotations.insert(keys::FAILED_TARGETS_ANNOTATION.to_string(), failed_value);
    let patch = json!({ "metadata": { "annotations": annotations } });
    api.patch(&obj.name_any(), &PATCH_PARAMS, &Patch::Merge(&patch))
        .await?;
    Ok(())
}

// Template data for one target: the source's identity plus its metadata with
// the controller's own keys stripped.
fn template_context(src: &DynamicObject, tns: &str) -> TemplateContext {
    let strip = |m: Option<&std::collections::BTreeMap<String, String>>| {
        let mut m = m.cloned().unwrap_or_default();
        for k in keys::CONTROLLER_KEYS {
            m.remove(k);
        }
        m
    };
    TemplateContext {
        target_namespace: tns.to_string(),
        source_namespace: src.namespace().unwrap_or_default(),
        source_name: src.name_any(),
        target_name: src.name_any(),
        labels: strip(src.metadata.labels.as_ref()),
        annotations: strip(src.metadata.annotations.as_ref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn sources_without_finalizer_get_one() {
        let (kctx, fakeserver) = KindCtx::secret_tests(&["default", "app-1"]);
        let s = secret::test();
        let mocksrv = fakeserver.run(Scenario::FinalizerAdd(s.clone()));
        let action = reconcile(Arc::new(s), kctx).await.expect("reconciler");
        assert_ne!(action, Action::await_change());
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn basic_create_makes_two_mirrors() {
        let (kctx, fakeserver) =
            KindCtx::secret_tests(&["default", "app-1", "app-2", "kube-system"]);
        let s = secret::finalized(secret::test());
        let mocksrv = fakeserver.run(Scenario::BasicCreate(s.clone()));
        reconcile(Arc::new(s), kctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn settled_source_makes_zero_writes() {
        let (kctx, fakeserver) =
            KindCtx::secret_tests(&["default", "app-1", "app-2", "kube-system"]);
        let mut s = secret::finalized(secret::test());
        secret::with_status(&mut s, "reconciled:2,errors:0");
        let mocksrv = fakeserver.run(Scenario::SettledNoop(s.clone()));
        reconcile(Arc::new(s), kctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn deleting_source_removes_mirrors_then_finalizer() {
        let (kctx, fakeserver) = KindCtx::secret_tests(&["default", "app-1", "app-2"]);
        let s = secret::deleting(secret::finalized(secret::test()));
        let mocksrv = fakeserver.run(Scenario::DeleteAll(s.clone()));
        reconcile(Arc::new(s), kctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn pattern_change_swaps_mirror_set() {
        let (kctx, fakeserver) = KindCtx::secret_tests(&[
            "default", "app-1", "app-2", "prod-1", "prod-2",
        ]);
        let mut s = secret::finalized(secret::test());
        s.metadata
            .annotations
            .get_or_insert_default()
            .insert(keys::TARGET_NAMESPACES_ANNOTATION.into(), "prod-*".into());
        let mocksrv = fakeserver.run(Scenario::PatternShift(s.clone()));
        reconcile(Arc::new(s), kctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn template_renders_per_target() {
        let (kctx, fakeserver) = KindCtx::secret_tests(&["default", "app-1"]);
        let mut s = secret::finalized(secret::test());
        let annotations = s.metadata.annotations.get_or_insert_default();
        annotations.insert(keys::TARGET_NAMESPACES_ANNOTATION.into(), "app-1".into());
        annotations.insert(
            keys::TRANSFORM_ANNOTATION.into(),
            "- path: data.URL\n  template: \"https://{{TargetNamespace}}.x\"\n".into(),
        );
        let mocksrv = fakeserver.run(Scenario::TransformCreate(s.clone()));
        reconcile(Arc::new(s), kctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn mirror_guard_short_circuits() {
        let (kctx, fakeserver) = KindCtx::secret_tests(&["default", "app-1"]);
        let mut s = secret::test();
        s.metadata
            .labels
            .get_or_insert_default()
            .insert(keys::MIRROR_LABEL.into(), "true".into());
        let mocksrv = fakeserver.run(Scenario::RadioSilence);
        let action = reconcile(Arc::new(s), kctx).await.expect("reconciler");
        assert_eq!(action, Action::await_change());
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn open_breaker_short_circuits() {
        let (kctx, fakeserver) = KindCtx::secret_tests(&["default", "app-1"]);
        let s = secret::finalized(secret::test());
        let key = breaker::key("default", "s", "Secret");
        for _ in 0..kctx.ctx.settings.breaker.failure_threshold {
            kctx.ctx.breaker.record_failure(&key, "induced");
        }
        let mocksrv = fakeserver.run(Scenario::RadioSilence);
        let action = reconcile(Arc::new(s), kctx.clone()).await.expect("reconciler");
        assert_eq!(
            action,
            Action::requeue(kctx.ctx.breaker.reset_timeout())
        );
        timeout_after_1s(mocksrv).await;
    }
}
