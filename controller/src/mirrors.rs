//! Mirrors holds the garbage-collection reconciler for mirror objects.
//!
//! The watch is filtered on the management label, so only this controller's
//! own mirrors arrive. A mirror whose source is gone, or whose recorded
//! source uid no longer matches, is deleted; reconvergence after a source
//! deletion is the source reconciler's job, never this one's.

use std::sync::Arc;

use kube::runtime::controller::{Config as ControllerConfig, Error as CtrlErr};

use crate::discovery::DiscoveredKind;
use crate::prelude::*;
use crate::{metrics, sources::KindCtx};
use mirror_templates::source_ref;

/// Controller is the mirror controller for one discovered kind.
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
        .labels(&format!("{}={}", keys::MANAGED_BY_LABEL, CONTROLLER_NAME));
    let cfg = ControllerConfig::default()
        .concurrency(ctx.settings.workers)
        .debounce(ctx.settings.debounce);

    let kctx = Arc::new(KindCtx {
        ctx,
        resource: resource.clone(),
        name: format!("{}-mirror", kind.key()),
    });
    let api: Api<DynamicObject> = Api::all_with(client, &resource);
    let ctl = Controller::new_with(api, wc, resource)
        .with_config(cfg)
        .graceful_shutdown_on(cancel.cancelled_owned());

    Ok(async move {
        info!(kind = kctx.name, "starting mirror controller");
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
        debug!("mirror controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(_obj: Arc<DynamicObject>, err: &Error, _kctx: Arc<KindCtx>) -> Action {
    error!(error = err.to_string(), "mirror reconcile error");
    Action::requeue(Duration::from_secs(30))
}

#[instrument(skip(kctx, mirror), fields(
    kind = kctx.name,
    namespace = mirror.namespace().unwrap_or_default(),
    name = mirror.name_any(),
))]
async fn reconcile(mirror: Arc<DynamicObject>, kctx: Arc<KindCtx>) -> Result<Action> {
    let ctx = &kctx.ctx;
    let ns = mirror.namespace().ok_or(Error::MissingName("namespace"))?;
    let name = mirror.name_any();

    let Some(backref) = source_ref(&mirror.metadata) else {
        // Not a complete mirror; leave it for a human to untangle.
        warn!("managed object lacks source back-references");
        return Ok(Action::await_change());
    };

    let sources: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &backref.namespace, &kctx.resource);
    let reason = match sources.get_opt(&backref.name).await? {
        None => "orphaned",
        Some(src) if src.metadata.uid.as_deref() != Some(backref.uid.as_str()) => {
            "stale after recreation"
        }
        Some(_) => return Ok(DEFAULT_REQUEUE.clone()),
    };

    info!(
        source_namespace = backref.namespace,
        source_name = backref.name,
        reason,
        "deleting mirror"
    );
    if ctx.settings.dry_run {
        return Ok(Action::await_change());
    }
    let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), &ns, &kctx.resource);
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => metrics::mirror_deleted(&kctx.resource.kind),
        Err(kube::Error::Api(e)) if e.code == 404 => (),
        Err(e) => return Err(e.into()),
    }
    Ok(Action::await_change())
}
