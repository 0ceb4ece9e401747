#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Controller implements common functionality for the controller binary and
//! the mirror reconcilers themselves.

use std::{pin::Pin, sync::LazyLock, time::Duration};

use futures::Future;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::Store;

/// Prelude is the common types for the reconcilers.
pub(crate) mod prelude {
    pub use std::{collections::BTreeMap, collections::BTreeSet, sync::Arc, time::Duration};

    pub use futures::prelude::*;
    pub use kube::{
        self, Resource, ResourceExt,
        api::{Api, DeleteParams, DynamicObject, ListParams, Patch},
        core::{ApiResource, GroupVersionKind},
        runtime::{
            controller::{Action, Controller},
            watcher,
        },
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use api::{keys, source::SourceSettings};

    pub use super::{CONTROLLER_NAME, CREATE_PARAMS, DEFAULT_REQUEUE, PATCH_PARAMS};
    pub use super::{Context, ControllerFuture, Error, Result};
}

pub mod breaker;
pub mod discovery;
pub mod manager;
pub mod metrics;
pub mod mirrors;
pub mod namespaces;
pub mod ratelimit;
pub mod sources;
pub mod targets;

#[cfg(test)]
pub(crate) mod testing;

// NB The docs are unclear, but backtraces are unsupported on stable.
/// Error ...
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing subsriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Kube is a generic error from the `kube` crate.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig inidicates the process was unable to find a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    /// Io inidicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON inidicates a JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// AddrParse inidicates the provided string failed to parse into an
    /// address.
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Tokio inidicates an error starting tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    /// Template indicates a mirror could not be constructed from its source.
    #[error("mirror template error: {0}")]
    Template(#[from] mirror_templates::Error),
    /// Transform indicates a transform annotation was rejected.
    #[error("transform error: {0}")]
    Transform(#[from] mirror_transform::Error),
    /// Discovery indicates the kind set could not be enumerated.
    #[error("discovery error: {0}")]
    Discovery(String),
    /// TargetErrors reports per-target failures out of a reconcile so the
    /// runtime requeues the key.
    #[error("{errored} of {total} targets failed")]
    TargetErrors {
        /// Targets that failed.
        errored: usize,
        /// Targets attempted.
        total: usize,
    },
    /// MissingName inidcates a name was needed and not provided.
    #[error("missing name for kubernetes object: {0}")]
    MissingName(&'static str),
    /// Other is a catch-all error.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result typedef for controllers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Settings is the process-wide configuration surface.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Namespaces to watch; empty means all.
    pub watch_namespaces: Vec<String>,
    /// Namespace deny-list globs. Defaults to the platform system
    /// namespaces.
    pub excluded_namespaces: Vec<String>,
    /// Namespace allow-list globs; empty disables include filtering.
    pub allowed_namespaces: Vec<String>,
    /// Explicit `Kind.version.group` list; empty enables auto-discovery.
    pub kinds: Vec<String>,
    /// Concurrent reconciles per kind.
    pub workers: u16,
    /// Token-bucket refill rate for reconciles, per second.
    pub rate_limit_qps: f64,
    /// Token-bucket burst size.
    pub rate_limit_burst: u32,
    /// Periodic re-reconcile interval for healthy sources.
    pub reconcile_interval: Duration,
    /// Dynamic-manager scan interval.
    pub scan_interval: Duration,
    /// Event debounce window per kind.
    pub debounce: Duration,
    /// Cap on resolved targets per source, enforced by truncation.
    pub max_targets: usize,
    /// Log writes instead of sending them.
    pub dry_run: bool,
    /// Re-read sources with a direct GET before mirroring.
    pub verify_source_freshness: bool,
    /// Only opted-in namespaces are eligible targets.
    pub require_opt_in: bool,
    /// Global strict-transform default; sources may override.
    pub transform_strict: bool,
    /// Transform rule caps and render deadline.
    pub transform_limits: mirror_transform::Limits,
    /// Circuit-breaker thresholds.
    pub breaker: breaker::Config,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            watch_namespaces: Vec::new(),
            excluded_namespaces: targets::SYSTEM_NAMESPACES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_namespaces: Vec::new(),
            kinds: Vec::new(),
            workers: 2,
            rate_limit_qps: 10.0,
            rate_limit_burst: 20,
            reconcile_interval: Duration::from_secs(10 * 60),
            scan_interval: Duration::from_secs(5 * 60),
            debounce: Duration::from_secs(1),
            max_targets: 250,
            dry_run: false,
            verify_source_freshness: false,
            require_opt_in: false,
            transform_strict: false,
            transform_limits: mirror_transform::Limits::default(),
            breaker: breaker::Config::default(),
        }
    }
}

/// Context is common context for the reconcilers.
pub struct Context {
    /// Client is a k8s client. This should only ever be `clone()`'d out of
    /// the Context.
    pub client: kube::Client,
    /// Settings is the process configuration.
    pub settings: Settings,
    /// Namespaces is the shared namespace cache, fed by the namespace
    /// watcher.
    pub namespaces: Store<Namespace>,
    /// Breaker guards pathological sources.
    pub breaker: breaker::CircuitBreaker,
    /// Transformer applies payload rewrite rules.
    pub transformer: mirror_transform::Transformer,
    /// Limiter paces reconciles across all kinds.
    pub limiter: ratelimit::TokenBucket,
    /// Filter is the compiled namespace eligibility check.
    pub filter: targets::NamespaceFilter,
}

impl Context {
    /// New assembles a Context around a client and a namespace cache.
    pub fn new(client: kube::Client, settings: Settings, namespaces: Store<Namespace>) -> Context {
        Context {
            client,
            breaker: breaker::CircuitBreaker::new(settings.breaker),
            transformer: mirror_transform::Transformer::new(settings.transform_limits),
            limiter: ratelimit::TokenBucket::new(settings.rate_limit_qps, settings.rate_limit_burst),
            filter: targets::NamespaceFilter::new(
                &settings.excluded_namespaces,
                &settings.allowed_namespaces,
                &settings.watch_namespaces,
            ),
            settings,
            namespaces,
        }
    }

    /// Namespace_view snapshots the namespace cache for target resolution,
    /// sorted by name so truncation and cleanup order are deterministic.
    pub fn namespace_view(&self) -> Vec<targets::NamespaceInfo> {
        let mut view: Vec<_> = self
            .namespaces
            .state()
            .iter()
            .map(|ns| targets::NamespaceInfo::from_namespace(ns))
            .collect();
        view.sort_by(|a, b| a.name.cmp(&b.name));
        view
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

/// ControllerFuture is the type the controller constructors should return.
pub type ControllerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// CREATE_PARAMS is default post paramaters.
pub static CREATE_PARAMS: LazyLock<kube::api::PostParams> =
    LazyLock::new(|| kube::api::PostParams {
        dry_run: false,
        field_manager: Some(String::from(CONTROLLER_NAME)),
    });

/// PATCH_PARAMS is default patch paramaters.
pub static PATCH_PARAMS: LazyLock<kube::api::PatchParams> =
    LazyLock::new(|| kube::api::PatchParams::apply(CONTROLLER_NAME));

/// DEFAULT_REQUEUE is the action returned by healthy reconciles.
pub static DEFAULT_REQUEUE: LazyLock<kube::runtime::controller::Action> =
    LazyLock::new(|| kube::runtime::controller::Action::requeue(Duration::from_secs(10 * 60)));

/// CONTROLLER_NAME is the name the controller uses whenever it needs a
/// human-readable name.
pub use api::CONTROLLER_NAME;
