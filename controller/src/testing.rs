//! Extras that only show up during tests.
#![allow(missing_docs)]

use std::sync::Arc;

use http::{Request, Response, StatusCode};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    Client, ResourceExt,
    api::DynamicObject,
    client::Body,
    core::{ApiResource, GroupVersionKind},
    runtime::{reflector, watcher},
};
use serde_json::{Value, json};
use tower_test::mock::SendResponse;

pub use crate::sources::KindCtx;
use crate::{Context, Settings};
use api::keys;

pub use test_log::test;

impl KindCtx {
    /// Secret_tests builds a mock-backed KindCtx for the core Secret kind,
    /// with the given (unlabeled) namespaces in the cache.
    pub fn secret_tests(namespaces: &[&str]) -> (Arc<Self>, ServerVerifier) {
        let specs: Vec<(&str, Option<bool>)> = namespaces.iter().map(|n| (*n, None)).collect();
        Self::secret_tests_with(&specs, |s| s)
    }

    /// Secret_tests_with builds the same, with opt-in/out labels and a
    /// settings hook.
    pub fn secret_tests_with(
        namespaces: &[(&str, Option<bool>)],
        tweak: impl FnOnce(Settings) -> Settings,
    ) -> (Arc<Self>, ServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");

        let (store, mut writer) = reflector::store::<Namespace>();
        for (name, allow) in namespaces {
            let mut ns = Namespace::default();
            ns.metadata.name = Some(name.to_string());
            if let Some(allow) = allow {
                ns.metadata.labels.get_or_insert_default().insert(
                    keys::ALLOW_MIRRORS_LABEL.to_string(),
                    allow.to_string(),
                );
            }
            writer.apply_watcher_event(&watcher::Event::Apply(ns));
        }

        let resource = secret::resource();
        let ctx = Context::new(mock_client, tweak(Settings::default()), store);
        let kctx = Arc::new(KindCtx {
            ctx: Arc::new(ctx),
            resource,
            name: "secret.v1".into(),
        });
        (kctx, ServerVerifier { handle })
    }
}

/// Fixtures for a Secret source and its mirrors.
pub mod secret {
    use super::*;
    use mirror_templates::MirrorBuilder;

    pub fn resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Secret"))
    }

    /// A source Secret `default/s`, enabled and syncing into app-1, app-2.
    pub fn test() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": "s",
                "namespace": "default",
                "uid": "uid-1",
                "resourceVersion": "41",
                "labels": { "projectmirror.io/enabled": "true" },
                "annotations": {
                    "projectmirror.io/sync": "true",
                    "projectmirror.io/target-namespaces": "app-1,app-2",
                },
            },
            "type": "Opaque",
            "data": { "k": "djE=" },
        }))
        .expect("static fixture")
    }

    pub fn finalized(mut s: DynamicObject) -> DynamicObject {
        s.finalizers_mut().push(keys::FINALIZER.into());
        s
    }

    pub fn deleting(mut s: DynamicObject) -> DynamicObject {
        s.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            k8s_openapi::jiff::Timestamp::now(),
        ));
        s
    }

    pub fn with_status(s: &mut DynamicObject, status: &str) {
        s.metadata
            .annotations
            .get_or_insert_default()
            .insert(keys::SYNC_STATUS_ANNOTATION.into(), status.into());
    }

    /// The mirror the controller would write for `src` in `ns`.
    pub fn mirror(src: &DynamicObject, ns: &str) -> DynamicObject {
        let mut m = MirrorBuilder::try_from(src)
            .expect("fixture has identity")
            .build(ns, None);
        m.metadata.resource_version = Some("7".into());
        m.metadata.uid = Some(format!("mirror-uid-{ns}"));
        m
    }
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

// We wrap tower_test::mock::Handle
type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub struct ServerVerifier {
    handle: ApiServerHandle,
}

/// Scenarios we want to test for.
pub enum Scenario {
    /// A merge patch installing the finalizer on the source.
    FinalizerAdd(DynamicObject),
    /// Fresh source: two mirror creates, one empty orphan probe, one status
    /// patch.
    BasicCreate(DynamicObject),
    /// Mirrors exist and hashes match: probes only, zero writes.
    SettledNoop(DynamicObject),
    /// Deleting source: every mirror removed, then the finalizer.
    DeleteAll(DynamicObject),
    /// Targets moved from app-* to prod-*: new mirrors created, old ones
    /// swept as orphans.
    PatternShift(DynamicObject),
    /// A template rule rewrites the payload per target namespace.
    TransformCreate(DynamicObject),
    /// The reconciler must make no API calls at all.
    RadioSilence,
    /// Mirror GC: source missing (None) or recreated (Some, new uid), the
    /// mirror is deleted.
    OrphanDelete(DynamicObject, Option<DynamicObject>),
    /// Mirror GC: source alive and uid matches, nothing happens.
    OrphanKeep(DynamicObject, DynamicObject),
    /// Namespace sweep: the event namespace left the target set, its mirror
    /// goes away.
    NamespaceOptOut(DynamicObject, String),
    /// Namespace sweep: the event namespace joined the target set, a mirror
    /// appears.
    NamespaceCreate(DynamicObject, String),
}

impl ServerVerifier {
    /// Tests only get to run specific scenarios that have matching handlers.
    ///
    /// NB: If the reconciler makes more calls than the scenario handles, the
    /// reconciler sees a `Service(Closed(()))` error. Await the returned
    /// handle (with a timeout) to catch missing calls.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            use Scenario::*;
            match scenario {
                FinalizerAdd(s) => {
                    self.handle_finalizer_patch(&s, true).await.map(drop)
                }
                BasicCreate(s) => self.handle_basic_create(s).await.map(drop),
                SettledNoop(s) => self.handle_settled(s).await.map(drop),
                DeleteAll(s) => self.handle_delete_all(s).await.map(drop),
                PatternShift(s) => self.handle_pattern_shift(s).await.map(drop),
                TransformCreate(s) => self.handle_transform_create(s).await.map(drop),
                RadioSilence => Ok(()),
                OrphanDelete(m, src) => self.handle_orphan(m, src, true).await.map(drop),
                OrphanKeep(m, src) => self.handle_orphan(m, Some(src), false).await.map(drop),
                NamespaceOptOut(s, ns) => self.handle_ns_opt_out(s, &ns).await.map(drop),
                NamespaceCreate(s, ns) => self.handle_ns_create(s, &ns).await.map(drop),
            }
            .expect("scenario completed without errors");
        })
    }

    async fn next(&mut self) -> (Request<Body>, SendResponse<Response<Body>>) {
        self.handle.next_request().await.expect("service not called")
    }

    async fn handle_basic_create(mut self, s: DynamicObject) -> Result<Self, String> {
        self = self
            .handle_get_404("app-1", "s")
            .await?
            .handle_create("app-1", &s)
            .await?
            .handle_get_404("app-2", "s")
            .await?
            .handle_create("app-2", &s)
            .await?
            // Orphan probe of the one namespace outside the target set.
            .handle_get_404("kube-system", "s")
            .await?
            .handle_status_patch(&s, "reconciled:2,errors:0")
            .await?;
        Ok(self)
    }

    async fn handle_settled(mut self, s: DynamicObject) -> Result<Self, String> {
        let app1 = secret::mirror(&s, "app-1");
        let app2 = secret::mirror(&s, "app-2");
        self = self
            .handle_get_found("app-1", &app1)
            .await?
            .handle_get_found("app-2", &app2)
            .await?
            .handle_get_404("kube-system", "s")
            .await?;
        Ok(self)
    }

    async fn handle_delete_all(mut self, s: DynamicObject) -> Result<Self, String> {
        for ns in ["app-1", "app-2"] {
            let m = secret::mirror(&s, ns);
            self = self
                .handle_get_found(ns, &m)
                .await?
                .handle_delete(ns, &m)
                .await?;
        }
        self.handle_finalizer_patch(&s, false).await
    }

    async fn handle_pattern_shift(mut self, s: DynamicObject) -> Result<Self, String> {
        self = self
            .handle_get_404("prod-1", "s")
            .await?
            .handle_create("prod-1", &s)
            .await?
            .handle_get_404("prod-2", "s")
            .await?
            .handle_create("prod-2", &s)
            .await?;
        // The previous target set's mirrors are orphans now.
        for ns in ["app-1", "app-2"] {
            let m = secret::mirror(&s, ns);
            self = self
                .handle_get_found(ns, &m)
                .await?
                .handle_delete(ns, &m)
                .await?;
        }
        self.handle_status_patch(&s, "reconciled:2,errors:0").await
    }

    async fn handle_transform_create(mut self, s: DynamicObject) -> Result<Self, String> {
        self = self.handle_get_404("app-1", "s").await?;

        let (request, send) = self.next().await;
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::POST, "unexpected method");
        assert!(uri.contains("/api/v1/namespaces/app-1/secrets"), "unexpected path: {uri}");
        let body = request.into_body().collect_bytes().await.unwrap();
        let obj: Value = serde_json::from_slice(&body).expect("mirror body is json");
        assert_eq!(
            obj.pointer("/data/URL").and_then(Value::as_str),
            Some("https://app-1.x"),
            "template did not render: {obj}"
        );
        send.send_response(Response::builder().body(Body::from(body)).unwrap());

        self.handle_status_patch(&s, "reconciled:1,errors:0").await
    }

    async fn handle_orphan(
        mut self,
        m: DynamicObject,
        src: Option<DynamicObject>,
        expect_delete: bool,
    ) -> Result<Self, String> {
        self = match src {
            Some(src) => self.handle_get_found("default", &src).await?,
            None => self.handle_get_404("default", "s").await?,
        };
        if expect_delete {
            let ns = m.namespace().expect("mirror is namespaced");
            self = self.handle_delete(&ns, &m).await?;
        }
        Ok(self)
    }

    async fn handle_ns_opt_out(mut self, s: DynamicObject, ns: &str) -> Result<Self, String> {
        let m = secret::mirror(&s, ns);
        self = self.handle_get_found(ns, &m).await?;
        self.handle_delete(ns, &m).await
    }

    async fn handle_ns_create(mut self, s: DynamicObject, ns: &str) -> Result<Self, String> {
        self = self.handle_get_404(ns, "s").await?;
        self.handle_create(ns, &s).await
    }

    /// Handles a GET that finds nothing.
    async fn handle_get_404(mut self, ns: &str, name: &str) -> Result<Self, String> {
        let (request, send) = self.next().await;
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::GET, "unexpected method");
        let key = format!("/api/v1/namespaces/{ns}/secrets/{name}");
        assert!(uri.contains(&key), "unexpected path: {uri} (want {key})");
        send.send_response(not_found(name));
        Ok(self)
    }

    /// Handles a GET answered with `obj`.
    async fn handle_get_found(mut self, ns: &str, obj: &DynamicObject) -> Result<Self, String> {
        let (request, send) = self.next().await;
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::GET, "unexpected method");
        let key = format!("/api/v1/namespaces/{ns}/secrets/{}", obj.name_any());
        assert!(uri.contains(&key), "unexpected path: {uri} (want {key})");
        send.send_response(ok_json(obj));
        Ok(self)
    }

    /// Handles a mirror POST, verifying the management contract on the body.
    async fn handle_create(mut self, ns: &str, src: &DynamicObject) -> Result<Self, String> {
        let (request, send) = self.next().await;
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::POST, "unexpected method");
        let key = format!("/api/v1/namespaces/{ns}/secrets");
        assert!(uri.contains(&key), "unexpected path: {uri}");
        assert!(
            uri.contains(&format!("fieldManager={}", crate::CONTROLLER_NAME)),
            "missing field manager: {uri}"
        );

        let body = request.into_body().collect_bytes().await.unwrap();
        let obj: Value = serde_json::from_slice(&body).expect("mirror body is json");
        let meta = obj.get("metadata").expect("mirror has metadata");

        let labels = meta.get("labels").expect("mirror has labels");
        assert_eq!(
            labels.get(keys::MANAGED_BY_LABEL).and_then(Value::as_str),
            Some(crate::CONTROLLER_NAME)
        );
        assert_eq!(
            labels.get(keys::MIRROR_LABEL).and_then(Value::as_str),
            Some("true")
        );
        let annotations = meta.get("annotations").expect("mirror has annotations");
        for k in keys::SOURCE_BACKREF_ANNOTATIONS {
            assert!(annotations.get(k).is_some(), "missing {k}");
        }
        assert_eq!(
            annotations
                .get(keys::SOURCE_UID_ANNOTATION)
                .and_then(Value::as_str),
            src.metadata.uid.as_deref(),
        );
        assert!(
            meta.get("finalizers").is_none(),
            "mirror must not carry finalizers"
        );
        assert!(
            meta.get("ownerReferences").is_none(),
            "mirror must not carry owner references"
        );
        assert!(obj.get("stringData").is_none(), "stringData never copied");

        send.send_response(Response::builder().body(Body::from(body)).unwrap());
        Ok(self)
    }

    /// Handles a DELETE of a mirror.
    async fn handle_delete(mut self, ns: &str, m: &DynamicObject) -> Result<Self, String> {
        let (request, send) = self.next().await;
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::DELETE, "unexpected method");
        let key = format!("/api/v1/namespaces/{ns}/secrets/{}", m.name_any());
        assert!(uri.contains(&key), "unexpected path: {uri}");
        send.send_response(ok_json(m));
        Ok(self)
    }

    /// Handles the finalizer merge patch; `adding` selects which direction.
    async fn handle_finalizer_patch(
        mut self,
        s: &DynamicObject,
        adding: bool,
    ) -> Result<Self, String> {
        let (request, send) = self.next().await;
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        let key = format!("/api/v1/namespaces/default/secrets/{}", s.name_any());
        assert!(uri.contains(&key), "unexpected path: {uri}");

        let body = request.into_body().collect_bytes().await.unwrap();
        let patch: Value = serde_json::from_slice(&body).expect("patch body is json");
        let finalizers = patch
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .expect("patch carries finalizers");
        let has = finalizers
            .iter()
            .any(|f| f.as_str() == Some(keys::FINALIZER));
        assert_eq!(has, adding, "unexpected finalizer patch: {patch}");

        send.send_response(ok_json(s));
        Ok(self)
    }

    /// Handles the sync-status annotation patch on the source.
    async fn handle_status_patch(mut self, s: &DynamicObject, want: &str) -> Result<Self, String> {
        let (request, send) = self.next().await;
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        let key = format!("/api/v1/namespaces/default/secrets/{}", s.name_any());
        assert!(uri.contains(&key), "unexpected path: {uri}");

        let body = request.into_body().collect_bytes().await.unwrap();
        let patch: Value = serde_json::from_slice(&body).expect("patch body is json");
        let status = patch
            .pointer(&format!(
                "/metadata/annotations/{}",
                keys::SYNC_STATUS_ANNOTATION.replace('/', "~1")
            ))
            .and_then(Value::as_str);
        assert_eq!(status, Some(want), "unexpected status patch: {patch}");

        send.send_response(ok_json(s));
        Ok(self)
    }
}

fn ok_json<T: serde::Serialize>(obj: &T) -> Response<Body> {
    let body = serde_json::to_vec(obj).unwrap();
    Response::builder().body(Body::from(body)).unwrap()
}

fn not_found(name: &str) -> Response<Body> {
    let err = json!({
        "code": 404,
        "status": "Failure",
        "reason": "NotFound",
        "details": {
            "group": "",
            "kind": "secrets",
            "name": name,
        },
    });
    let body = serde_json::to_vec(&err).unwrap();
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from(body))
        .unwrap()
}
