#![allow(dead_code)]
use std::{sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::Namespace;
use kube::{
    Api,
    api::{ObjectMeta, PostParams},
    runtime::reflector,
};
use tracing::trace;

use controller::*;

pub async fn test_context() -> (Arc<Context>, reflector::store::Writer<Namespace>) {
    let config = kube::Config::infer()
        .await
        .expect("unable to infer kubeconfig");
    let client = kube::client::ClientBuilder::try_from(config)
        .expect("unable to create client builder")
        .build();
    let (store, writer) = reflector::store::<Namespace>();
    let settings = Settings {
        reconcile_interval: Duration::from_secs(5),
        scan_interval: Duration::from_secs(5),
        debounce: Duration::from_millis(100),
        ..Settings::default()
    };
    (Arc::new(Context::new(client, settings, store)), writer)
}

pub async fn ensure_namespace(client: &kube::Client, name: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    if api.get_opt(name).await?.is_none() {
        trace!(name, "creating namespace");
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &ns).await?;
    }
    Ok(())
}

/// Polls `check` every 250ms until it yields Some, or panics at the
/// deadline.
pub async fn eventually<T, F, Fut>(what: &str, deadline: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = check().await {
            return v;
        }
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

pub fn source_name() -> String {
    format!("mirror-test-{}", std::process::id())
}
