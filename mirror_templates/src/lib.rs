#![cfg_attr(debug_assertions, warn(missing_docs))]
#![cfg_attr(debug_assertions, warn(rustdoc::broken_intra_doc_links))]
#![cfg_attr(not(debug_assertions), deny(missing_docs))]
#![cfg_attr(not(debug_assertions), deny(rustdoc::broken_intra_doc_links))]

//! Mirror_templates holds the payload and mirror-construction logic for the
//! mirror controllers.
//!
//! A mirror is a copy of a source object's payload in another namespace,
//! stamped with the management labels and the source back-reference
//! annotations. Everything here is a pure function over
//! [`kube::api::DynamicObject`]; the controllers do the I/O.
//!
//! ```
//! # use serde_json::{from_value, json};
//! # use kube::api::DynamicObject;
//! use mirror_templates::MirrorBuilder;
//!
//! // Get this from the k8s API in a real use.
//! let src: DynamicObject = from_value(json!({
//!     "apiVersion": "v1",
//!     "kind": "ConfigMap",
//!     "metadata": {
//!         "name": "example",
//!         "namespace": "default",
//!         "uid": "6060",
//!     },
//!     "data": { "k": "v" },
//! })).unwrap();
//!
//! let b = MirrorBuilder::try_from(&src).unwrap();
//! let mirror = b.build("app-1", None);
//! ```

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde_json::Value;

use api::keys;

mod payload;

pub use payload::{content_hash, needs_sync, payload_of};

/// Error is the error domain for constructing mirrors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The source object is missing a name.
    #[error("source has no name")]
    MissingName,
    /// The source object is missing a namespace.
    #[error("source has no namespace")]
    MissingNamespace,
    /// The source object has no uid yet; the server has not finished
    /// creating it.
    #[error("source has no uid")]
    MissingUid,
}

/// SourceRef is the back-reference a mirror carries to its source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRef {
    /// Source namespace.
    pub namespace: String,
    /// Source name.
    pub name: String,
    /// Source uid at the time the mirror was written.
    pub uid: String,
}

/// Source_ref extracts the back-reference annotations from a mirror, if all
/// three are present.
pub fn source_ref(meta: &ObjectMeta) -> Option<SourceRef> {
    let ann = meta.annotations.as_ref()?;
    Some(SourceRef {
        namespace: ann.get(keys::SOURCE_NAMESPACE_ANNOTATION)?.clone(),
        name: ann.get(keys::SOURCE_NAME_ANNOTATION)?.clone(),
        uid: ann.get(keys::SOURCE_UID_ANNOTATION)?.clone(),
    })
}

/// Is_managed reports whether this controller wrote the object.
pub fn is_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(keys::MANAGED_BY_LABEL))
        .is_some_and(|v| v == api::CONTROLLER_NAME)
}

/// Is_mirror reports whether the object carries the mirror marker.
pub fn is_mirror(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(keys::MIRROR_LABEL))
        .is_some_and(|v| v == keys::TRUE_VALUE)
}

/// MirrorBuilder builds and refreshes mirrors of one source object.
///
/// Constructing the builder snapshots everything the mirrors need from the
/// source: identity, payload, content hash, and generation. [`TryFrom`] fails
/// only when the source lacks server-assigned identity.
pub struct MirrorBuilder {
    source_namespace: String,
    source_name: String,
    source_uid: String,
    generation: Option<i64>,
    resource_version: Option<String>,
    types: Option<kube::api::TypeMeta>,
    kind: String,
    hash: String,
    payload: Value,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
}

impl TryFrom<&DynamicObject> for MirrorBuilder {
    type Error = Error;

    fn try_from(src: &DynamicObject) -> Result<Self, Error> {
        let meta = &src.metadata;
        let kind = src
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();

        let mut labels = meta.labels.clone().unwrap_or_default();
        let mut annotations = meta.annotations.clone().unwrap_or_default();
        for k in keys::CONTROLLER_KEYS {
            labels.remove(k);
            annotations.remove(k);
        }
        labels.insert(keys::MANAGED_BY_LABEL.into(), api::CONTROLLER_NAME.into());
        labels.insert(keys::MIRROR_LABEL.into(), keys::TRUE_VALUE.into());

        Ok(MirrorBuilder {
            source_namespace: meta.namespace.clone().ok_or(Error::MissingNamespace)?,
            source_name: meta.name.clone().ok_or(Error::MissingName)?,
            source_uid: meta.uid.clone().ok_or(Error::MissingUid)?,
            generation: meta.generation,
            resource_version: meta.resource_version.clone(),
            hash: content_hash(&kind, &src.data),
            payload: payload::copy_payload(&kind, &src.data),
            types: src.types.clone(),
            kind,
            labels,
            annotations,
        })
    }
}

impl MirrorBuilder {
    /// Hash is the content hash of the source payload this builder snapshot
    /// was taken from.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Generation is the source generation, when the source reports one.
    pub fn generation(&self) -> Option<i64> {
        self.generation
    }

    /// Build produces a fresh mirror for `target_ns`.
    ///
    /// `payload` overrides the copied source payload; pass the transformed
    /// document when transformation rules apply to this target, `None`
    /// otherwise. The content-hash annotation always records the untouched
    /// source payload.
    pub fn build(&self, target_ns: &str, payload: Option<Value>) -> DynamicObject {
        let mut annotations = self.annotations.clone();
        self.stamp(&mut annotations);

        DynamicObject {
            types: self.types.clone(),
            metadata: ObjectMeta {
                name: Some(self.source_name.clone()),
                namespace: Some(target_ns.to_string()),
                labels: Some(self.labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            data: payload.unwrap_or_else(|| self.payload.clone()),
        }
    }

    /// Update replaces an existing mirror's payload and refreshes the
    /// ownership annotations, leaving cluster-assigned identity alone. Any
    /// finalizers or owner references that have crept in are removed.
    pub fn update(&self, mirror: &mut DynamicObject, payload: Option<Value>) {
        mirror.data = payload.unwrap_or_else(|| self.payload.clone());

        let meta = &mut mirror.metadata;
        let labels = meta.labels.get_or_insert_default();
        for (k, v) in &self.labels {
            labels.insert(k.clone(), v.clone());
        }
        let annotations = meta.annotations.get_or_insert_default();
        self.stamp(annotations);
        meta.finalizers = None;
        meta.owner_references = None;
    }

    // Ownership annotations shared by build and update.
    fn stamp(&self, annotations: &mut BTreeMap<String, String>) {
        annotations.insert(
            keys::SOURCE_NAMESPACE_ANNOTATION.into(),
            self.source_namespace.clone(),
        );
        annotations.insert(keys::SOURCE_NAME_ANNOTATION.into(), self.source_name.clone());
        annotations.insert(keys::SOURCE_UID_ANNOTATION.into(), self.source_uid.clone());
        annotations.insert(keys::SOURCE_CONTENT_HASH_ANNOTATION.into(), self.hash.clone());
        annotations.insert(
            keys::LAST_SYNC_TIME_ANNOTATION.into(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        match self.generation {
            Some(g) if g != 0 => {
                annotations.insert(keys::SOURCE_GENERATION_ANNOTATION.into(), g.to_string());
            }
            _ => {
                annotations.remove(keys::SOURCE_GENERATION_ANNOTATION);
            }
        }
        match &self.resource_version {
            Some(rv) if !rv.is_empty() => {
                annotations.insert(keys::SOURCE_RESOURCE_VERSION_ANNOTATION.into(), rv.clone());
            }
            _ => {
                annotations.remove(keys::SOURCE_RESOURCE_VERSION_ANNOTATION);
            }
        }
    }

    /// Kind is the source kind this builder was constructed from.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Payload is the copied source payload (post `stringData` stripping for
    /// Secrets), for feeding to the transformer.
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
