//! Source holds the per-source settings read from a source object's labels
//! and annotations.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::keys;
use crate::patterns::{self, Pattern, PatternError};

/// SourceSettings is everything the controller reads off a source object
/// besides its payload.
#[derive(Clone, Debug, Default)]
pub struct SourceSettings {
    /// The enablement label is present and `"true"`.
    pub enabled: bool,
    /// The sync annotation is present and `"true"`.
    pub sync: bool,
    /// Parsed target patterns; empty when the annotation is absent.
    pub targets: Vec<Pattern>,
    /// Parsed exclude patterns.
    pub exclude: Vec<Pattern>,
    /// Raw transform rule document, if any.
    pub transform: Option<String>,
    /// Per-source strict-transform override.
    pub transform_strict: Option<bool>,
    /// Patterns rejected during parsing, for logging.
    pub rejected: Vec<PatternError>,
}

impl SourceSettings {
    /// From_meta parses the settings out of object metadata. Absent keys
    /// yield the zero settings; malformed patterns land in `rejected`.
    pub fn from_meta(meta: &ObjectMeta) -> SourceSettings {
        let label = |k: &str| {
            meta.labels
                .as_ref()
                .and_then(|m| m.get(k))
                .map(String::as_str)
        };
        let annotation = |k: &str| {
            meta.annotations
                .as_ref()
                .and_then(|m| m.get(k))
                .map(String::as_str)
        };

        let mut s = SourceSettings {
            enabled: label(keys::ENABLED_LABEL) == Some(keys::TRUE_VALUE),
            sync: annotation(keys::SYNC_ANNOTATION) == Some(keys::TRUE_VALUE),
            transform: annotation(keys::TRANSFORM_ANNOTATION).map(String::from),
            transform_strict: annotation(keys::TRANSFORM_STRICT_ANNOTATION)
                .map(|v| v == keys::TRUE_VALUE),
            ..Default::default()
        };
        if let Some(raw) = annotation(keys::TARGET_NAMESPACES_ANNOTATION) {
            let (ps, bad) = patterns::parse_targets(raw);
            s.targets = ps;
            s.rejected.extend(bad);
        }
        if let Some(raw) = annotation(keys::EXCLUDE_ANNOTATION) {
            let (ps, bad) = patterns::parse_targets(raw);
            s.exclude = ps;
            s.rejected.extend(bad);
        }
        s
    }

    /// Active reports whether the source requests mirroring at all.
    pub fn active(&self) -> bool {
        self.enabled && self.sync
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn meta(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> ObjectMeta {
        let collect = |kvs: &[(&str, &str)]| {
            kvs.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        ObjectMeta {
            labels: Some(collect(labels)),
            annotations: Some(collect(annotations)),
            ..Default::default()
        }
    }

    #[test]
    fn inactive_without_both_switches() {
        let m = meta(&[(keys::ENABLED_LABEL, "true")], &[]);
        assert!(!SourceSettings::from_meta(&m).active());

        let m = meta(&[], &[(keys::SYNC_ANNOTATION, "true")]);
        assert!(!SourceSettings::from_meta(&m).active());

        let m = meta(
            &[(keys::ENABLED_LABEL, "true")],
            &[(keys::SYNC_ANNOTATION, "true")],
        );
        assert!(SourceSettings::from_meta(&m).active());
    }

    #[test]
    fn value_must_be_true() {
        let m = meta(
            &[(keys::ENABLED_LABEL, "True")],
            &[(keys::SYNC_ANNOTATION, "true")],
        );
        assert!(!SourceSettings::from_meta(&m).active());
    }

    #[test]
    fn parses_targets_and_excludes() {
        let m = meta(
            &[],
            &[
                (keys::TARGET_NAMESPACES_ANNOTATION, "app-*,prod"),
                (keys::EXCLUDE_ANNOTATION, "app-canary"),
            ],
        );
        let s = SourceSettings::from_meta(&m);
        assert_eq!(s.targets.len(), 2);
        assert_eq!(s.exclude.len(), 1);
        assert!(s.rejected.is_empty());
    }
}
