//! Targets resolves a source's namespace patterns into the concrete set of
//! namespaces its mirrors belong in.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use wildmatch::WildMatch;

use api::keys;
use api::patterns::Pattern;

/// SYSTEM_NAMESPACES is the default exclusion list: the platform's own
/// namespaces are never mirror targets unless the operator says otherwise.
pub const SYSTEM_NAMESPACES: [&str; 4] = [
    "kube-system",
    "kube-public",
    "kube-node-lease",
    "openshift-*",
];

/// NamespaceInfo is the slice of a Namespace the resolver needs.
#[derive(Clone, Debug)]
pub struct NamespaceInfo {
    /// The namespace name.
    pub name: String,
    /// The value of the allow-mirrors label, parsed: `Some(true)` opted in,
    /// `Some(false)` opted out, `None` unlabeled.
    pub allow: Option<bool>,
}

impl NamespaceInfo {
    /// From_namespace projects a Namespace object.
    pub fn from_namespace(ns: &Namespace) -> NamespaceInfo {
        let allow = ns
            .labels()
            .get(keys::ALLOW_MIRRORS_LABEL)
            .map(|v| v == keys::TRUE_VALUE);
        NamespaceInfo {
            name: ns.name_any(),
            allow,
        }
    }
}

/// NamespaceFilter is the operator-configured eligibility check applied to
/// every candidate target.
#[derive(Clone, Debug, Default)]
pub struct NamespaceFilter {
    deny: Vec<WildMatch>,
    allow: Vec<WildMatch>,
    watch: Vec<String>,
}

impl NamespaceFilter {
    /// New compiles the deny and allow glob lists and the watch-namespace
    /// restriction. An empty allow list disables include filtering; an empty
    /// watch list means cluster-wide.
    pub fn new(deny: &[String], allow: &[String], watch: &[String]) -> NamespaceFilter {
        let compile = |globs: &[String]| globs.iter().map(|g| WildMatch::new(g)).collect();
        NamespaceFilter {
            deny: compile(deny),
            allow: compile(allow),
            watch: watch.to_vec(),
        }
    }

    /// Permits reports whether the namespace may receive mirrors.
    pub fn permits(&self, ns: &str) -> bool {
        if self.deny.iter().any(|g| g.matches(ns)) {
            return false;
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|g| g.matches(ns)) {
            return false;
        }
        if !self.watch.is_empty() && !self.watch.iter().any(|w| w == ns) {
            return false;
        }
        true
    }
}

/// Resolve is the full pattern resolution for one source.
///
/// Patterns union; the exclude globs are subtracted afterwards; the
/// opt-in requirement gates last. The source's own namespace never appears
/// in the result.
pub struct Resolve<'a> {
    /// The parsed target patterns.
    pub patterns: &'a [Pattern],
    /// Exclude globs subtracted from the union.
    pub exclude: &'a [Pattern],
    /// The namespace view to resolve against.
    pub namespaces: &'a [NamespaceInfo],
    /// The source's own namespace.
    pub source_namespace: &'a str,
    /// The operator filter.
    pub filter: &'a NamespaceFilter,
    /// When set, only opted-in namespaces are eligible.
    pub require_opt_in: bool,
}

impl Resolve<'_> {
    /// Run computes the target set.
    pub fn run(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for p in self.patterns {
            match p {
                Pattern::All => {
                    for ns in self.namespaces {
                        if ns.allow != Some(false) && self.eligible(&ns.name) {
                            out.insert(ns.name.clone());
                        }
                    }
                }
                Pattern::AllLabeled => {
                    for ns in self.namespaces {
                        if ns.allow == Some(true) && self.eligible(&ns.name) {
                            out.insert(ns.name.clone());
                        }
                    }
                }
                Pattern::Glob(_) => {
                    for ns in self.namespaces {
                        if p.matches(&ns.name) && self.eligible(&ns.name) {
                            out.insert(ns.name.clone());
                        }
                    }
                }
                // A bare name resolves to itself: a target created later is
                // picked up by the namespace watcher.
                Pattern::Literal(name) => {
                    if self.eligible(name) {
                        out.insert(name.clone());
                    }
                }
            }
        }
        out.retain(|ns| !self.exclude.iter().any(|p| p.matches(ns)));
        if self.require_opt_in {
            out.retain(|ns| {
                self.namespaces
                    .iter()
                    .any(|n| &n.name == ns && n.allow == Some(true))
            });
        }
        out
    }

    fn eligible(&self, ns: &str) -> bool {
        ns != self.source_namespace && self.filter.permits(ns)
    }
}
