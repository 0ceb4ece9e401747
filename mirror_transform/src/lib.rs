#![cfg_attr(debug_assertions, warn(missing_docs))]
#![cfg_attr(not(debug_assertions), deny(missing_docs))]

//! Mirror_transform applies declarative rewrite rules to mirror payloads.
//!
//! Rules arrive as a YAML list on the source's transform annotation. Each
//! rule addresses a dotted path and carries exactly one action: a static
//! `value`, a `template`, a `merge` map, or `delete`. An optional
//! `namespacePattern` glob restricts the rule to matching target namespaces.
//!
//! Templates are handlebars text with the variables `TargetNamespace`,
//! `SourceNamespace`, `SourceName`, `TargetName`, `Labels`, `Annotations`
//! and the helpers `upper`, `lower`, `trimPrefix`, `trimSuffix`, `replace`,
//! `hasPrefix`, `hasSuffix`, `default`. Helper arguments follow the value:
//! `{{trimPrefix SourceName "team-"}}`.
//!
//! ```
//! # use serde_json::json;
//! use mirror_transform::{Limits, TemplateContext, Transformer};
//!
//! let t = Transformer::new(Limits::default());
//! let rules = t.parse(r#"
//! - path: data.URL
//!   template: "https://{{TargetNamespace}}.x"
//! "#).unwrap();
//! let ctx = TemplateContext {
//!     target_namespace: "app-1".into(),
//!     source_namespace: "default".into(),
//!     source_name: "cm".into(),
//!     target_name: "cm".into(),
//!     ..Default::default()
//! };
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let out = t.apply(&rules, json!({ "data": {} }), &ctx, true).await.unwrap();
//! assert_eq!(out.payload, json!({ "data": { "URL": "https://app-1.x" } }));
//! # });
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use handlebars::{Handlebars, handlebars_helper};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use api::patterns::Pattern;

pub mod path;

/// Error is the error domain for transform parsing and application.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The annotation exceeds the configured byte cap.
    #[error("transform annotation is {size} bytes, cap is {max}")]
    TooLarge {
        /// Observed size.
        size: usize,
        /// Configured cap.
        max: usize,
    },
    /// The rule list exceeds the configured rule cap.
    #[error("transform has {count} rules, cap is {max}")]
    TooMany {
        /// Observed count.
        count: usize,
        /// Configured cap.
        max: usize,
    },
    /// The annotation is not a YAML rule list.
    #[error("transform parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A rule has an empty path.
    #[error("rule has an empty path")]
    EmptyPath,
    /// A rule path failed to parse.
    #[error("bad path: {0}")]
    BadPath(String),
    /// A rule path addressed a location that does not exist.
    #[error("path does not resolve: {0}")]
    Unreachable(String),
    /// A merge rule addressed a non-map value.
    #[error("merge target is not a map: {0}")]
    NotAMap(String),
    /// A rule carries no action.
    #[error("rule for {0:?} has no action")]
    NoAction(String),
    /// A rule carries more than one action.
    #[error("rule for {0:?} has multiple actions")]
    MultipleActions(String),
    /// A rule's namespacePattern failed to parse.
    #[error("bad namespacePattern: {0}")]
    BadPattern(String),
    /// Template rendering failed.
    #[error("template error: {0}")]
    Render(#[from] Box<handlebars::RenderError>),
    /// Template rendering exceeded the configured timeout.
    #[error("template render timed out after {0:?}")]
    Timeout(Duration),
}

/// Limits bounds what a single source may ask of the transformer.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Maximum number of rules per annotation.
    pub max_rules: usize,
    /// Maximum annotation size in bytes.
    pub max_bytes: usize,
    /// Hard cap on a single template render.
    pub render_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_rules: 64,
            max_bytes: 16 * 1024,
            render_timeout: Duration::from_millis(100),
        }
    }
}

/// Rule is one declarative rewrite.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rule {
    /// Dot-separated path, with bracketed numeric indices.
    pub path: String,
    /// Static string to write at the path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Template to render and write at the path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Map to union into the map at the path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<Map<String, Value>>,
    /// Remove the value at the path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<bool>,
    /// Glob restricting the rule to matching target namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_pattern: Option<String>,
}

// The single action a validated rule performs.
enum RuleAction<'a> {
    Value(&'a str),
    Template(&'a str),
    Merge(&'a Map<String, Value>),
    Delete,
}

impl Rule {
    // Validates shape: non-empty path, exactly one action.
    fn action(&self) -> Result<RuleAction<'_>, Error> {
        if self.path.is_empty() {
            return Err(Error::EmptyPath);
        }
        let mut actions = Vec::new();
        if let Some(v) = &self.value {
            actions.push(RuleAction::Value(v));
        }
        if let Some(t) = &self.template {
            actions.push(RuleAction::Template(t));
        }
        if let Some(m) = &self.merge {
            actions.push(RuleAction::Merge(m));
        }
        if self.delete == Some(true) {
            actions.push(RuleAction::Delete);
        }
        match actions.len() {
            0 => Err(Error::NoAction(self.path.clone())),
            1 => Ok(actions.pop().expect("len checked")),
            _ => Err(Error::MultipleActions(self.path.clone())),
        }
    }

    // Whether the rule applies to this target namespace.
    fn applies_to(&self, target_ns: &str) -> Result<bool, Error> {
        match &self.namespace_pattern {
            None => Ok(true),
            Some(p) => {
                let pat = Pattern::parse(p).map_err(|e| Error::BadPattern(e.to_string()))?;
                Ok(pat.matches(target_ns))
            }
        }
    }
}

/// TemplateContext is the data exposed to rule templates.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateContext {
    /// Namespace the mirror is being written into.
    pub target_namespace: String,
    /// Namespace of the source object.
    pub source_namespace: String,
    /// Name of the source object.
    pub source_name: String,
    /// Name of the mirror (same as the source name).
    pub target_name: String,
    /// Source labels, controller keys stripped.
    pub labels: BTreeMap<String, String>,
    /// Source annotations, controller keys stripped.
    pub annotations: BTreeMap<String, String>,
}

/// Applied is the result of a lax-mode application: the rewritten payload
/// plus the rules that were skipped, for logging.
#[derive(Debug)]
pub struct Applied {
    /// The rewritten payload.
    pub payload: Value,
    /// `(rule index, error)` for each rule skipped in lax mode.
    pub skipped: Vec<(usize, Error)>,
}

/// Transformer owns the template registry and the limits.
pub struct Transformer {
    registry: Arc<Handlebars<'static>>,
    limits: Limits,
}

impl Transformer {
    /// New builds a transformer with the helper set registered.
    pub fn new(limits: Limits) -> Transformer {
        let mut hb = Handlebars::new();
        hb.set_strict_mode(false);
        register_helpers(&mut hb);
        Transformer {
            registry: Arc::new(hb),
            limits,
        }
    }

    /// Parse reads the transform annotation into a rule list, enforcing the
    /// size caps. Shape validation happens per-rule at apply time so lax
    /// mode can skip bad rules individually.
    pub fn parse(&self, raw: &str) -> Result<Vec<Rule>, Error> {
        if raw.len() > self.limits.max_bytes {
            return Err(Error::TooLarge {
                size: raw.len(),
                max: self.limits.max_bytes,
            });
        }
        let rules: Vec<Rule> = serde_yaml::from_str(raw)?;
        if rules.len() > self.limits.max_rules {
            return Err(Error::TooMany {
                count: rules.len(),
                max: self.limits.max_rules,
            });
        }
        Ok(rules)
    }

    /// Apply runs the rules in declaration order against `payload`.
    ///
    /// In strict mode the first error aborts and the payload is discarded.
    /// In lax mode failing rules are skipped and reported in
    /// [`Applied::skipped`]; writes from earlier rules remain visible to
    /// later ones either way.
    pub async fn apply(
        &self,
        rules: &[Rule],
        payload: Value,
        ctx: &TemplateContext,
        strict: bool,
    ) -> Result<Applied, Error> {
        let mut doc = payload;
        let mut skipped = Vec::new();
        for (i, rule) in rules.iter().enumerate() {
            match self.apply_one(rule, &mut doc, ctx).await {
                Ok(()) => (),
                Err(e) if strict => return Err(e),
                Err(e) => {
                    warn!(rule = i, error = %e, "skipping transform rule");
                    skipped.push((i, e));
                }
            }
        }
        Ok(Applied {
            payload: doc,
            skipped,
        })
    }

    async fn apply_one(
        &self,
        rule: &Rule,
        doc: &mut Value,
        ctx: &TemplateContext,
    ) -> Result<(), Error> {
        if !rule.applies_to(&ctx.target_namespace)? {
            return Ok(());
        }
        match rule.action()? {
            RuleAction::Value(v) => path::set(doc, &rule.path, Value::String(v.to_string())),
            RuleAction::Template(t) => {
                let rendered = self.render(t, ctx).await?;
                path::set(doc, &rule.path, Value::String(rendered))
            }
            RuleAction::Merge(m) => path::merge(doc, &rule.path, m),
            RuleAction::Delete => path::delete(doc, &rule.path),
        }
    }

    // Renders on a blocking task so the render deadline bounds wall time;
    // an expired render's result is discarded.
    async fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String, Error> {
        let hb = Arc::clone(&self.registry);
        let template = template.to_string();
        let ctx = ctx.clone();
        let deadline = self.limits.render_timeout;
        let fut = tokio::task::spawn_blocking(move || hb.render_template(&template, &ctx));
        match tokio::time::timeout(deadline, fut).await {
            Err(_) => Err(Error::Timeout(deadline)),
            Ok(Err(join)) => Err(Error::Render(Box::new(handlebars::RenderError::from_error(
                "render task failed",
                join,
            )))),
            Ok(Ok(res)) => res.map_err(|e| Error::Render(Box::new(e))),
        }
    }
}

fn register_helpers(hb: &mut Handlebars<'_>) {
    handlebars_helper!(upper: |s: String| s.to_uppercase());
    handlebars_helper!(lower: |s: String| s.to_lowercase());
    handlebars_helper!(trim_prefix: |s: String, p: String| {
        s.strip_prefix(p.as_str()).unwrap_or(&s).to_string()
    });
    handlebars_helper!(trim_suffix: |s: String, p: String| {
        s.strip_suffix(p.as_str()).unwrap_or(&s).to_string()
    });
    handlebars_helper!(replace: |s: String, from: String, to: String| {
        s.replace(from.as_str(), to.as_str())
    });
    handlebars_helper!(has_prefix: |s: String, p: String| s.starts_with(p.as_str()));
    handlebars_helper!(has_suffix: |s: String, p: String| s.ends_with(p.as_str()));
    // Json-typed so an absent variable falls through instead of erroring.
    handlebars_helper!(default_value: |s: Json, d: String| {
        match s.as_str() {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => d,
        }
    });

    hb.register_helper("upper", Box::new(upper));
    hb.register_helper("lower", Box::new(lower));
    hb.register_helper("trimPrefix", Box::new(trim_prefix));
    hb.register_helper("trimSuffix", Box::new(trim_suffix));
    hb.register_helper("replace", Box::new(replace));
    hb.register_helper("hasPrefix", Box::new(has_prefix));
    hb.register_helper("hasSuffix", Box::new(has_suffix));
    hb.register_helper("default", Box::new(default_value));
}
