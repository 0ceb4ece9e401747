//! Patterns implements the namespace pattern grammar used by the
//! target-namespaces and exclude annotations.
//!
//! A pattern is one of the sentinels `all` / `all-labeled`, a glob (`*`
//! matches zero or more characters, `?` exactly one), or a literal namespace
//! name.

use std::fmt;

use wildmatch::WildMatch;

use crate::keys::{ALL_LABELED_NAMESPACES, ALL_NAMESPACES};

/// Pattern is one parsed element of a targets or exclude annotation.
#[derive(Clone, Debug)]
pub enum Pattern {
    /// Every namespace passing the filter and not opted out.
    All,
    /// Every namespace carrying the opt-in label.
    AllLabeled,
    /// A glob over namespace names.
    Glob(WildMatch),
    /// A single namespace name.
    Literal(String),
}

impl Pattern {
    /// Parse validates a single pattern.
    ///
    /// Accepted: the two sentinels, and any string of lowercase
    /// alphanumerics, `-`, `.`, `*`, `?`. Anything else is a
    /// [`PatternError`].
    pub fn parse(s: &str) -> Result<Pattern, PatternError> {
        match s {
            "" => Err(PatternError::Empty),
            ALL_NAMESPACES => Ok(Pattern::All),
            ALL_LABELED_NAMESPACES => Ok(Pattern::AllLabeled),
            s => {
                if let Some(c) = s
                    .chars()
                    .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '-' | '.' | '*' | '?'))
                {
                    return Err(PatternError::BadChar(s.to_string(), c));
                }
                if s.contains(['*', '?']) {
                    Ok(Pattern::Glob(WildMatch::new(s)))
                } else {
                    Ok(Pattern::Literal(s.to_string()))
                }
            }
        }
    }

    /// Matches reports whether the namespace name satisfies this pattern.
    ///
    /// The sentinels do not match by name; they are expanded by the target
    /// resolver, which has the namespace sets in hand.
    pub fn matches(&self, ns: &str) -> bool {
        match self {
            Pattern::All | Pattern::AllLabeled => false,
            Pattern::Glob(g) => g.matches(ns),
            Pattern::Literal(l) => l == ns,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::All => f.write_str(ALL_NAMESPACES),
            Pattern::AllLabeled => f.write_str(ALL_LABELED_NAMESPACES),
            Pattern::Glob(g) => write!(f, "{g}"),
            Pattern::Literal(l) => f.write_str(l),
        }
    }
}

/// PatternError is a rejected pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// The pattern was empty after trimming.
    Empty,
    /// The pattern contained a character outside the namespace alphabet.
    BadChar(String, char),
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::Empty => f.write_str("empty pattern"),
            PatternError::BadChar(p, c) => write!(f, "pattern {p:?}: invalid character {c:?}"),
        }
    }
}

impl std::error::Error for PatternError {}

/// Parse_targets splits a targets or exclude annotation on commas, trims
/// whitespace, and drops empty elements. Invalid patterns are returned
/// alongside the good ones so the caller can log them per-pattern.
pub fn parse_targets(raw: &str) -> (Vec<Pattern>, Vec<PatternError>) {
    let mut out = Vec::new();
    let mut bad = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match Pattern::parse(part) {
            Ok(p) => out.push(p),
            Err(e) => bad.push(e),
        }
    }
    (out, bad)
}
