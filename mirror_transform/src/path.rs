//! Dotted-path navigation over JSON documents.
//!
//! Paths are dot-separated keys with bracketed numeric indices, e.g.
//! `items[0].field`. Setting creates intermediate objects as needed; arrays
//! are never grown implicitly.

use serde_json::{Map, Value};

use crate::Error;

/// Step is one component of a parsed path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// A map key.
    Key(String),
    /// An array index.
    Index(usize),
}

/// Parse splits a dotted path into steps.
pub fn parse(path: &str) -> Result<Vec<Step>, Error> {
    if path.is_empty() {
        return Err(Error::EmptyPath);
    }
    let mut steps = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(Error::BadPath(path.to_string()));
        }
        let (key, rest) = match part.find('[') {
            Some(i) => part.split_at(i),
            None => (part, ""),
        };
        if key.is_empty() {
            return Err(Error::BadPath(path.to_string()));
        }
        steps.push(Step::Key(key.to_string()));
        let mut rest = rest;
        while let Some(stripped) = rest.strip_prefix('[') {
            let Some(end) = stripped.find(']') else {
                return Err(Error::BadPath(path.to_string()));
            };
            let idx: usize = stripped[..end]
                .parse()
                .map_err(|_| Error::BadPath(path.to_string()))?;
            steps.push(Step::Index(idx));
            rest = &stripped[end.saturating_add(1)..];
        }
        if !rest.is_empty() {
            return Err(Error::BadPath(path.to_string()));
        }
    }
    Ok(steps)
}

// Walks to the parent of the final step, creating intermediate objects for
// key steps when `create` is set. Returns None when the walk dead-ends.
fn descend<'a>(doc: &'a mut Value, steps: &[Step], create: bool) -> Option<&'a mut Value> {
    let mut cur = doc;
    for step in steps {
        cur = match step {
            Step::Key(k) => {
                if !cur.is_object() {
                    if !create || !cur.is_null() {
                        return None;
                    }
                    *cur = Value::Object(Map::new());
                }
                let m = cur.as_object_mut()?;
                if !m.contains_key(k) {
                    if !create {
                        return None;
                    }
                    m.insert(k.clone(), Value::Object(Map::new()));
                }
                m.get_mut(k)?
            }
            Step::Index(i) => cur.as_array_mut()?.get_mut(*i)?,
        };
    }
    Some(cur)
}

/// Set writes `value` at `path`, creating intermediate objects.
pub fn set(doc: &mut Value, path: &str, value: Value) -> Result<(), Error> {
    let steps = parse(path)?;
    let (last, parents) = steps.split_last().expect("parse rejects empty paths");
    let parent = descend(doc, parents, true).ok_or_else(|| Error::Unreachable(path.to_string()))?;
    match last {
        Step::Key(k) => {
            if parent.is_null() {
                *parent = Value::Object(Map::new());
            }
            parent
                .as_object_mut()
                .ok_or_else(|| Error::Unreachable(path.to_string()))?
                .insert(k.clone(), value);
        }
        Step::Index(i) => {
            let slot = parent
                .as_array_mut()
                .and_then(|a| a.get_mut(*i))
                .ok_or_else(|| Error::Unreachable(path.to_string()))?;
            *slot = value;
        }
    }
    Ok(())
}

/// Merge unions `entries` into the map at `path`, creating the map if it is
/// absent. Existing keys are overwritten.
pub fn merge(doc: &mut Value, path: &str, entries: &Map<String, Value>) -> Result<(), Error> {
    let steps = parse(path)?;
    let target = descend(doc, &steps, true).ok_or_else(|| Error::Unreachable(path.to_string()))?;
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let m = target
        .as_object_mut()
        .ok_or_else(|| Error::NotAMap(path.to_string()))?;
    for (k, v) in entries {
        m.insert(k.clone(), v.clone());
    }
    Ok(())
}

/// Delete removes the value at `path`. A path that does not resolve is a
/// no-op.
pub fn delete(doc: &mut Value, path: &str) -> Result<(), Error> {
    let steps = parse(path)?;
    let (last, parents) = steps.split_last().expect("parse rejects empty paths");
    let Some(parent) = descend(doc, parents, false) else {
        return Ok(());
    };
    match last {
        Step::Key(k) => {
            if let Some(m) = parent.as_object_mut() {
                m.remove(k);
            }
        }
        Step::Index(i) => {
            if let Some(a) = parent.as_array_mut() {
                if *i < a.len() {
                    a.remove(*i);
                }
            }
        }
    }
    Ok(())
}
