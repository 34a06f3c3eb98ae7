// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Desired-state composition.
//!
//! Merges a version's baseline values with a caller-supplied override into
//! the manifest that gets stored, plus a delta holding only the keys the
//! override actually changed. The delta is what ships to the agent.
//!
//! # Merge Rules
//!
//! 1. An empty override, or one textually identical to the baseline, is a
//!    no-op: `merged` is the baseline verbatim and `delta` is empty.
//! 2. Otherwise both documents must parse as YAML mappings (an empty
//!    document counts as an empty mapping).
//! 3. Override keys recursively replace baseline keys. Mappings merge key
//!    by key; any other value (scalars, sequences) replaces wholesale.
//! 4. Keys whose override value equals the baseline value are left out of
//!    the delta. If nothing changed, rule 1's output is returned.
//! 5. The merged document is re-parsed before being returned.
//!
//! # Example
//!
//! ```
//! use bosun_control::compose::compose;
//!
//! let result = compose("image:\n  tag: v1\nreplicas: 1\n", "replicas: 2\n").unwrap();
//! assert_eq!(result.delta, "replicas: 2\n");
//! assert!(result.merged.contains("tag: v1"));
//! ```

use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Maximum nesting depth accepted in either document.
const MAX_DEPTH: usize = 128;

/// Errors raised while composing desired state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ComposeError {
    /// A document does not parse.
    #[error("{document} document is not valid YAML: {message}")]
    InvalidDocument {
        /// Which input failed (`baseline` or `override`).
        document: &'static str,
        /// Parser message.
        message: String,
    },

    /// A document parses but is not a mapping.
    #[error("{document} document must be a mapping at the top level")]
    NotAMapping {
        /// Which input failed.
        document: &'static str,
    },

    /// The recursion depth limit was exceeded.
    #[error("recursion limit exceeded: document nested deeper than {max_depth} levels")]
    RecursionLimitExceeded {
        /// The maximum depth that was exceeded.
        max_depth: usize,
    },

    /// The merged document could not be rendered back to valid YAML.
    #[error("merged document is not valid YAML: {0}")]
    Serialize(String),
}

/// Output of [`compose`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    /// Full manifest for storage.
    pub merged: String,
    /// Keys changed by the override, empty when nothing changed.
    pub delta: String,
    /// Dotted paths of every changed leaf.
    pub changed_paths: Vec<String>,
}

impl Composition {
    /// Whether the override changed nothing.
    pub fn is_unchanged(&self) -> bool {
        self.delta.is_empty()
    }

    fn unchanged(baseline: &str) -> Self {
        Self {
            merged: baseline.to_string(),
            delta: String::new(),
            changed_paths: Vec::new(),
        }
    }
}

/// Merge `overrides` into `baseline`.
pub fn compose(baseline: &str, overrides: &str) -> Result<Composition, ComposeError> {
    if overrides.trim().is_empty() || overrides == baseline {
        validate(baseline).map_err(|e| relabel(e, "baseline"))?;
        return Ok(Composition::unchanged(baseline));
    }

    let mut merged = parse_mapping("baseline", baseline)?;
    let overrides = parse_mapping("override", overrides)?;

    let mut delta = Mapping::new();
    let mut changed_paths = Vec::new();
    let mut path = Vec::new();
    merge_into(
        &mut merged,
        &overrides,
        &mut delta,
        &mut path,
        &mut changed_paths,
        0,
    )?;

    if delta.is_empty() {
        return Ok(Composition::unchanged(baseline));
    }

    let merged = render(&Value::Mapping(merged))?;
    let delta = render(&Value::Mapping(delta))?;

    Ok(Composition {
        merged,
        delta,
        changed_paths,
    })
}

/// Check that a document parses as a YAML mapping within the depth limit.
pub fn validate(document: &str) -> Result<(), ComposeError> {
    parse_mapping("override", document).map(|_| ())
}

/// Parse a document that must be a mapping. Empty text is an empty mapping.
pub fn parse_mapping(label: &'static str, text: &str) -> Result<Mapping, ComposeError> {
    if text.trim().is_empty() {
        return Ok(Mapping::new());
    }

    let value: Value = serde_yaml::from_str(text).map_err(|e| ComposeError::InvalidDocument {
        document: label,
        message: e.to_string(),
    })?;
    check_depth(&value, 0)?;

    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(map) => Ok(map),
        _ => Err(ComposeError::NotAMapping { document: label }),
    }
}

fn relabel(err: ComposeError, label: &'static str) -> ComposeError {
    match err {
        ComposeError::InvalidDocument { message, .. } => ComposeError::InvalidDocument {
            document: label,
            message,
        },
        ComposeError::NotAMapping { .. } => ComposeError::NotAMapping { document: label },
        other => other,
    }
}

fn check_depth(value: &Value, depth: usize) -> Result<(), ComposeError> {
    if depth > MAX_DEPTH {
        return Err(ComposeError::RecursionLimitExceeded {
            max_depth: MAX_DEPTH,
        });
    }
    match value {
        Value::Mapping(map) => map.values().try_for_each(|v| check_depth(v, depth + 1)),
        Value::Sequence(seq) => seq.iter().try_for_each(|v| check_depth(v, depth + 1)),
        Value::Tagged(tagged) => check_depth(&tagged.value, depth + 1),
        _ => Ok(()),
    }
}

fn merge_into(
    base: &mut Mapping,
    overrides: &Mapping,
    delta: &mut Mapping,
    path: &mut Vec<String>,
    changed_paths: &mut Vec<String>,
    depth: usize,
) -> Result<(), ComposeError> {
    if depth > MAX_DEPTH {
        return Err(ComposeError::RecursionLimitExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    for (key, value) in overrides {
        path.push(key_label(key));

        if let (Some(Value::Mapping(nested_base)), Value::Mapping(nested_override)) =
            (base.get_mut(key), value)
        {
            let mut nested_delta = Mapping::new();
            merge_into(
                nested_base,
                nested_override,
                &mut nested_delta,
                path,
                changed_paths,
                depth + 1,
            )?;
            if !nested_delta.is_empty() {
                delta.insert(key.clone(), Value::Mapping(nested_delta));
            }
        } else if base.get(key) != Some(value) {
            base.insert(key.clone(), value.clone());
            delta.insert(key.clone(), value.clone());
            changed_paths.push(path.join("."));
        }

        path.pop();
    }

    Ok(())
}

fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn render(value: &Value) -> Result<String, ComposeError> {
    let text = serde_yaml::to_string(value).map_err(|e| ComposeError::Serialize(e.to_string()))?;
    serde_yaml::from_str::<Value>(&text).map_err(|e| ComposeError::Serialize(e.to_string()))?;
    Ok(text)
}
