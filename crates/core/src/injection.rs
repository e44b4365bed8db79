//! Declarative parameter injection.
//!
//! Each workflow template ships an [`InjectionMap`] describing which
//! node inputs a user-facing parameter writes to. Injection is split in
//! two phases so that bad input is rejected before the graph is touched:
//!
//! 1. [`InjectionMap::resolve`] validates the payload against the map
//!    and produces concrete [`ResolvedParameters`] (defaults filled in,
//!    random seeds drawn).
//! 2. [`inject`] writes those values into a copy of the graph. It is a
//!    pure function: applying it twice gives the same graph as once.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::graph::{JobGraph, NodeRef};

/// Upper bound (inclusive) for randomly drawn seeds.
pub const MAX_RANDOM_SEED: u64 = 1_000_000;

/// Expected JSON type of a parameter value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Any,
    String,
    Integer,
    Number,
}

impl ValueKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            ValueKind::String => value.is_string(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Number => value.is_number(),
        }
    }
}

/// A node input that a parameter writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTarget {
    pub node: String,
    pub input: String,
}

/// How one user-facing parameter maps onto the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterBinding {
    /// Node inputs that receive the value. One parameter may fan out to
    /// several inputs (e.g. width into both a latent and a scaler node).
    pub targets: Vec<InputTarget>,
    /// Reject the job when the parameter is absent and has no default.
    #[serde(default)]
    pub required: bool,
    /// Value used when the payload omits the parameter.
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub kind: ValueKind,
    /// Draw a seed in `0..=MAX_RANDOM_SEED` when the payload omits it.
    #[serde(default)]
    pub random_seed: bool,
}

/// Per-workflow mapping from parameter names to node inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectionMap {
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterBinding>,
}

/// Concrete, validated values ready to be written into a graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedParameters(BTreeMap<String, Value>);

impl ResolvedParameters {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl InjectionMap {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Validate a user payload against this map.
    ///
    /// All problems are collected and returned as one
    /// [`CoreError::Validation`]. Parameters the map does not know are
    /// ignored.
    pub fn resolve(&self, payload: &Map<String, Value>) -> Result<ResolvedParameters, CoreError> {
        let mut resolved = BTreeMap::new();
        let mut errors = Vec::new();

        for (name, binding) in &self.parameters {
            match payload.get(name).filter(|v| !v.is_null()) {
                Some(value) => {
                    if binding.kind.accepts(value) {
                        resolved.insert(name.clone(), value.clone());
                    } else {
                        errors.push(format!(
                            "parameter '{name}' must be of type {:?}, got {value}",
                            binding.kind
                        ));
                    }
                }
                None => {
                    if let Some(default) = &binding.default {
                        resolved.insert(name.clone(), default.clone());
                    } else if binding.random_seed {
                        let seed = rand::rng().random_range(0..=MAX_RANDOM_SEED);
                        resolved.insert(name.clone(), Value::from(seed));
                    } else if binding.required {
                        errors.push(format!("missing required parameter '{name}'"));
                    }
                }
            }
        }

        for name in payload.keys() {
            if !self.parameters.contains_key(name) {
                tracing::debug!(parameter = %name, "Ignoring unknown parameter");
            }
        }

        if errors.is_empty() {
            Ok(ResolvedParameters(resolved))
        } else {
            Err(CoreError::Validation(errors.join("; ")))
        }
    }

    /// Check that every target names an existing node and a literal
    /// input on it. Overwriting a reference would detach the graph, so
    /// such targets are rejected too.
    pub fn check_targets(&self, graph: &JobGraph) -> Result<(), CoreError> {
        let mut errors = Vec::new();

        for (name, binding) in &self.parameters {
            for target in &binding.targets {
                match graph.node(&target.node) {
                    None => errors.push(format!(
                        "parameter '{name}' targets missing node '{}'",
                        target.node
                    )),
                    Some(node) => match node.inputs.get(&target.input) {
                        None => errors.push(format!(
                            "parameter '{name}' targets missing input '{}' on node '{}'",
                            target.input, target.node
                        )),
                        Some(v) if NodeRef::from_value(v).is_some() => errors.push(format!(
                            "parameter '{name}' targets connected input '{}' on node '{}'",
                            target.input, target.node
                        )),
                        Some(_) => {}
                    },
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(errors.join("; ")))
        }
    }
}

/// Write resolved parameters into a copy of `graph`.
///
/// Targets are assumed to have passed [`InjectionMap::check_targets`];
/// a target node that has since disappeared is an internal error.
pub fn inject(
    graph: &JobGraph,
    map: &InjectionMap,
    params: &ResolvedParameters,
) -> Result<JobGraph, CoreError> {
    let mut out = graph.clone();

    for (name, binding) in &map.parameters {
        let Some(value) = params.get(name) else {
            continue;
        };
        for target in &binding.targets {
            let node = out.node_mut(&target.node).ok_or_else(|| {
                CoreError::Internal(format!(
                    "Injection target node '{}' for '{name}' does not exist",
                    target.node
                ))
            })?;
            node.inputs.insert(target.input.clone(), value.clone());
        }
    }

    Ok(out)
}
