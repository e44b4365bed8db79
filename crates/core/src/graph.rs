//! ComfyUI job graphs (the "API format" prompt).
//!
//! A job graph is an object where each key is a node ID and each value
//! has a `class_type` and an `inputs` object:
//!
//! ```json
//! {
//!   "3": {
//!     "class_type": "KSampler",
//!     "inputs": { "seed": 42, "model": ["4", 0] }
//!   }
//! }
//! ```
//!
//! Inputs that connect to another node's output are encoded as a
//! two-element array `[source_node_id, output_index]`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// ComfyUI node class types
// ---------------------------------------------------------------------------

/// Terminal node classes that write images to the engine's output directory.
pub const OUTPUT_CLASSES: &[&str] = &["SaveImage", "Image Save"];

/// Node classes that run the diffusion sampler.
pub const SAMPLER_CLASSES: &[&str] = &[
    "KSampler",
    "KSamplerAdvanced",
    "SamplerCustom",
    "SamplerCustomAdvanced",
];

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// A single node in a job graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// ComfyUI class type (e.g. "KSampler", "CLIPTextEncode").
    pub class_type: String,
    /// Literal values and references keyed by input name.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Any other per-node keys (e.g. `_meta`), preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A reference from a node input to another node's output slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub node_id: String,
    pub output_index: u64,
}

impl NodeRef {
    /// Interpret an input value as a reference, if it has the
    /// `[node_id, output_index]` shape.
    ///
    /// ComfyUI accepts the node ID as either a string or a number.
    pub fn from_value(value: &Value) -> Option<Self> {
        let arr = value.as_array()?;
        if arr.len() != 2 {
            return None;
        }
        let node_id = match &arr[0] {
            Value::String(s) => s.clone(),
            Value::Number(n) if n.is_u64() => n.to_string(),
            _ => return None,
        };
        let output_index = arr[1].as_u64()?;
        Some(Self {
            node_id,
            output_index,
        })
    }
}

/// A connection between two nodes, as found in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConnection {
    /// Source node ID.
    pub from_node: String,
    /// Source output slot index.
    pub from_output: u64,
    /// Destination node ID.
    pub to_node: String,
    /// Destination input name.
    pub to_input: String,
}

/// A complete ComfyUI job graph keyed by node ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGraph {
    nodes: BTreeMap<String, Node>,
}

// ---------------------------------------------------------------------------
// Parsing and access
// ---------------------------------------------------------------------------

impl JobGraph {
    /// Parse a job graph from arbitrary JSON, reporting which node is
    /// malformed rather than a generic serde error.
    pub fn from_value(json: &Value) -> Result<Self, CoreError> {
        let obj = json
            .as_object()
            .ok_or_else(|| CoreError::Validation("Job graph must be a JSON object".to_string()))?;

        if obj.is_empty() {
            return Err(CoreError::Validation(
                "Job graph must contain at least one node".to_string(),
            ));
        }

        let mut nodes = BTreeMap::new();
        for (node_id, node_value) in obj {
            let node_obj = node_value.as_object().ok_or_else(|| {
                CoreError::Validation(format!("Node '{node_id}' must be a JSON object"))
            })?;

            let class_type = node_obj
                .get("class_type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    CoreError::Validation(format!(
                        "Node '{node_id}' is missing required 'class_type' field"
                    ))
                })?
                .to_string();

            let inputs = match node_obj.get("inputs") {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(map)) => map.clone(),
                Some(_) => {
                    return Err(CoreError::Validation(format!(
                        "Node '{node_id}' has non-object 'inputs'"
                    )))
                }
            };

            let extra = node_obj
                .iter()
                .filter(|(k, _)| k.as_str() != "class_type" && k.as_str() != "inputs")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            nodes.insert(
                node_id.clone(),
                Node {
                    class_type,
                    inputs,
                    extra,
                },
            );
        }

        Ok(Self { nodes })
    }

    /// Serialize back into the JSON shape ComfyUI expects.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node-to-node connection in the graph.
    pub fn connections(&self) -> Vec<NodeConnection> {
        let mut connections = Vec::new();
        for (node_id, node) in &self.nodes {
            for (input_name, value) in &node.inputs {
                if let Some(r) = NodeRef::from_value(value) {
                    connections.push(NodeConnection {
                        from_node: r.node_id,
                        from_output: r.output_index,
                        to_node: node_id.clone(),
                        to_input: input_name.clone(),
                    });
                }
            }
        }
        connections
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Check that every reference points at a node that exists.
    ///
    /// All dangling references are reported in one error.
    pub fn validate_references(&self) -> Result<(), CoreError> {
        let dangling: Vec<String> = self
            .connections()
            .into_iter()
            .filter(|c| !self.nodes.contains_key(&c.from_node))
            .map(|c| {
                format!(
                    "node '{}' input '{}' references missing node '{}'",
                    c.to_node, c.to_input, c.from_node
                )
            })
            .collect();

        if dangling.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(dangling.join("; ")))
        }
    }

    /// Return the ID of the single terminal output node.
    ///
    /// Fails when the graph has zero or more than one output node.
    pub fn output_node(&self) -> Result<&str, CoreError> {
        let outputs: Vec<&String> = self
            .nodes
            .iter()
            .filter(|(_, n)| OUTPUT_CLASSES.contains(&n.class_type.as_str()))
            .map(|(id, _)| id)
            .collect();

        match outputs.as_slice() {
            [only] => Ok(only.as_str()),
            [] => Err(CoreError::Validation(
                "Job graph has no image output node".to_string(),
            )),
            many => Err(CoreError::Validation(format!(
                "Job graph has {} image output nodes, expected exactly one: {}",
                many.len(),
                many.iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Full structural check used for templated workflows: references
    /// resolve, there is exactly one output node, and a sampler feeds it.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.validate_references()?;
        let output = self.output_node()?;

        let upstream = self.upstream_of(output);
        let has_sampler = upstream.iter().any(|id| {
            self.nodes
                .get(id.as_str())
                .is_some_and(|n| SAMPLER_CLASSES.contains(&n.class_type.as_str()))
        });

        if !has_sampler {
            return Err(CoreError::Validation(format!(
                "Output node '{output}' is not reachable from any sampler node"
            )));
        }
        Ok(())
    }

    /// All node IDs reachable by walking references backwards from `start`.
    fn upstream_of(&self, start: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.to_string()]);

        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            for value in node.inputs.values() {
                if let Some(r) = NodeRef::from_value(value) {
                    if seen.insert(r.node_id.clone()) {
                        queue.push_back(r.node_id);
                    }
                }
            }
        }
        seen
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
