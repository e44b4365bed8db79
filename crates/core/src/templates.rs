//! Workflow template store.
//!
//! Templates live in a single directory as pairs of files:
//!
//! * `<name>.json` -- the job graph in ComfyUI API format.
//! * `<name>.params.json` -- the [`InjectionMap`] for that graph
//!   (optional; a template without one is submitted unchanged).
//!
//! Templates are static per deployment, so there is no caching: each
//! request reads the files once.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::graph::JobGraph;
use crate::injection::InjectionMap;

/// Maximum length of a template name.
pub const MAX_TEMPLATE_NAME_LENGTH: usize = 128;

/// Allowed template name characters: alphanumeric, hyphen, underscore,
/// dot (but not leading). Keeps lookups inside the template directory.
fn is_safe_template_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TEMPLATE_NAME_LENGTH
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// A loaded template: the graph plus how to parameterize it.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    pub name: String,
    pub graph: JobGraph,
    pub injection: InjectionMap,
}

/// Reads workflow templates from a directory.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    root: PathBuf,
}

impl WorkflowStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load and check the template called `name`.
    ///
    /// Fails with [`CoreError::NotFound`] when no graph file exists and
    /// with [`CoreError::Internal`] when the files exist but are broken
    /// (bad JSON, failed structural checks, injection targets missing).
    pub fn load(&self, name: &str) -> Result<WorkflowTemplate, CoreError> {
        if !is_safe_template_name(name) {
            return Err(CoreError::Validation(format!(
                "invalid workflow template name '{name}'"
            )));
        }

        let graph_path = self.root.join(format!("{name}.json"));
        let graph_json = match read_json(&graph_path)? {
            Some(json) => json,
            None => {
                return Err(CoreError::NotFound {
                    entity: "Workflow template",
                    id: name.to_string(),
                })
            }
        };

        let graph = JobGraph::from_value(&graph_json).map_err(|e| broken(name, e))?;
        graph.validate().map_err(|e| broken(name, e))?;

        let params_path = self.root.join(format!("{name}.params.json"));
        let injection = match read_json(&params_path)? {
            Some(json) => serde_json::from_value::<InjectionMap>(json).map_err(|e| {
                CoreError::Internal(format!(
                    "Injection map {} is malformed: {e}",
                    params_path.display()
                ))
            })?,
            None => {
                tracing::warn!(
                    template = %name,
                    "No injection map found, template will be submitted unchanged",
                );
                InjectionMap::default()
            }
        };
        injection.check_targets(&graph).map_err(|e| broken(name, e))?;

        tracing::debug!(
            template = %name,
            nodes = graph.len(),
            parameters = injection.parameters.len(),
            "Loaded workflow template",
        );

        Ok(WorkflowTemplate {
            name: name.to_string(),
            graph,
            injection,
        })
    }
}

/// Read and parse a JSON file, returning `None` when it does not exist.
fn read_json(path: &Path) -> Result<Option<serde_json::Value>, CoreError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CoreError::Internal(format!(
                "Failed to read {}: {e}",
                path.display()
            )))
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| CoreError::Internal(format!("Failed to parse {}: {e}", path.display())))
}

fn broken(name: &str, err: CoreError) -> CoreError {
    CoreError::Internal(format!("Workflow template '{name}' is invalid: {err}"))
}
