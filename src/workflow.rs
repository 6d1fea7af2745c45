// Workflow templates, as exported from ComfyUI with "Save (API format)".
//
// A template maps node ids to node records. We only care about three nodes, found by metadata:
// the positive prompt text, the sampler, and the image loader. Everything else is passed through as-is.

use std::{fmt, path::Path};

use anyhow::{Context, Result};
use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const POSITIVE_PROMPT_TITLE: &str = "CLIP Text Encode (Positive Prompt)";
pub const SAMPLER_CLASS: &str = "KSampler";
pub const LOAD_IMAGE_CLASS: &str = "LoadImage";

/// Seeds are drawn from [0, SEED_LIMIT).
pub const SEED_LIMIT: u64 = 9_999_999_999;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow template missing required node: {marker}")]
    MissingNode { marker: NodeMarker },

    #[error("workflow node '{id}' is malformed: {reason}")]
    MalformedNode { id: String, reason: String },
}

/// How a node is recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeMarker {
    /// `_meta.title` equals this.
    Title(String),
    /// `class_type` equals this.
    ClassType(String),
}

impl NodeMarker {
    fn matches(&self, node: &Value) -> bool {
        match self {
            NodeMarker::Title(title) => {
                node.pointer("/_meta/title").and_then(Value::as_str) == Some(title.as_str())
            }
            NodeMarker::ClassType(class) => {
                node.get("class_type").and_then(Value::as_str) == Some(class.as_str())
            }
        }
    }
}

impl fmt::Display for NodeMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeMarker::Title(title) => write!(f, "title {:?}", title),
            NodeMarker::ClassType(class) => write!(f, "class_type {:?}", class),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowMarkers {
    pub positive_prompt: NodeMarker,
    pub sampler: NodeMarker,
    pub image_input: NodeMarker,
}

impl Default for WorkflowMarkers {
    fn default() -> Self {
        Self {
            positive_prompt: NodeMarker::Title(POSITIVE_PROMPT_TITLE.to_string()),
            sampler: NodeMarker::ClassType(SAMPLER_CLASS.to_string()),
            image_input: NodeMarker::ClassType(LOAD_IMAGE_CLASS.to_string()),
        }
    }
}

/// What gets written into a template.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchValues<'a> {
    pub prompt: &'a str,
    pub seed: u64,
    /// None (no capture yet) is written as JSON null.
    pub image: Option<&'a str>,
}

impl<'a> PatchValues<'a> {
    /// Values with a freshly drawn seed.
    pub fn new(prompt: &'a str, image: Option<&'a str>) -> Self {
        Self {
            prompt,
            seed: random_seed(),
            image,
        }
    }
}

pub fn random_seed() -> u64 {
    rand::thread_rng().gen_range(0..SEED_LIMIT)
}

/// Replaces every line break (CRLF, LF, CR) with a single space.
pub fn normalize_prompt(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

/// Node order is the order of the file, so "first match" is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow(Map<String, Value>);

impl Workflow {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workflow {}", path.display()))?;
        let workflow: Workflow = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse workflow {}", path.display()))?;
        debug!("Loaded workflow {} with {} nodes", path.display(), workflow.len());
        if workflow.is_empty() {
            warn!("Workflow {} has no nodes", path.display());
        }
        Ok(workflow)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Id of the first node matching the marker.
    pub fn find(&self, marker: &NodeMarker) -> Result<String, WorkflowError> {
        let mut matching = self.0.iter().filter(|(_, node)| marker.matches(node)).map(|(id, _)| id);
        let first = matching.next().ok_or_else(|| WorkflowError::MissingNode { marker: marker.clone() })?;
        let ignored = matching.collect::<Vec<_>>();
        if !ignored.is_empty() {
            warn!("Several nodes match {}; using {}, ignoring {:?}", marker, first, ignored);
        }
        Ok(first.clone())
    }

    fn set_input(&mut self, id: &str, key: &str, value: Value) -> Result<(), WorkflowError> {
        let node = self.0.get_mut(id).and_then(Value::as_object_mut).ok_or_else(|| WorkflowError::MalformedNode {
            id: id.to_string(),
            reason: "node is not an object".to_string(),
        })?;
        let inputs = node
            .entry("inputs")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| WorkflowError::MalformedNode {
                id: id.to_string(),
                reason: "inputs is not an object".to_string(),
            })?;
        inputs.insert(key.to_string(), value);
        Ok(())
    }

    /// Returns a patched copy. `self` is left untouched, so repeated generations never
    /// see what an earlier patch wrote.
    pub fn patch(&self, markers: &WorkflowMarkers, values: &PatchValues) -> Result<Workflow, WorkflowError> {
        // Resolve every node before touching anything.
        let prompt_node = self.find(&markers.positive_prompt)?;
        let sampler_node = self.find(&markers.sampler)?;
        let image_node = self.find(&markers.image_input)?;

        let mut patched = self.clone();
        patched.set_input(&prompt_node, "text", json!(normalize_prompt(values.prompt)))?;
        patched.set_input(&sampler_node, "seed", json!(values.seed))?;
        patched.set_input(&image_node, "image", json!(values.image))?;
        debug!(
            "Patched workflow: text -> {}, seed -> {} ({}), image -> {} ({:?})",
            prompt_node, sampler_node, values.seed, image_node, values.image
        );
        Ok(patched)
    }
}
