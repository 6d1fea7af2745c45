// This module handles the client's config.toml.
// Every value is re-read every time a snapshot is taken. Some are 'fusible', and cannot be changed after the first read:
// the session is bound to one backend and one workflow template for its whole lifetime.
//
// Changes to fused values are logged and ignored.

use std::{path::{Path, PathBuf}, sync::Arc};

use anyhow::{Context, Result};
use log::warn;
use serde::{Serialize, Deserialize};
use tokio::sync::RwLock;

use crate::workflow::{NodeMarker, WorkflowMarkers};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// Where displayed images are saved. None means they're only logged.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    pub backend: BackendConfig,
    pub workflow: WorkflowConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

impl BackendConfig {
    pub fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn ws_base(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub path: PathBuf,
    #[serde(default = "default_prompt_title")]
    pub prompt_title: String,
    #[serde(default = "default_sampler_class")]
    pub sampler_class: String,
    #[serde(default = "default_image_class")]
    pub image_class: String,
}

impl WorkflowConfig {
    pub fn markers(&self) -> WorkflowMarkers {
        WorkflowMarkers {
            positive_prompt: NodeMarker::Title(self.prompt_title.clone()),
            sampler: NodeMarker::ClassType(self.sampler_class.clone()),
            image_input: NodeMarker::ClassType(self.image_class.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureConfig {
    pub source: CameraSource,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_filename")]
    pub filename: String,
}

/// Stand-in for the camera stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraSource {
    /// An image file that something else keeps up to date. Re-read on every snapshot.
    File { path: PathBuf },
    /// A command that writes one encoded frame to stdout, e.g. ffmpeg reading /dev/video0.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_prompt_title() -> String {
    crate::workflow::POSITIVE_PROMPT_TITLE.to_string()
}

fn default_sampler_class() -> String {
    crate::workflow::SAMPLER_CLASS.to_string()
}

fn default_image_class() -> String {
    crate::workflow::LOAD_IMAGE_CLASS.to_string()
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_filename() -> String {
    "captured-image.png".to_string()
}

fn read_config(path: &Path) -> Result<ClientConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Error reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))
}

fn update_config(old: &mut ClientConfig, mut new: ClientConfig) {
    // Check what has changed.
    // The backend and the workflow are fused; everything else is just updated.
    if old.backend != new.backend {
        warn!("Backend config changed on disk; ignoring until restart");
        new.backend = old.backend.clone();
    }
    if old.workflow != new.workflow {
        warn!("Workflow config changed on disk; ignoring until restart");
        new.workflow = old.workflow.clone();
    }
    *old = new;
}

struct ConfigState {
    path: PathBuf,
    config: ClientConfig,
}

#[derive(Clone)]
pub struct ClientConfigModule(Arc<RwLock<ConfigState>>);

impl ClientConfigModule {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = read_config(&path)?;
        Ok(Self(Arc::new(RwLock::new(ConfigState { path, config }))))
    }

    /// Re-reads the file, then returns a copy of the current config.
    /// A file that fails to read or parse leaves the previous config in place.
    pub async fn snapshot(&self) -> ClientConfig {
        let mut state = self.0.write().await;
        match read_config(&state.path) {
            Ok(new_config) => update_config(&mut state.config, new_config),
            Err(e) => warn!("Keeping previous config: {:#}", e),
        }
        state.config.clone()
    }

    pub async fn with_config<T>(&self, f: impl FnOnce(&ClientConfig) -> T) -> T {
        let config = self.snapshot().await;
        f(&config)
    }
}

#[cfg(test)]
pub fn testconfig() -> ClientConfig {
    toml::from_str(include_str!("../testdata/config.toml")).unwrap()
}
