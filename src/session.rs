// One client session: the client id, the workflow template, the camera and the view state.
// Everything here is constructed once in Session::new and shared by the feed task and the prompt loop.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use futures::{pin_mut, StreamExt};
use log::{debug, error, info};
use reqwest::Url;
use tokio::{sync::RwLock, task::JoinHandle};

use crate::{
    api::{ClientId, ComfyApi},
    capture::{decode_data_url, CaptureModule},
    config::ClientConfigModule,
    feed::{self, DisplayedImage, ViewState},
    workflow::{PatchValues, Workflow, WorkflowMarkers},
};

#[derive(Debug, Default)]
struct SessionState {
    view: ViewState,
    last_upload: Option<String>,
}

impl SessionState {
    /// Takes the server's name for an upload, unless a newer capture has replaced it meanwhile.
    fn record_upload(&mut self, requested: &str, response: &serde_json::Value) {
        let Some(name) = response.get("name").and_then(|n| n.as_str()) else {
            return;
        };
        if name != requested && self.last_upload.as_deref() == Some(requested) {
            self.last_upload = Some(name.to_owned());
        }
    }
}

struct SessionInner {
    config: ClientConfigModule,
    api: ComfyApi,
    template: Workflow,
    markers: WorkflowMarkers,
    capture: CaptureModule,
    state: RwLock<SessionState>,
}

#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

impl Session {
    pub async fn new(config: ClientConfigModule) -> Result<Self> {
        let snapshot = config.snapshot().await;
        let client_id = ClientId::generate();
        info!("Client id {}", client_id);
        let api = ComfyApi::new(&snapshot.backend, client_id)?;
        let template = Workflow::load(&snapshot.workflow.path).context("failed to load workflow template")?;
        let markers = snapshot.workflow.markers();
        // Check the markers up front, so a broken template shows up in the log at startup.
        for marker in [&markers.positive_prompt, &markers.sampler, &markers.image_input] {
            if let Err(e) = template.find(marker) {
                error!("{}", e);
            }
        }
        let capture = CaptureModule::open(&snapshot.capture).await;
        if !capture.is_available() {
            info!("Capture disabled for this session");
        }
        Ok(Self(Arc::new(SessionInner {
            config,
            api,
            template,
            markers,
            capture,
            state: RwLock::new(SessionState::default()),
        })))
    }

    pub fn client_id(&self) -> ClientId {
        self.0.api.client_id()
    }

    pub async fn view(&self) -> ViewState {
        self.0.state.read().await.view.clone()
    }

    pub async fn last_upload(&self) -> Option<String> {
        self.0.state.read().await.last_upload.clone()
    }

    /// Takes a snapshot, shows it, and starts uploading it in the background.
    /// The preview and the filename are set before the upload finishes.
    pub async fn capture(&self) -> Result<JoinHandle<()>> {
        let data_url = self.0.capture.snapshot().await?;
        let filename = self.0.config.with_config(|c| c.capture.filename.clone()).await;
        let decoded = decode_data_url(&data_url)?;
        debug!("Decoded {} bytes of {}", decoded.bytes.len(), decoded.mime);
        let png = decoded.bytes;
        {
            let mut state = self.0.state.write().await;
            state.view.image = Some(DisplayedImage::Preview(data_url));
            state.last_upload = Some(filename.clone());
        }
        let session = self.clone();
        Ok(tokio::task::spawn(async move {
            match session.0.api.upload_image(png, &filename).await {
                Ok(response) => {
                    info!("File uploaded: {}", response);
                    // The server may have renamed it.
                    session.0.state.write().await.record_upload(&filename, &response);
                }
                Err(e) => error!("Error uploading {}: {:#}", filename, e),
            }
        }))
    }

    /// Patches a copy of the template and queues it. An empty prompt does nothing.
    pub async fn generate(&self, prompt: &str) -> Result<Option<serde_json::Value>> {
        if prompt.is_empty() {
            debug!("Ignoring empty prompt");
            return Ok(None);
        }
        let image = self.last_upload().await;
        let workflow = self.0.template.patch(&self.0.markers, &PatchValues::new(prompt, image.as_deref()))?;
        let response = self.0.api.queue_prompt(&workflow).await?;
        info!("Queued prompt: {}", response);
        Ok(Some(response))
    }

    pub async fn interrupt(&self) -> Result<()> {
        self.0.api.interrupt().await
    }

    /// Follows the event feed until the server closes it, keeping the view state current.
    /// Generated images are saved to output_dir when one is configured.
    pub async fn run_feed(&self) -> Result<()> {
        let backend = self.0.config.with_config(|c| c.backend.clone()).await;
        let events = feed::connect(&backend, self.client_id()).await?;
        pin_mut!(events);
        while let Some(event) = events.next().await {
            let event = event?;
            let (url, label) = {
                let mut state = self.0.state.write().await;
                let url = state.view.apply(&self.0.api, &event)?;
                (url, state.view.generate_label())
            };
            if let feed::FeedEvent::Progress(_) = event {
                info!("{}", label);
            }
            if let Some(url) = url {
                info!("Image ready: {}", url);
                if let Err(e) = self.save_image(url).await {
                    error!("Error saving image: {:#}", e);
                }
            }
        }
        Ok(())
    }

    /// Runs the feed in the background. When it ends, that is logged and the rest of the
    /// session carries on without progress or results.
    pub fn spawn_feed(&self) -> JoinHandle<()> {
        let session = self.clone();
        tokio::task::spawn(async move {
            match session.run_feed().await {
                Ok(()) => error!("Event feed closed; no more progress or results this session"),
                Err(e) => error!("Event feed failed: {:#}", e),
            }
        })
    }

    async fn save_image(&self, url: Url) -> Result<Option<PathBuf>> {
        let Some(dir) = self.0.config.with_config(|c| c.output_dir.clone()).await else {
            return Ok(None);
        };
        let filename = url
            .query_pairs()
            .find(|(k, _)| k == "filename")
            .map(|(_, v)| v.into_owned())
            .context("view URL without filename")?;
        // Only the last path component, whatever the server called it.
        let filename = std::path::Path::new(&filename)
            .file_name()
            .context("view URL with empty filename")?
            .to_owned();
        let bytes = self.0.api.fetch_image(url).await?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(filename);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Saved {}", path.display());
        Ok(Some(path))
    }
}
