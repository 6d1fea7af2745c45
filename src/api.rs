// HTTP side of the ComfyUI backend: queueing, interrupting, uploading and viewing.

use anyhow::{Context, Result};
use log::{debug, info, trace};
use rand::Rng;
use reqwest::{multipart, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{config::BackendConfig, workflow::Workflow};

/// Generated once per session, sent with every prompt and with the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of an `executed` event's image list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subfolder: String,
}

#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    prompt: &'a Workflow,
    client_id: String,
}

#[derive(Clone)]
pub struct ComfyApi {
    base: Url,
    client_id: ClientId,
    http: reqwest::Client,
}

impl ComfyApi {
    pub fn new(backend: &BackendConfig, client_id: ClientId) -> Result<Self> {
        let base = Url::parse(&backend.http_base()).context("invalid backend address")?;
        Ok(Self {
            base,
            client_id,
            http: reqwest::Client::new(),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).with_context(|| format!("invalid endpoint {}", path))
    }

    /// Queues a (patched) workflow. The response is returned as-is.
    pub async fn queue_prompt(&self, workflow: &Workflow) -> Result<serde_json::Value> {
        let request = PromptRequest {
            prompt: workflow,
            client_id: self.client_id.to_string(),
        };
        let response = self.http.post(self.endpoint("prompt")?)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .json(&request)
            .send()
            .await
            .context("failed to send prompt")?;
        let text = response.text().await.context("failed to read prompt response")?;
        trace!("Prompt response: {}", text);
        serde_json::from_str(&text).context("failed to parse prompt response")
    }

    /// Asks the backend to stop whatever it's generating. Nothing changes locally.
    pub async fn interrupt(&self) -> Result<()> {
        let response = self.http.post(self.endpoint("interrupt")?)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .context("failed to send interrupt")?;
        info!("Interrupting prompt: {}", response.status());
        Ok(())
    }

    /// Uploads a PNG into the backend's input folder, overwriting any file of the same name.
    pub async fn upload_image(&self, png: Vec<u8>, filename: &str) -> Result<serde_json::Value> {
        debug!("Uploading {} bytes as {}", png.len(), filename);
        let image = multipart::Part::bytes(png)
            .file_name(filename.to_owned())
            .mime_str("image/png")
            .context("invalid mime type")?;
        let form = multipart::Form::new()
            .part("image", image)
            .text("overwrite", "true")
            .text("type", "input");
        let response = self.http.post(self.endpoint("upload/image")?)
            .multipart(form)
            .send()
            .await
            .context("failed to upload image")?;
        response.json().await.context("failed to parse upload response")
    }

    /// URL of a generated image. The `rand` parameter defeats caching.
    pub fn view_url(&self, image: &ImageRef) -> Result<Url> {
        let rand = rand::thread_rng().gen_range(0..1000).to_string();
        let mut url = self.endpoint("view")?;
        url.query_pairs_mut()
            .append_pair("filename", &image.filename)
            .append_pair("type", &image.kind)
            .append_pair("subfolder", &image.subfolder)
            .append_pair("rand", &rand);
        Ok(url)
    }

    pub async fn fetch_image(&self, url: Url) -> Result<Vec<u8>> {
        let bytes = self.http.get(url)
            .send()
            .await
            .context("failed to download image")?
            .bytes()
            .await
            .context("failed to read image")?;
        Ok(bytes.into())
    }
}

/// Backend settings pointing at a mockito server.
#[cfg(test)]
pub(crate) fn mock_backend(server: &mockito::ServerGuard) -> BackendConfig {
    let address = server.host_with_port();
    let (host, port) = address.rsplit_once(':').unwrap();
    BackendConfig {
        host: host.to_string(),
        port: port.parse().unwrap(),
        secure: false,
    }
}
