// The backend's websocket feed.
// One connection per session; the server pushes JSON frames, of which we understand two kinds.
// Anything else is ignored, so new server-side message types don't break us.

use anyhow::{Context, Result};
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use reqwest::Url;
use serde::Deserialize;
use tokio_tungstenite as ws;
use tungstenite::Message;

use crate::{api::{ClientId, ComfyApi, ImageRef}, config::BackendConfig};

/// A decoded feed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// The sampler is at step `value` of `max`.
    Progress(Progress),
    /// A node finished. Output nodes report the images they wrote.
    Executed(ExecutedOutput),
    /// Something we don't handle: another message type, or a binary preview frame.
    Ignored { kind: String },
}

/// Plain JSON numbers; some custom nodes report fractional steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Progress {
    pub value: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecutedOutput {
    #[serde(default)]
    pub images: Option<Vec<ImageRef>>,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct ExecutedData {
    output: ExecutedOutput,
}

impl FeedEvent {
    pub fn parse(text: &str) -> Result<Self> {
        let frame: RawFrame = serde_json::from_str(text).context("feed frame is not a typed JSON message")?;
        let event = match frame.kind.as_str() {
            "progress" => FeedEvent::Progress(
                serde_json::from_value(frame.data).context("malformed progress event")?,
            ),
            "executed" => {
                let data: ExecutedData = serde_json::from_value(frame.data).context("malformed executed event")?;
                FeedEvent::Executed(data.output)
            }
            _ => FeedEvent::Ignored { kind: frame.kind },
        };
        Ok(event)
    }

    fn from_message(message: Message) -> Option<Result<Self>> {
        match message {
            Message::Text(text) => {
                trace!("Feed frame: {}", text);
                Some(Self::parse(&text))
            }
            Message::Binary(data) => Some(Ok(FeedEvent::Ignored { kind: format!("binary ({} bytes)", data.len()) })),
            // Pings are answered by tungstenite itself.
            _ => None,
        }
    }
}

/// What the user is looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayedImage {
    /// A freshly captured frame, as a PNG data URL.
    Preview(String),
    /// A generated image on the backend.
    Remote(Url),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub progress: Progress,
    pub image: Option<DisplayedImage>,
}

impl ViewState {
    /// Applies an event. Returns the new remote image, if the event produced one.
    pub fn apply(&mut self, api: &ComfyApi, event: &FeedEvent) -> Result<Option<Url>> {
        match event {
            FeedEvent::Progress(progress) => {
                debug!("Generate progress {}/{}", progress.value, progress.max);
                self.progress = *progress;
                Ok(None)
            }
            FeedEvent::Executed(output) => {
                let Some(image) = output.images.as_ref().and_then(|images| images.first()) else {
                    trace!("Executed event without images");
                    return Ok(None);
                };
                let url = api.view_url(image)?;
                self.image = Some(DisplayedImage::Remote(url.clone()));
                Ok(Some(url))
            }
            FeedEvent::Ignored { kind } => {
                trace!("Ignoring {} event", kind);
                Ok(None)
            }
        }
    }

    /// Text of the generate button.
    pub fn generate_label(&self) -> String {
        if self.progress.value > 0.0 {
            format!("Generate ({}/{})", self.progress.value, self.progress.max)
        } else {
            "Generate".to_string()
        }
    }
}

pub fn feed_url(backend: &BackendConfig, client_id: ClientId) -> Result<Url> {
    let mut url = Url::parse(&backend.ws_base())
        .and_then(|base| base.join("ws"))
        .context("invalid feed address")?;
    url.query_pairs_mut().append_pair("clientId", &client_id.to_string());
    Ok(url)
}

/// Connects to the feed and yields events until the server closes the connection.
/// There is no reconnection.
pub async fn connect(backend: &BackendConfig, client_id: ClientId) -> Result<impl Stream<Item = Result<FeedEvent>>> {
    let url = feed_url(backend, client_id)?;
    let (mut ws_client, _) = ws::connect_async(url.as_str()).await.context("failed to connect to websocket")?;
    info!("Connected to {}", url);
    Ok(try_stream! {
        while let Some(message) = ws_client.next().await {
            let message = message.context("websocket error")?;
            match FeedEvent::from_message(message) {
                Some(Ok(event)) => {
                    yield event;
                }
                Some(Err(e)) => warn!("Skipping feed frame: {:#}", e),
                None => {}
            }
        }
        info!("Feed closed by server");
    })
}

/// A one-shot feed server on a free local port: sends `frames`, closes, and drains the client's close.
#[cfg(test)]
pub(crate) async fn serve_frames(frames: Vec<Message>) -> BackendConfig {
    use futures::SinkExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::task::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = ws::accept_async(stream).await.unwrap();
        for frame in frames {
            server.send(frame).await.unwrap();
        }
        server.close(None).await.unwrap();
        while let Some(Ok(_)) = server.next().await {}
    });
    BackendConfig {
        host: "127.0.0.1".to_string(),
        port,
        secure: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testconfig;

    fn api() -> ComfyApi {
        ComfyApi::new(&testconfig().backend, ClientId::generate()).unwrap()
    }

    #[test]
    fn test_parse_progress() {
        let event = FeedEvent::parse(r#"{"type": "progress", "data": {"value": 3, "max": 10, "prompt_id": "abc", "node": "3"}}"#).unwrap();
        assert_eq!(event, FeedEvent::Progress(Progress { value: 3.0, max: 10.0 }));

        let event = FeedEvent::parse(r#"{"type": "progress", "data": {"value": 2.5, "max": 10}}"#).unwrap();
        assert_eq!(event, FeedEvent::Progress(Progress { value: 2.5, max: 10.0 }));
        let mut state = ViewState::default();
        state.apply(&api(), &event).unwrap();
        assert_eq!(state.generate_label(), "Generate (2.5/10)");
    }

    #[test]
    fn test_parse_executed() {
        let event = FeedEvent::parse(r#"{"type": "executed", "data": {"node": "9", "output": {"images": [{"filename": "f.png", "type": "output", "subfolder": ""}]}, "prompt_id": "abc"}}"#).unwrap();
        let FeedEvent::Executed(output) = event else { panic!("expected an executed event") };
        assert_eq!(output.images.unwrap()[0].filename, "f.png");
    }

    #[test]
    fn test_parse_unknown() {
        let event = FeedEvent::parse(r#"{"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}, "sid": "x"}}"#).unwrap();
        assert_eq!(event, FeedEvent::Ignored { kind: "status".to_string() });
        // Unknown types don't need a data field at all.
        assert!(matches!(FeedEvent::parse(r#"{"type": "crystools.monitor"}"#).unwrap(), FeedEvent::Ignored { .. }));
        assert!(FeedEvent::parse("not json").is_err());
        assert!(FeedEvent::parse(r#"{"type": "progress", "data": {"value": "x"}}"#).is_err());
    }

    #[test]
    fn test_binary_frames() {
        let event = FeedEvent::from_message(Message::Binary(vec![0, 0, 0, 1])).unwrap().unwrap();
        assert!(matches!(event, FeedEvent::Ignored { .. }));
        assert!(FeedEvent::from_message(Message::Ping(vec![])).is_none());
    }

    #[test]
    fn test_progress_replaces() {
        let api = api();
        let mut state = ViewState::default();
        assert_eq!(state.generate_label(), "Generate");
        state.apply(&api, &FeedEvent::Progress(Progress { value: 7.0, max: 20.0 })).unwrap();
        state.apply(&api, &FeedEvent::Progress(Progress { value: 3.0, max: 10.0 })).unwrap();
        assert_eq!(state.progress, Progress { value: 3.0, max: 10.0 });
        assert_eq!(state.generate_label(), "Generate (3/10)");
    }

    #[test]
    fn test_executed_without_images() {
        let api = api();
        let mut state = ViewState {
            image: Some(DisplayedImage::Preview("data:image/png;base64,AAAA".to_string())),
            ..Default::default()
        };
        let before = state.clone();
        let event = FeedEvent::parse(r#"{"type": "executed", "data": {"node": "12", "output": {"text": ["hello"]}}}"#).unwrap();
        assert_eq!(state.apply(&api, &event).unwrap(), None);
        assert_eq!(state.apply(&api, &FeedEvent::Executed(ExecutedOutput { images: Some(vec![]) })).unwrap(), None);
        assert_eq!(state.apply(&api, &FeedEvent::Ignored { kind: "status".to_string() }).unwrap(), None);
        assert_eq!(state, before);
    }

    #[test]
    fn test_executed_with_images() {
        let api = api();
        let mut state = ViewState::default();
        let event = FeedEvent::parse(r#"{"type": "executed", "data": {"output": {"images": [{"filename": "f.png", "type": "output", "subfolder": ""}, {"filename": "g.png", "type": "output", "subfolder": ""}]}}}"#).unwrap();
        let url = state.apply(&api, &event).unwrap().unwrap();
        assert_eq!(state.image, Some(DisplayedImage::Remote(url.clone())));

        let query = url.query_pairs().into_owned().collect::<Vec<_>>();
        assert_eq!(query.len(), 4);
        assert_eq!(query[0], ("filename".to_string(), "f.png".to_string()));
        assert_eq!(query[1], ("type".to_string(), "output".to_string()));
        assert_eq!(query[2], ("subfolder".to_string(), "".to_string()));
        assert_eq!(query[3].0, "rand");
    }

    #[test]
    fn test_feed_url() {
        let client_id = ClientId::generate();
        let url = feed_url(&testconfig().backend, client_id).unwrap();
        assert_eq!(url.as_str(), format!("ws://127.0.0.1:8188/ws?clientId={}", client_id));
    }

    #[test_log::test(tokio::test)]
    async fn test_feed_end_to_end() {
        let backend = serve_frames(vec![
            Message::Text(r#"{"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 1}}}}"#.to_string()),
            Message::Text(r#"{"type": "progress", "data": {"value": 3, "max": 10}}"#.to_string()),
            Message::Binary(vec![0, 0, 0, 1, 0xff]),
            Message::Text("garbage".to_string()),
            Message::Text(r#"{"type": "executed", "data": {"node": "9", "output": {"images": [{"filename": "f.png", "type": "output", "subfolder": ""}]}}}"#.to_string()),
        ])
        .await;
        let client_id = ClientId::generate();
        let api = ComfyApi::new(&backend, client_id).unwrap();

        let events = connect(&backend, client_id).await.unwrap();
        let events = events.collect::<Vec<_>>().await;
        // The garbage frame is skipped, everything else comes through in order.
        let events = events.into_iter().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], FeedEvent::Ignored { kind: "status".to_string() });
        assert!(matches!(events[2], FeedEvent::Ignored { .. }));

        let mut state = ViewState::default();
        for event in &events {
            state.apply(&api, event).unwrap();
        }
        assert_eq!(state.progress, Progress { value: 3.0, max: 10.0 });
        let Some(DisplayedImage::Remote(url)) = state.image else { panic!("expected a generated image") };
        assert_eq!(url.port(), Some(backend.port));
        assert!(url.query_pairs().any(|(k, v)| k == "filename" && v == "f.png"));
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_refused() {
        let backend = BackendConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            secure: false,
        };
        assert!(connect(&backend, ClientId::generate()).await.is_err());
    }
}
