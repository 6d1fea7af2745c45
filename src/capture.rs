// Camera capture.
//
// The camera is opened once per session. If that fails we log it and capture stays off until restart.
// A snapshot is scaled into a fixed raster, encoded as a PNG data URL (which doubles as the preview),
// and that data URL is what gets decoded and uploaded.

use std::io::Cursor;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops::FilterType, ImageOutputFormat};
use log::{debug, error, info};
use thiserror::Error;

use crate::config::{CameraSource, CaptureConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("camera is not available in this session")]
    Unavailable,

    #[error("invalid data URL: {0}")]
    InvalidDataUrl(&'static str),
}

/// A decoded `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime: String,
    pub bytes: Vec<u8>,
}

pub fn encode_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

pub fn decode_data_url(url: &str) -> Result<DataUrl, CaptureError> {
    let rest = url.strip_prefix("data:").ok_or(CaptureError::InvalidDataUrl("missing data: prefix"))?;
    let (header, payload) = rest.split_once(',').ok_or(CaptureError::InvalidDataUrl("missing comma"))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or(CaptureError::InvalidDataUrl("not base64-encoded"))?
        .split(';')
        .next()
        .unwrap_or_default();
    let bytes = STANDARD
        .decode(payload)
        .map_err(|_| CaptureError::InvalidDataUrl("bad base64 payload"))?;
    Ok(DataUrl {
        mime: mime.to_string(),
        bytes,
    })
}

/// An opened frame source.
#[derive(Debug)]
pub struct Camera {
    source: CameraSource,
}

impl Camera {
    /// Opens the source by grabbing a first frame from it.
    pub async fn open(source: &CameraSource) -> Result<Self> {
        let camera = Self { source: source.clone() };
        let frame = camera.grab().await?;
        image::guess_format(&frame).context("camera output is not an image")?;
        Ok(camera)
    }

    /// Returns one encoded frame, in whatever format the source produces.
    pub async fn grab(&self) -> Result<Vec<u8>> {
        match &self.source {
            CameraSource::File { path } => tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read frame from {}", path.display())),
            CameraSource::Command { program, args } => {
                let mut command = tokio::process::Command::new(program);
                command.args(args).kill_on_drop(true);
                debug!("Running {:?}", &command);
                let output = command.output().await.with_context(|| format!("failed to run {}", program))?;
                if !output.status.success() {
                    bail!("{} failed: {}: {}", program, output.status, String::from_utf8_lossy(&output.stderr).trim());
                }
                if output.stdout.is_empty() {
                    bail!("{} produced no frame", program);
                }
                Ok(output.stdout)
            }
        }
    }
}

pub struct CaptureModule {
    camera: Option<Camera>,
    width: u32,
    height: u32,
}

impl CaptureModule {
    /// Never fails. An unusable camera is logged and leaves capture disabled.
    pub async fn open(config: &CaptureConfig) -> Self {
        let camera = match Camera::open(&config.source).await {
            Ok(camera) => {
                info!("Camera ready: {:?}", config.source);
                Some(camera)
            }
            Err(e) => {
                error!("Error accessing the camera: {:#}", e);
                None
            }
        };
        Self {
            camera,
            width: config.width,
            height: config.height,
        }
    }

    pub fn is_available(&self) -> bool {
        self.camera.is_some()
    }

    /// Grabs a frame and returns it as a PNG data URL of the configured size.
    pub async fn snapshot(&self) -> Result<String> {
        let camera = self.camera.as_ref().ok_or(CaptureError::Unavailable)?;
        let frame = camera.grab().await?;
        let image = image::load_from_memory(&frame).context("failed to decode frame")?;
        // Stretched, not letterboxed.
        let image = image.resize_exact(self.width, self.height, FilterType::Triangle);
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
            .context("failed to encode frame")?;
        let data_url = encode_data_url("image/png", &png);
        info!("Image captured ({} bytes)", png.len());
        Ok(data_url)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use image::{GenericImageView, Rgb, RgbImage};

    use super::*;

    fn write_frame(path: &Path, width: u32, height: u32) {
        let frame = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        frame.save(path).unwrap();
    }

    fn file_config(path: &Path) -> CaptureConfig {
        CaptureConfig {
            source: CameraSource::File { path: path.to_owned() },
            width: 640,
            height: 480,
            filename: "captured-image.png".to_string(),
        }
    }

    #[test]
    fn test_data_url() {
        let url = encode_data_url("image/png", b"hello");
        assert_eq!(url, "data:image/png;base64,aGVsbG8=");
        let decoded = decode_data_url(&url).unwrap();
        assert_eq!(decoded.mime, "image/png");
        assert_eq!(decoded.bytes, b"hello");
    }

    #[test]
    fn test_bad_data_urls() {
        assert_eq!(decode_data_url("http://example.com/x.png"), Err(CaptureError::InvalidDataUrl("missing data: prefix")));
        assert_eq!(decode_data_url("data:image/png;base64"), Err(CaptureError::InvalidDataUrl("missing comma")));
        assert_eq!(decode_data_url("data:text/plain,hello"), Err(CaptureError::InvalidDataUrl("not base64-encoded")));
        assert_eq!(decode_data_url("data:image/png;base64,!!!"), Err(CaptureError::InvalidDataUrl("bad base64 payload")));
    }

    #[test_log::test(tokio::test)]
    async fn test_snapshot_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");
        write_frame(&path, 1280, 720);

        let capture = CaptureModule::open(&file_config(&path)).await;
        assert!(capture.is_available());
        let data_url = capture.snapshot().await.unwrap();
        assert!(data_url.starts_with("data:image/png;base64,"));

        let decoded = decode_data_url(&data_url).unwrap();
        assert_eq!(decoded.mime, "image/png");
        let image = image::load_from_memory(&decoded.bytes).unwrap();
        assert_eq!(image.dimensions(), (640, 480));
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_camera() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing-here.png");
        let capture = CaptureModule::open(&file_config(&path)).await;
        assert!(!capture.is_available());

        // Showing up later doesn't help; there's no retry.
        write_frame(&path, 10, 10);
        let err = capture.snapshot().await.unwrap_err();
        assert_eq!(err.downcast_ref::<CaptureError>(), Some(&CaptureError::Unavailable));
    }

    #[test_log::test(tokio::test)]
    async fn test_not_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        std::fs::write(&path, "definitely not a png").unwrap();
        assert!(Camera::open(&CameraSource::File { path }).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_failing_command() {
        let source = CameraSource::Command {
            program: "false".to_string(),
            args: vec![],
        };
        assert!(Camera::open(&source).await.is_err());
    }
}
