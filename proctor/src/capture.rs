//! Camera frame sources.
//!
//! The analysis loop only needs "give me the current frame as JPEG". The
//! shipped source replays JPEG files from a directory, which stands in for
//! a camera on headless machines and in tests.

use base64::Engine as _;
use proctor_common::config::CaptureConfig;
use proctor_common::{Capability, ProctorError};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One captured JPEG frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub jpeg: Vec<u8>,
}

impl Frame {
    pub fn new(jpeg: Vec<u8>) -> Self {
        Self { jpeg }
    }

    /// `data:image/jpeg;base64,...` URL as expected by the detection service.
    pub fn to_data_url(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.jpeg);
        format!("data:image/jpeg;base64,{encoded}")
    }
}

/// A camera-like frame stream.
pub trait FrameSource: Send + 'static {
    /// Acquire the stream. Denial is a permission error.
    fn open(&mut self) -> Result<(), ProctorError>;

    /// Grab the current frame. Fails if the stream is not open or no frame
    /// is available yet.
    fn capture(&mut self) -> impl Future<Output = Result<Frame, ProctorError>> + Send;

    /// Release the stream. Idempotent.
    fn stop(&mut self);

    fn is_open(&self) -> bool;
}

/// Replays `.jpg`/`.jpeg` files from a directory in name order, wrapping
/// around at the end.
#[derive(Debug)]
pub struct DirectoryFrameSource {
    dir: PathBuf,
    quality: f64,
    files: Vec<PathBuf>,
    cursor: usize,
    open: bool,
}

impl DirectoryFrameSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quality: 0.8,
            files: Vec::new(),
            cursor: 0,
            open: false,
        }
    }

    /// Build from the capture section, if a frame directory is configured.
    pub fn from_config(config: &CaptureConfig) -> Option<Self> {
        config.frame_dir.as_ref().map(|dir| Self {
            quality: config.jpeg_quality,
            ..Self::new(dir)
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frame_count(&self) -> usize {
        self.files.len()
    }
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
}

impl FrameSource for DirectoryFrameSource {
    fn open(&mut self) -> Result<(), ProctorError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            ProctorError::permission(Capability::Camera, format!("{}: {e}", self.dir.display()))
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_jpeg(path))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(ProctorError::permission(
                Capability::Camera,
                format!("no JPEG frames in {}", self.dir.display()),
            ));
        }

        info!(
            dir = %self.dir.display(),
            frames = files.len(),
            quality = self.quality,
            "Camera stream opened"
        );
        self.files = files;
        self.cursor = 0;
        self.open = true;
        Ok(())
    }

    async fn capture(&mut self) -> Result<Frame, ProctorError> {
        if !self.open {
            return Err(ProctorError::Capture("camera stream is not open".into()));
        }
        let Some(path) = self.files.get(self.cursor).cloned() else {
            return Err(ProctorError::Capture("no frame available".into()));
        };
        self.cursor = (self.cursor + 1) % self.files.len();

        let jpeg = tokio::fs::read(&path)
            .await
            .map_err(|e| ProctorError::Capture(format!("{}: {e}", path.display())))?;
        if jpeg.is_empty() {
            return Err(ProctorError::Capture(format!(
                "{} is empty",
                path.display()
            )));
        }
        debug!(frame = %path.display(), bytes = jpeg.len(), "Captured frame");
        Ok(Frame::new(jpeg))
    }

    fn stop(&mut self) {
        if self.open {
            debug!(dir = %self.dir.display(), "Camera stream stopped");
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
