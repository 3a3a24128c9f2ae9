//! Contracts for the external collaborators driven by the pipeline.
//!
//! The core never converts audio, downloads videos or runs the separation model itself. It
//! calls out through these traits, and the stage a [`ServiceError`] surfaces from decides the
//! [`crate::job::ErrorKind`] recorded on the job.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::progress::ProgressReport;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    pub message: String,
    pub details: Option<String>,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(self, details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..self
        }
    }
}

/// Metadata probed from an audio file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioInfo {
    pub duration_secs: Option<f64>,
    pub format: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub duration_secs: f64,
    pub title: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileProcessor: Send + Sync {
    /// Cheap metadata probe. An error means the file is not readable audio.
    async fn validate(&self, path: &Path) -> Result<AudioInfo, ServiceError>;

    /// Convert `path` into the canonical working format, writing to `dest`.
    async fn convert_to_canonical(&self, path: &Path, dest: &Path)
        -> Result<PathBuf, ServiceError>;

    /// Write the first `seconds` of `path` to `dest`.
    async fn create_preview(
        &self,
        path: &Path,
        dest: &Path,
        seconds: u64,
    ) -> Result<PathBuf, ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn get_duration(&self, url: &str) -> Result<VideoInfo, ServiceError>;

    /// Download the audio track of `url`. `dest` is a path without extension; the returned
    /// path is where the audio actually landed.
    async fn download_audio(&self, url: &str, dest: &Path) -> Result<PathBuf, ServiceError>;
}

#[async_trait]
pub trait Separator: Send + Sync {
    /// Separate the vocal track of `input` into `output_dir`, reporting progress in `0..=100`
    /// when the engine exposes it.
    async fn separate(
        &self,
        input: &Path,
        output_dir: &Path,
        progress: &dyn ProgressReport,
    ) -> Result<PathBuf, ServiceError>;
}

/// The set of collaborators handed to a [`crate::JobManager`].
#[derive(Clone)]
pub struct Services {
    pub file_processor: Arc<dyn FileProcessor>,
    pub downloader: Arc<dyn Downloader>,
    pub separator: Arc<dyn Separator>,
}

impl Services {
    pub fn new(
        file_processor: impl FileProcessor + 'static,
        downloader: impl Downloader + 'static,
        separator: impl Separator + 'static,
    ) -> Self {
        Self {
            file_processor: Arc::new(file_processor),
            downloader: Arc::new(downloader),
            separator: Arc::new(separator),
        }
    }
}
