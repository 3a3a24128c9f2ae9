//! In-process fakes of the external collaborators.
//!
//! The fakes do real (tiny) file I/O so that artifacts appear on disk where the pipeline
//! expects them, which makes them useful for request-layer tests that exercise a
//! [`crate::JobManager`] end to end without any audio tooling installed.
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::{
    progress::ProgressReport,
    services::{AudioInfo, Downloader, FileProcessor, Separator, ServiceError, VideoInfo},
};

/// Probes report a fixed duration; conversion and previews copy the file.
#[derive(Debug, Clone)]
pub struct FakeFileProcessor {
    duration_secs: Option<f64>,
    fail_conversion: bool,
    fail_preview: bool,
}

impl Default for FakeFileProcessor {
    fn default() -> Self {
        Self {
            duration_secs: Some(180.0),
            fail_conversion: false,
            fail_preview: false,
        }
    }
}

impl FakeFileProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duration(self, duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs,
            ..self
        }
    }

    pub fn failing_conversion(self) -> Self {
        Self {
            fail_conversion: true,
            ..self
        }
    }

    pub fn failing_preview(self) -> Self {
        Self {
            fail_preview: true,
            ..self
        }
    }
}

#[async_trait]
impl FileProcessor for FakeFileProcessor {
    async fn validate(&self, path: &Path) -> Result<AudioInfo, ServiceError> {
        tokio::fs::metadata(path)
            .await
            .map_err(|err| ServiceError::new("Unable to read audio file").with_details(err.to_string()))?;
        Ok(AudioInfo {
            duration_secs: self.duration_secs,
            format: path
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or_default()
                .to_lowercase(),
            sample_rate: Some(44_100),
            channels: Some(2),
        })
    }

    async fn convert_to_canonical(
        &self,
        path: &Path,
        dest: &Path,
    ) -> Result<PathBuf, ServiceError> {
        if self.fail_conversion {
            return Err(ServiceError::new("Audio conversion failed"));
        }
        copy(path, dest).await
    }

    async fn create_preview(
        &self,
        path: &Path,
        dest: &Path,
        _seconds: u64,
    ) -> Result<PathBuf, ServiceError> {
        if self.fail_preview {
            return Err(ServiceError::new("Failed to create preview"));
        }
        copy(path, dest).await
    }
}

/// Serves a single fake video.
#[derive(Debug, Clone)]
pub struct FakeDownloader {
    info: VideoInfo,
    fail_download: bool,
}

impl Default for FakeDownloader {
    fn default() -> Self {
        Self {
            info: VideoInfo {
                duration_secs: 212.0,
                title: Some("Never Gonna Give You Up".to_owned()),
            },
            fail_download: false,
        }
    }
}

impl FakeDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video(self, info: VideoInfo) -> Self {
        Self { info, ..self }
    }

    /// Leaves a partial download behind and fails.
    pub fn failing_download(self) -> Self {
        Self {
            fail_download: true,
            ..self
        }
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn get_duration(&self, _url: &str) -> Result<VideoInfo, ServiceError> {
        Ok(self.info.clone())
    }

    async fn download_audio(&self, _url: &str, dest: &Path) -> Result<PathBuf, ServiceError> {
        if self.fail_download {
            write(&dest.with_extension("m4a.part"), b"partial audio").await?;
            return Err(ServiceError::new("Video unavailable"));
        }
        let path = dest.with_extension("m4a");
        write(&path, b"downloaded audio").await?;
        Ok(path)
    }
}

/// Writes a vocals file after reporting a configurable sequence of progress values.
///
/// A gated separator waits for a permit from its [`Semaphore`] before finishing, which lets a
/// test hold jobs in the processing state and release them one at a time. Permits are
/// consumed, so every job needs its own.
#[derive(Debug, Clone, Default)]
pub struct FakeSeparator {
    steps: Vec<f32>,
    gate: Option<Arc<Semaphore>>,
    fail: bool,
    panic: bool,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakeSeparator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(self, steps: impl Into<Vec<f32>>) -> Self {
        Self {
            steps: steps.into(),
            ..self
        }
    }

    pub fn gated(self, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..self
        }
    }

    /// Leaves a partial output behind and fails.
    pub fn failing(self) -> Self {
        Self { fail: true, ..self }
    }

    pub fn panicking(self) -> Self {
        Self {
            panic: true,
            ..self
        }
    }

    /// Number of separations currently in progress.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous separations seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Separator for FakeSeparator {
    async fn separate(
        &self,
        input: &Path,
        output_dir: &Path,
        progress: &dyn ProgressReport,
    ) -> Result<PathBuf, ServiceError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = Running(&self.running);
        self.peak.fetch_max(now, Ordering::SeqCst);

        for step in &self.steps {
            progress.report(*step);
            tokio::task::yield_now().await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| ServiceError::new("Separation aborted"))?
                .forget();
        }
        if self.panic {
            panic!("separator crashed");
        }
        if self.fail {
            write(&output_dir.join("partial_vocals.wav"), b"partial").await?;
            return Err(ServiceError::new("Model inference failed").with_details("out of memory"));
        }

        let stem = input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("audio");
        let path = output_dir.join(format!("{stem}_separated.wav"));
        write(&path, b"vocals").await?;
        Ok(path)
    }
}

async fn copy(from: &Path, to: &Path) -> Result<PathBuf, ServiceError> {
    tokio::fs::copy(from, to)
        .await
        .map_err(|err| ServiceError::new("Failed to write audio").with_details(err.to_string()))?;
    Ok(to.to_path_buf())
}

async fn write(path: &Path, contents: &[u8]) -> Result<(), ServiceError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|err| ServiceError::new("Failed to write audio").with_details(err.to_string()))
}
