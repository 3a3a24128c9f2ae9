//! The processing pipeline for a single job.
//!
//! A job runs through four stages in order: acquire the input, normalize it into the canonical
//! working format, separate the vocals, and finalize the output. Each stage owns a fixed band
//! of the overall progress (see [`Stage::band`]) and runs under its own wall-clock timeout.
//!
//! The executor only ever returns the outcome. Writing the terminal state, cleaning up after a
//! failure and freeing the concurrency slot are the job runner's concern.
use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio_util::sync::CancellationToken;

use crate::{
    backend::Backend,
    config::Config,
    job::{ErrorKind, Job, JobError, JobId, JobInput, JobOutput, Stage},
    progress::{self, Band},
    services::{ServiceError, Services},
    storage::{JobFiles, StorageLayout},
};

#[derive(Clone)]
pub(crate) struct Executor<B: Backend> {
    backend: B,
    services: Services,
    config: Arc<Config>,
    layout: StorageLayout,
}

impl<B: Backend> Executor<B> {
    pub(crate) fn new(
        backend: B,
        services: Services,
        config: Arc<Config>,
        layout: StorageLayout,
    ) -> Self {
        Self {
            backend,
            services,
            config,
            layout,
        }
    }

    /// Runs every stage of `job_id`. `token` is checked before each stage starts.
    pub(crate) async fn execute(
        &self,
        job_id: JobId,
        token: &CancellationToken,
    ) -> Result<JobOutput, JobError> {
        let job = self.backend.get(job_id).await.map_err(JobError::internal)?;
        let files = self.layout.job(job_id);
        self.layout
            .ensure_dirs()
            .await
            .map_err(|err| JobError::internal(format!("Failed to prepare storage: {err}")))?;
        files
            .prepare()
            .await
            .map_err(|err| JobError::internal(format!("Failed to prepare storage: {err}")))?;

        let source = self
            .stage(job_id, Stage::Acquire, token, self.acquire(&job, &files))
            .await?;
        let canonical = self
            .stage(job_id, Stage::Normalize, token, self.normalize(&source, &files))
            .await?;
        let separated = self
            .stage(job_id, Stage::Separate, token, self.separate(job_id, &canonical, &files))
            .await?;
        self.stage(job_id, Stage::Finalize, token, self.finalize(job_id, &separated, &files))
            .await
    }

    async fn stage<T>(
        &self,
        job_id: JobId,
        stage: Stage,
        token: &CancellationToken,
        work: impl Future<Output = Result<T, JobError>>,
    ) -> Result<T, JobError> {
        if token.is_cancelled() {
            return Err(JobError::internal(format!(
                "Service shut down before the {stage} stage"
            )));
        }
        self.backend
            .update(job_id, move |job| job.enter_stage(stage))
            .await
            .map_err(JobError::internal)?;
        tracing::debug!(%job_id, %stage, "Job {job_id} entering {stage} stage");

        let timeout = self.config.timeouts.for_stage(stage);
        tokio::time::timeout(timeout, work)
            .await
            .unwrap_or_else(|_elapsed| {
                Err(JobError::new(
                    ErrorKind::Timeout,
                    format!(
                        "The {stage} stage did not finish within {} seconds",
                        timeout.as_secs()
                    ),
                ))
            })
    }

    async fn acquire(&self, job: &Job, files: &JobFiles) -> Result<PathBuf, JobError> {
        let path = match &job.input {
            JobInput::Upload { path, .. } => match tokio::fs::try_exists(path).await {
                Ok(true) => path.clone(),
                Ok(false) => {
                    return Err(JobError::internal(format!(
                        "Uploaded file {} is missing",
                        path.display()
                    )))
                }
                Err(err) => return Err(JobError::internal(err)),
            },
            JobInput::Youtube { url } => self.download(job.id, url, files).await?,
        };

        let recorded = path.clone();
        self.backend
            .update(job.id, move |job| job.set_input_path(recorded))
            .await
            .map_err(JobError::internal)?;
        Ok(path)
    }

    async fn download(&self, job_id: JobId, url: &str, files: &JobFiles) -> Result<PathBuf, JobError> {
        let downloader = &self.services.downloader;
        let info = downloader
            .get_duration(url)
            .await
            .map_err(failed(ErrorKind::DownloadError))?;
        if info.duration_secs > self.config.max_duration_secs as f64 {
            return Err(JobError::new(
                ErrorKind::ValidationError,
                format!(
                    "Video duration ({:.0}s) exceeds maximum allowed ({}s)",
                    info.duration_secs, self.config.max_duration_secs
                ),
            ));
        }
        if let Some(title) = info.title {
            let _ = self
                .backend
                .update(job_id, move |job| job.set_title(title))
                .await
                .inspect_err(|err| tracing::warn!(?err, %job_id, "Failed to record title: {err}"));
        }
        self.advance(job_id, Stage::Acquire, 20.0).await;

        tracing::debug!(%job_id, url, "Downloading audio for job {job_id}");
        downloader
            .download_audio(url, files.download_stem())
            .await
            .map_err(failed(ErrorKind::DownloadError))
    }

    async fn normalize(&self, source: &Path, files: &JobFiles) -> Result<PathBuf, JobError> {
        self.services
            .file_processor
            .convert_to_canonical(source, &files.canonical())
            .await
            .map_err(failed(ErrorKind::ConversionError))
    }

    async fn separate(
        &self,
        job_id: JobId,
        canonical: &Path,
        files: &JobFiles,
    ) -> Result<PathBuf, JobError> {
        let (reporter, pump) = progress::channel(
            self.backend.clone(),
            job_id,
            Band::new(Stage::Separate.band()),
            self.config.heartbeat_interval(),
        );
        let separation = self
            .services
            .separator
            .separate(canonical, files.work_dir(), &reporter);

        tokio::select! {
            result = separation => result.map_err(failed(ErrorKind::SeparationError)),
            _ = pump.run() => Err(JobError::internal("Progress reporting stopped unexpectedly")),
        }
    }

    async fn finalize(
        &self,
        job_id: JobId,
        separated: &Path,
        files: &JobFiles,
    ) -> Result<JobOutput, JobError> {
        let vocals = files.vocals();
        if separated != vocals.as_path() {
            tokio::fs::rename(separated, &vocals).await.map_err(|err| {
                JobError::internal(format!(
                    "Failed to store separated vocals {}: {err}",
                    separated.display()
                ))
            })?;
        }
        self.advance(job_id, Stage::Finalize, 50.0).await;

        let preview = match self.config.preview_duration_secs {
            0 => None,
            seconds => self
                .services
                .file_processor
                .create_preview(&vocals, &files.preview(), seconds)
                .await
                .inspect_err(|err| {
                    tracing::warn!(?err, %job_id, "Continuing without preview for job {job_id}: {err}")
                })
                .ok(),
        };

        Ok(JobOutput {
            vocal_path: vocals,
            preview_path: preview,
        })
    }

    async fn advance(&self, job_id: JobId, stage: Stage, local: f32) {
        let progress = Band::new(stage.band()).map(local);
        let _ = self
            .backend
            .update(job_id, move |job| job.record_progress(progress))
            .await
            .inspect_err(|err| tracing::warn!(?err, %job_id, "Failed to record progress: {err}"));
    }
}

fn failed(kind: ErrorKind) -> impl FnOnce(ServiceError) -> JobError {
    move |err| {
        if let Some(details) = &err.details {
            tracing::debug!(%kind, %details, "{kind}: {}", err.message);
        }
        JobError::new(kind, err.message)
    }
}
