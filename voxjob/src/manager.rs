//! The entry point for the request layer.
//!
//! [`JobManager`] ties the store, the admission gate, the pipeline and the sweeper together.
//! Requests are validated synchronously; everything after that happens on background tasks and
//! is observed by polling [`JobManager::get_status`].
//!
//! ```no_run
//! # use voxjob::{config::Config, services::Services, JobManager, JobRequest};
//! # async fn run(services: Services) -> Result<(), voxjob::VoxjobError> {
//! let manager = JobManager::in_memory(Config::from_env()?, services)?;
//! let _sweeper = manager.spawn_sweeper();
//!
//! let job_id = manager
//!     .create_job(JobRequest::Youtube {
//!         url: "https://youtu.be/dQw4w9WgXcQ".to_owned(),
//!     })
//!     .await?;
//! let status = manager.get_status(job_id).await?;
//! println!("{}: {}", status.progress, status.message);
//!
//! manager.graceful_shutdown().await;
//! # Ok(())
//! # }
//! ```
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    admission::{Admission, Admit, LocalAdmission},
    backend::{memory::InMemoryBackend, Backend, BackendError},
    config::Config,
    executor::Executor,
    job::{runner::JobRunner, Job, JobError, JobId, JobInput, JobStatus},
    services::Services,
    status::{JobResult, ResultError, Stats, StatusError, StatusReport},
    storage::{self, StorageLayout},
    sweeper::{runner::SweeperRunner, SweepReport, SweepSchedule},
    validation::RequestValidator,
    VoxjobError,
};

/// A request to process a new piece of audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRequest {
    /// A file already written to disk by the request layer. Once the request is accepted the
    /// file is moved into the upload directory as `<job id>.<ext>` and belongs to the job.
    Upload { path: PathBuf, filename: String },
    Youtube { url: String },
}

pub struct JobManager<B: Backend = InMemoryBackend> {
    config: Arc<Config>,
    backend: B,
    admission: Arc<dyn Admission>,
    validator: RequestValidator,
    layout: StorageLayout,
    schedule: SweepSchedule,
    runner: Arc<JobRunner<B>>,
    cancellation_token: CancellationToken,
}

impl JobManager<InMemoryBackend> {
    pub fn in_memory(config: Config, services: Services) -> Result<Self, VoxjobError> {
        Self::new(config, InMemoryBackend::new(), services)
    }
}

impl<B> JobManager<B>
where
    B: Backend,
{
    pub fn new(config: Config, backend: B, services: Services) -> Result<Self, VoxjobError> {
        let admission = LocalAdmission::new(backend.clone(), config.max_concurrent_jobs);
        Self::with_admission(config, backend, services, admission)
    }

    pub fn with_admission(
        config: Config,
        backend: B,
        services: Services,
        admission: impl Admission,
    ) -> Result<Self, VoxjobError> {
        config.validate()?;
        let schedule = config.sweep_schedule()?;
        let config = Arc::new(config);
        let layout = StorageLayout::new(&config.upload_dir, &config.output_dir);
        let admission: Arc<dyn Admission> = Arc::new(admission);
        let cancellation_token = CancellationToken::new();

        let validator = RequestValidator::new(config.clone(), services.file_processor.clone());
        let executor = Executor::new(backend.clone(), services, config.clone(), layout.clone());
        let runner = Arc::new(JobRunner::new(
            backend.clone(),
            executor,
            admission.clone(),
            layout.clone(),
            cancellation_token.clone(),
        ));

        Ok(Self {
            config,
            backend,
            admission,
            validator,
            layout,
            schedule,
            runner,
            cancellation_token,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.layout
    }

    /// Validate and register a new job, starting it right away if a slot is free.
    ///
    /// Returns as soon as the job is recorded. Validation failures create no record.
    #[instrument(skip_all)]
    pub async fn create_job(&self, request: JobRequest) -> Result<JobId, VoxjobError> {
        if self.cancellation_token.is_cancelled() {
            return Err(VoxjobError::ShuttingDown);
        }
        let input = self
            .validator
            .validate(request)
            .await
            .inspect_err(|err| tracing::info!(?err, "Rejected job request: {err}"))?;

        let job_id = JobId::new();
        let input = self.store_upload(job_id, input).await?;
        let stored = match &input {
            JobInput::Upload { path, .. } => Some(path.clone()),
            JobInput::Youtube { .. } => None,
        };
        let job = Job::new(job_id, input, self.config.retention());
        tracing::info!(%job_id, job_type = ?job.job_type, "Created job {job_id}");
        if let Err(err) = self.backend.put(job).await {
            if let Some(path) = stored {
                let _ = storage::remove_path(&path).await;
            }
            return Err(err.into());
        }

        match self.admission.try_admit(job_id).await {
            Ok(Admit::Admitted) => self.runner.spawn(job_id),
            Ok(Admit::Queued { position }) => {
                tracing::info!(%job_id, position, "Job {job_id} queued at position {position}");
                if self.cancellation_token.is_cancelled() {
                    self.fail_queued(job_id).await;
                }
            }
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to admit job {job_id}: {err}");
                self.runner
                    .handle_job_error(job_id, JobError::internal(&err))
                    .await;
                return Err(err.into());
            }
        }
        Ok(job_id)
    }

    async fn store_upload(&self, job_id: JobId, input: JobInput) -> Result<JobInput, VoxjobError> {
        match input {
            JobInput::Upload {
                path,
                filename,
                size,
            } => {
                let extension = Path::new(&filename)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or_default()
                    .to_lowercase();
                let stored = self.layout.job(job_id).upload(&extension);
                if path != stored {
                    self.layout.ensure_dirs().await.map_err(VoxjobError::Storage)?;
                    storage::move_file(&path, &stored)
                        .await
                        .map_err(VoxjobError::Storage)?;
                }
                Ok(JobInput::Upload {
                    path: stored,
                    filename,
                    size,
                })
            }
            input => Ok(input),
        }
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<StatusReport, StatusError> {
        let job = self.backend.get(job_id).await?;
        let queue_position = match job.status {
            JobStatus::Pending => self.admission.queue_position(job_id).await,
            _ => None,
        };
        Ok(StatusReport::new(
            job,
            queue_position,
            self.config.estimated_job_secs,
        ))
    }

    pub async fn get_result(&self, job_id: JobId) -> Result<JobResult, ResultError> {
        let job = self.backend.get(job_id).await?;
        match (job.status, job.output) {
            (JobStatus::Completed, Some(output)) => {
                if !tokio::fs::try_exists(&output.vocal_path).await.unwrap_or(false) {
                    return Err(ResultError::Missing(job_id));
                }
                Ok(JobResult::new(job_id, output, job.title.as_deref(), Utc::now()))
            }
            (JobStatus::Failed, _) => Err(ResultError::Failed {
                id: job_id,
                error: job
                    .error
                    .unwrap_or_else(|| JobError::internal("No error was recorded")),
            }),
            (status, _) => Err(ResultError::NotReady { id: job_id, status }),
        }
    }

    pub async fn stats(&self) -> Result<Stats, BackendError> {
        let jobs = self.backend.list().await?;
        let snapshot = self.admission.snapshot().await;
        Ok(Stats {
            total_jobs: jobs.len(),
            by_status: Stats::count(&jobs),
            active: snapshot.active,
            queued: snapshot.queued,
            capacity: snapshot.capacity,
            storage: self.layout.usage().await,
        })
    }

    /// Start the retention sweeper on the configured schedule. It stops on
    /// [`JobManager::graceful_shutdown`].
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        tracing::debug!(schedule = ?self.schedule, "Starting the retention sweeper");
        self.sweeper()
            .spawn(self.cancellation_token.child_token())
    }

    /// Run a single retention sweep immediately.
    pub async fn sweep_now(&self) -> SweepReport {
        self.sweeper().sweep(Utc::now()).await
    }

    fn sweeper(&self) -> SweeperRunner<B> {
        SweeperRunner::new(
            self.backend.clone(),
            self.layout.clone(),
            self.schedule.clone(),
            &self.config,
        )
    }

    /// Stop accepting work and wait for running jobs to wind down.
    ///
    /// Queued jobs are failed immediately. Running jobs stop at their next stage boundary and
    /// are failed as well; a stage already in progress is allowed to finish first.
    pub async fn graceful_shutdown(&self) {
        tracing::debug!("Shutting down the job manager");
        self.cancellation_token.cancel();
        let queued = self.admission.drain().await;
        futures::future::join_all(queued.into_iter().map(|job_id| self.fail_queued(job_id))).await;
        self.runner.wait().await;
        tracing::debug!("Job manager shut down");
    }

    async fn fail_queued(&self, job_id: JobId) {
        self.runner
            .handle_job_error(
                job_id,
                JobError::internal("Service shut down before the job started"),
            )
            .await;
    }
}
