//! Job orchestration for an audio vocal-separation service.
//!
//! `voxjob` accepts long-running, resource-heavy processing requests (an uploaded audio file or
//! a YouTube URL), runs them through a staged pipeline with bounded concurrency, reports
//! progress to polling clients and reclaims storage once results have expired.
//!
//! The heavy lifting is done by external collaborators behind the traits in [`services`]: a
//! [`services::FileProcessor`] for probing and converting audio, a [`services::Downloader`] for
//! fetching audio from YouTube and a [`services::Separator`] that runs the separation model.
//!
//! # Lifecycle of a job
//!
//! 1. [`JobManager::create_job`] validates the request. Invalid requests are rejected with a
//!    [`validation::ValidationError`] and leave nothing behind.
//! 2. The job is recorded as pending and offered to the [`admission::Admission`] gate. If a slot
//!    is free it starts processing immediately, otherwise it waits in a FIFO queue.
//! 3. The pipeline acquires, normalizes, separates and finalizes the audio, moving the job's
//!    progress through fixed bands of `0..=100`.
//! 4. The job ends completed, with an output, or failed, with a structured
//!    [`job::JobError`]. Either way its slot is handed to the next waiting job.
//! 5. After the retention window the sweeper deletes the job and its files.
//!
//! # Setup
//!
//! ```no_run
//! use voxjob::{config::Config, services::Services, testing, JobManager, JobRequest};
//!
//! # async fn run() -> Result<(), voxjob::VoxjobError> {
//! let services = Services::new(
//!     testing::FakeFileProcessor::new(),
//!     testing::FakeDownloader::new(),
//!     testing::FakeSeparator::new(),
//! );
//! let manager = JobManager::in_memory(Config::default(), services)?;
//! let _sweeper = manager.spawn_sweeper();
//!
//! let job_id = manager
//!     .create_job(JobRequest::Youtube {
//!         url: "https://youtu.be/dQw4w9WgXcQ".to_owned(),
//!     })
//!     .await?;
//! let status = manager.get_status(job_id).await?;
//! assert!(status.progress >= 0.0);
//! # Ok(())
//! # }
//! ```
//!
//! # Logging
//!
//! The crate logs through [`tracing`] and never installs a subscriber itself.
use thiserror::Error;

pub mod admission;
pub mod backend;
pub mod config;
mod executor;
pub mod job;
pub mod manager;
pub mod progress;
pub mod services;
pub mod status;
pub mod storage;
pub mod sweeper;
pub mod testing;
pub mod validation;

pub use manager::{JobManager, JobRequest};

use backend::BackendError;
use config::ConfigError;
use job::ErrorKind;
use status::{ResultError, StatusError};
use validation::ValidationError;

#[derive(Debug, Error)]
pub enum VoxjobError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Error communicating with the backend")]
    Backend(#[from] BackendError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Result(#[from] ResultError),
    #[error("Failed to store the upload: {0}")]
    Storage(#[source] std::io::Error),
    #[error("The job manager is shutting down")]
    ShuttingDown,
}

impl VoxjobError {
    /// The machine readable code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(err) => err.code(),
            Self::Result(ResultError::Failed { error, .. }) => error.kind.code(),
            _ => ErrorKind::InternalError.code(),
        }
    }
}
