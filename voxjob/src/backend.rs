//! The job record store.
//!
//! A [`Backend`] owns every [`Job`] record. All components receive a handle to the same
//! backend and mutate records only through [`Backend::update`], which applies a mutator
//! atomically with respect to every other update.
//!
//! [`memory::InMemoryBackend`] is the in-process implementation. Other implementations can
//! be checked for conformance with [`crate::test_suite`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Job, JobId, StateError};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// Storage for job records.
#[async_trait]
pub trait Backend: Clone + Send + Sync + 'static {
    /// Insert a new job. Fails with [`BackendError::DuplicateJob`] if the id is taken.
    async fn put(&self, job: Job) -> Result<(), BackendError>;

    async fn get(&self, id: JobId) -> Result<Job, BackendError>;

    /// Atomic read-modify-write of a single job.
    ///
    /// The mutator runs against a copy of the record; the copy replaces the stored record
    /// only if the mutator returns `Ok`. Returns the job as stored after the update.
    async fn update<F>(&self, id: JobId, mutator: F) -> Result<Job, BackendError>
    where
        F: FnOnce(&mut Job) -> Result<(), StateError> + Send;

    /// Remove a job, returning it if it existed.
    async fn delete(&self, id: JobId) -> Result<Option<Job>, BackendError>;

    /// Ids of terminal jobs whose `expires_at` is at or before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, BackendError>;

    async fn list(&self) -> Result<Vec<Job>, BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {0} already exists")]
    DuplicateJob(JobId),
    #[error("Rejected update: {0}")]
    InvalidState(#[from] StateError),
    #[error("System in bad state")]
    BadState,
}
