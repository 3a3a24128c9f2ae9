//! Provides an in memory implementation of [`Backend`].
//!
//! Records live for the lifetime of the process. A single lock guards the whole table, which
//! keeps [`Backend::update`] trivially atomic; the lock is never held across an await point.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Backend, BackendError};
use crate::job::{Job, JobId, StateError};

/// An in memory implementation of [`Backend`].
///
/// Cloning is cheap and every clone refers to the same table.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn put(&self, job: Job) -> Result<(), BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        if jobs.contains_key(&job.id) {
            return Err(BackendError::DuplicateJob(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Job, BackendError> {
        self.jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .get(&id)
            .cloned()
            .ok_or(BackendError::JobNotFound(id))
    }

    async fn update<F>(&self, id: JobId, mutator: F) -> Result<Job, BackendError>
    where
        F: FnOnce(&mut Job) -> Result<(), StateError> + Send,
    {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        match jobs.get_mut(&id) {
            None => Err(BackendError::JobNotFound(id)),
            Some(job) => {
                let mut updated = job.clone();
                mutator(&mut updated)?;
                *job = updated.clone();
                Ok(updated)
            }
        }
    }

    async fn delete(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        Ok(self
            .jobs
            .write()
            .map_err(|_| BackendError::BadState)?
            .remove(&id))
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, BackendError> {
        let jobs = self.jobs.read().map_err(|_| BackendError::BadState)?;
        let mut expired = jobs
            .values()
            .filter(|job| job.status.is_terminal() && job.expires_at <= now)
            .map(|job| (job.expires_at, job.id))
            .collect::<Vec<_>>();
        expired.sort_by_key(|(expires_at, _)| *expires_at);
        Ok(expired.into_iter().map(|(_, id)| id).collect())
    }

    async fn list(&self) -> Result<Vec<Job>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(super) mod test {
    use super::*;
    use crate::test_suite;
    use assert_matches::assert_matches;

    test_suite!(for: InMemoryBackend::new());

    #[tokio::test]
    async fn clones_share_the_same_table() {
        let backend = InMemoryBackend::new();
        let job = Job::raw_job();
        backend.clone().put(job.clone()).await.unwrap();
        assert_eq!(backend.get(job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn badstate_errors() {
        let backend = InMemoryBackend::new();
        let job = Job::raw_job();
        let id = job.id;
        backend.put(job).await.unwrap();

        tokio::task::spawn({
            let backend = backend.clone();
            async move {
                let _guard = backend.jobs.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(backend.put(Job::raw_job()).await, Err(BackendError::BadState));
        assert_matches!(backend.get(id).await, Err(BackendError::BadState));
        assert_matches!(
            backend.update(id, |job| job.mark_processing()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(backend.delete(id).await, Err(BackendError::BadState));
        assert_matches!(
            backend.list_expired(Utc::now()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(backend.list().await, Err(BackendError::BadState));
    }
}
