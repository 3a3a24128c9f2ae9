//! Test suite for ensuring a correct implementation of a backend.
use chrono::{TimeDelta, Utc};

use super::{Backend, BackendError};
use crate::job::{ErrorKind, Job, JobError, JobId, JobInput, JobOutput, JobStatus, StateError};

fn mock_job() -> Job {
    Job::new(
        JobId::new(),
        JobInput::Youtube {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_owned(),
        },
        TimeDelta::hours(24),
    )
}

fn mock_job_with_status(status: JobStatus, age: TimeDelta) -> Job {
    let mut job = mock_job();
    job.created_at -= age;
    job.expires_at -= age;
    let result = match status {
        JobStatus::Pending => Ok(()),
        JobStatus::Processing => job.mark_processing(),
        JobStatus::Completed => job.mark_processing().and_then(|_| {
            job.mark_completed(JobOutput {
                vocal_path: "vocals.wav".into(),
                preview_path: None,
            })
        }),
        JobStatus::Failed => job.mark_failed(JobError::new(ErrorKind::InternalError, "boom")),
    };
    assert!(result.is_ok(), "failed to build job with status {status}");
    job
}

/// Create test suite for voxjob backends.
///
/// For backend implementors, it is useful to include this as part of your test suites.
///
/// ```ignore
/// use voxjob::test_suite;
/// use voxjob::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        #[$attr]
        async fn put_and_get $args {
          let backend = $backend;
          $crate::backend::testing::put_and_get(backend).await;
        }
        #[$attr]
        async fn put_duplicate $args {
          let backend = $backend;
          $crate::backend::testing::put_duplicate(backend).await;
        }
        #[$attr]
        async fn get_not_found $args {
          let backend = $backend;
          $crate::backend::testing::get_not_found(backend).await;
        }
        #[$attr]
        async fn update_applies_mutation $args {
          let backend = $backend;
          $crate::backend::testing::update_applies_mutation(backend).await;
        }
        #[$attr]
        async fn update_rejected_leaves_job_untouched $args {
          let backend = $backend;
          $crate::backend::testing::update_rejected_leaves_job_untouched(backend).await;
        }
        #[$attr]
        async fn update_not_found $args {
          let backend = $backend;
          $crate::backend::testing::update_not_found(backend).await;
        }
        #[$attr]
        async fn concurrent_updates_are_not_lost $args {
          let backend = $backend;
          $crate::backend::testing::concurrent_updates_are_not_lost(backend).await;
        }
        #[$attr]
        async fn delete $args {
          let backend = $backend;
          $crate::backend::testing::delete(backend).await;
        }
        #[$attr]
        async fn delete_not_found $args {
          let backend = $backend;
          $crate::backend::testing::delete_not_found(backend).await;
        }
        #[$attr]
        async fn list_expired_only_returns_expired_terminal_jobs $args {
          let backend = $backend;
          $crate::backend::testing::list_expired_only_returns_expired_terminal_jobs(backend).await;
        }
        #[$attr]
        async fn list $args {
          let backend = $backend;
          $crate::backend::testing::list(backend).await;
        }
    };
}

pub async fn put_and_get(backend: impl Backend) {
    let job = mock_job();
    backend.put(job.clone()).await.unwrap();

    let stored = backend.get(job.id).await.unwrap();
    assert_eq!(stored, job);
    assert_eq!(stored.status, JobStatus::Pending);
}

pub async fn put_duplicate(backend: impl Backend) {
    let job = mock_job();
    backend.put(job.clone()).await.unwrap();

    let result = backend.put(job.clone()).await;
    assert!(matches!(result, Err(BackendError::DuplicateJob(id)) if id == job.id));
}

pub async fn get_not_found(backend: impl Backend) {
    let id = JobId::new();
    let result = backend.get(id).await;
    assert!(matches!(result, Err(BackendError::JobNotFound(missing)) if missing == id));
}

pub async fn update_applies_mutation(backend: impl Backend) {
    let job = mock_job();
    backend.put(job.clone()).await.unwrap();

    let updated = backend
        .update(job.id, |job| job.mark_processing())
        .await
        .unwrap();
    assert_eq!(updated.status, JobStatus::Processing);
    assert_eq!(backend.get(job.id).await.unwrap(), updated);
}

pub async fn update_rejected_leaves_job_untouched(backend: impl Backend) {
    let job = mock_job_with_status(JobStatus::Completed, TimeDelta::zero());
    backend.put(job.clone()).await.unwrap();

    let result = backend
        .update(job.id, |job| {
            job.title = Some("changed".to_owned());
            job.mark_failed(JobError::new(ErrorKind::InternalError, "late"))
        })
        .await;

    assert!(matches!(
        result,
        Err(BackendError::InvalidState(StateError::InvalidTransition { .. }))
    ));
    assert_eq!(backend.get(job.id).await.unwrap(), job);
}

pub async fn update_not_found(backend: impl Backend) {
    let id = JobId::new();
    let result = backend.update(id, |job| job.mark_processing()).await;
    assert!(matches!(result, Err(BackendError::JobNotFound(missing)) if missing == id));
}

pub async fn concurrent_updates_are_not_lost(backend: impl Backend) {
    let job = mock_job_with_status(JobStatus::Processing, TimeDelta::zero());
    let id = job.id;
    backend.put(job).await.unwrap();

    let handles = (0..50)
        .map(|_| {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .update(id, |job| {
                        let next = job.progress + 1.0;
                        job.record_progress(next)
                    })
                    .await
                    .unwrap();
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(backend.get(id).await.unwrap().progress, 50.0);
}

pub async fn delete(backend: impl Backend) {
    let job = mock_job();
    backend.put(job.clone()).await.unwrap();

    let deleted = backend.delete(job.id).await.unwrap();
    assert_eq!(deleted, Some(job.clone()));
    assert!(matches!(
        backend.get(job.id).await,
        Err(BackendError::JobNotFound(_))
    ));
}

pub async fn delete_not_found(backend: impl Backend) {
    assert_eq!(backend.delete(JobId::new()).await.unwrap(), None);
}

pub async fn list_expired_only_returns_expired_terminal_jobs(backend: impl Backend) {
    let old = TimeDelta::hours(25);
    let expired_completed = mock_job_with_status(JobStatus::Completed, old);
    let expired_failed = mock_job_with_status(JobStatus::Failed, old + TimeDelta::hours(1));
    let old_processing = mock_job_with_status(JobStatus::Processing, old);
    let old_pending = mock_job_with_status(JobStatus::Pending, old);
    let fresh_completed = mock_job_with_status(JobStatus::Completed, TimeDelta::hours(1));

    for job in [
        &expired_completed,
        &expired_failed,
        &old_processing,
        &old_pending,
        &fresh_completed,
    ] {
        backend.put(job.clone()).await.unwrap();
    }

    let expired = backend.list_expired(Utc::now()).await.unwrap();
    assert_eq!(expired.len(), 2);
    assert!(expired.contains(&expired_completed.id));
    assert!(expired.contains(&expired_failed.id));
}

pub async fn list(backend: impl Backend) {
    let first = mock_job();
    let second = mock_job_with_status(JobStatus::Failed, TimeDelta::zero());
    backend.put(first.clone()).await.unwrap();
    backend.put(second.clone()).await.unwrap();

    let jobs = backend.list().await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.contains(&first));
    assert!(jobs.contains(&second));
}
