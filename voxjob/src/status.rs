//! Read-only views of jobs for polling clients.
use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::{
    backend::BackendError,
    job::{Job, JobError, JobId, JobInput, JobOutput, JobStatus, JobType, Stage},
    storage::StorageUsage,
};

const DOWNLOAD_NAME_LIMIT: usize = 50;

/// A snapshot of a job as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub job_id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: f32,
    pub message: &'static str,
    pub title: Option<String>,
    /// 1-based position in the wait queue while the job is pending.
    pub queue_position: Option<usize>,
    pub estimated_wait_secs: Option<u64>,
    pub error: Option<JobError>,
    pub output: Option<JobOutput>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_time: Option<f64>,
}

impl StatusReport {
    pub(crate) fn new(job: Job, queue_position: Option<usize>, secs_per_job: u64) -> Self {
        Self {
            message: message(&job),
            job_id: job.id,
            job_type: job.job_type,
            status: job.status,
            progress: job.progress,
            title: job.title,
            queue_position,
            estimated_wait_secs: queue_position.map(|position| position as u64 * secs_per_job),
            error: job.error,
            output: job.output,
            created_at: job.created_at,
            updated_at: job.updated_at,
            processing_time: job.processing_time,
        }
    }
}

/// Human readable summary of where a job is.
pub fn message(job: &Job) -> &'static str {
    match (job.status, job.stage, &job.input) {
        (JobStatus::Pending, ..) => "Waiting to process...",
        (JobStatus::Processing, Some(Stage::Acquire), JobInput::Youtube { .. }) => {
            "Downloading from YouTube..."
        }
        (JobStatus::Processing, Some(Stage::Acquire | Stage::Normalize) | None, _) => {
            "Preparing audio..."
        }
        (JobStatus::Processing, Some(Stage::Separate), _) => "Extracting vocals...",
        (JobStatus::Processing, Some(Stage::Finalize), _) => "Finalizing...",
        (JobStatus::Completed, ..) => "Processing complete",
        (JobStatus::Failed, ..) => "Processing failed",
    }
}

/// What a client needs to fetch the result of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub vocal_path: PathBuf,
    pub preview_path: Option<PathBuf>,
    /// Suggested file name for the download.
    pub download_name: String,
}

impl JobResult {
    pub(crate) fn new(job_id: JobId, output: JobOutput, title: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            vocal_path: output.vocal_path,
            preview_path: output.preview_path,
            download_name: download_name(title, now),
        }
    }
}

/// `<sanitized title>_vocals_<timestamp>.wav`
pub fn download_name(title: Option<&str>, now: DateTime<Utc>) -> String {
    let safe: String = title
        .unwrap_or("audio")
        .chars()
        .filter(|c| c.is_alphanumeric() || "._- ".contains(*c))
        .take(DOWNLOAD_NAME_LIMIT)
        .collect();
    let safe = if safe.trim().is_empty() { "audio" } else { safe.as_str() };
    format!("{safe}_vocals_{}.wav", now.format("%Y%m%d_%H%M%S"))
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for StatusError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::JobNotFound(id) => Self::NotFound(id),
            err => Self::Backend(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResultError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Job {id} is not yet completed, currently {status}")]
    NotReady { id: JobId, status: JobStatus },
    #[error("Job {id} failed: {error}")]
    Failed { id: JobId, error: JobError },
    #[error("Output of job {0} is no longer available")]
    Missing(JobId),
    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for ResultError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::JobNotFound(id) => Self::NotFound(id),
            err => Self::Backend(err),
        }
    }
}

/// Counters over every job currently held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total_jobs: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    pub active: usize,
    pub queued: usize,
    pub capacity: usize,
    pub storage: StorageUsage,
}

impl Stats {
    pub(crate) fn count<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> BTreeMap<&'static str, usize> {
        let mut by_status: BTreeMap<_, _> =
            JobStatus::ALL.iter().map(|status| (status.as_str(), 0)).collect();
        for job in jobs {
            *by_status.entry(job.status.as_str()).or_default() += 1;
        }
        by_status
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn messages_follow_status_and_stage() {
        let mut job = Job::raw_job();
        assert_eq!(message(&job), "Waiting to process...");

        job.mark_processing().unwrap();
        assert_eq!(message(&job), "Preparing audio...");
        job.enter_stage(Stage::Acquire).unwrap();
        assert_eq!(message(&job), "Downloading from YouTube...");
        job.enter_stage(Stage::Separate).unwrap();
        assert_eq!(message(&job), "Extracting vocals...");

        assert_eq!(
            message(&Job::raw_job().with_status(JobStatus::Completed)),
            "Processing complete"
        );
        assert_eq!(
            message(&Job::raw_job().with_status(JobStatus::Failed)),
            "Processing failed"
        );
    }

    #[test]
    fn queued_report_estimates_wait() {
        let report = StatusReport::new(Job::raw_job(), Some(3), 180);
        assert_eq!(report.queue_position, Some(3));
        assert_eq!(report.estimated_wait_secs, Some(540));

        let report = StatusReport::new(Job::raw_job().with_status(JobStatus::Processing), None, 180);
        assert_eq!(report.estimated_wait_secs, None);
    }

    #[test]
    fn report_serializes_codes() {
        let report = StatusReport::new(Job::raw_job().with_status(JobStatus::Failed), None, 180);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "INTERNAL_ERROR");
        assert_eq!(json["output"], serde_json::Value::Null);
    }

    #[test]
    fn download_name_is_sanitized() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            download_name(Some("Rick Astley - Never Gonna Give You Up (Official Video)"), now),
            "Rick Astley - Never Gonna Give You Up Official Vid_vocals_20240309_140507.wav"
        );
        assert_eq!(
            download_name(Some("../../etc/passwd"), now),
            "....etcpasswd_vocals_20240309_140507.wav"
        );
        assert_eq!(download_name(None, now), "audio_vocals_20240309_140507.wav");
        assert_eq!(download_name(Some("???"), now), "audio_vocals_20240309_140507.wav");
    }

    #[test]
    fn stats_count_every_status() {
        let jobs = [
            Job::raw_job(),
            Job::raw_job().with_status(JobStatus::Completed),
            Job::raw_job().with_status(JobStatus::Completed),
        ];
        let counts = Stats::count(&jobs);
        assert_eq!(counts["pending"], 1);
        assert_eq!(counts["processing"], 0);
        assert_eq!(counts["completed"], 2);
        assert_eq!(counts["failed"], 0);
    }
}
