use std::{fmt::Display, path::PathBuf, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub(crate) mod runner;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FileUpload,
    YoutubeDownload,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step of the processing pipeline.
///
/// Each stage owns a fixed slice of the overall progress range so that progress stays
/// monotonic regardless of how a stage reports internally.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Acquire,
    Normalize,
    Separate,
    Finalize,
}

impl Stage {
    /// The progress range `(start, end)` covered by this stage.
    pub const fn band(&self) -> (f32, f32) {
        match self {
            Self::Acquire => (0.0, 30.0),
            Self::Normalize => (30.0, 40.0),
            Self::Separate => (40.0, 95.0),
            Self::Finalize => (95.0, 100.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Normalize => "normalize",
            Self::Separate => "separate",
            Self::Finalize => "finalize",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum JobInput {
    Upload {
        path: PathBuf,
        filename: String,
        size: u64,
    },
    Youtube {
        url: String,
    },
}

impl JobInput {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Upload { .. } => JobType::FileUpload,
            Self::Youtube { .. } => JobType::YoutubeDownload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub vocal_path: PathBuf,
    pub preview_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    DownloadError,
    ConversionError,
    SeparationError,
    Timeout,
    InternalError,
}

impl ErrorKind {
    /// The machine readable code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::DownloadError => "DOWNLOAD_ERROR",
            Self::ConversionError => "CONVERSION_ERROR",
            Self::SeparationError => "SEPARATION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::ValidationError => "Check the input against the size, duration and format limits and submit a new job",
            Self::DownloadError => "Check that the video is public and available, then submit a new job",
            Self::ConversionError => "Try a different audio file or format",
            Self::SeparationError => "Submit a new job; if it keeps failing try a shorter or different file",
            Self::Timeout => "Try a shorter audio file",
            Self::InternalError => "Submit a new job; contact support if the problem persists",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// The structured failure recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub suggested_action: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggested_action: kind.suggested_action().to_owned(),
        }
    }

    pub(crate) fn internal(message: impl Display) -> Self {
        Self::new(ErrorKind::InternalError, message.to_string())
    }
}

impl Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for JobError {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("Job {id} is {status}, progress can only change while processing")]
    NotProcessing { id: JobId, status: JobStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: f32,
    pub stage: Option<Stage>,
    pub title: Option<String>,
    pub input: JobInput,
    pub input_path: Option<PathBuf>,
    pub output: Option<JobOutput>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub processing_time: Option<f64>,
}

impl Job {
    pub(crate) fn new(id: JobId, input: JobInput, retention: TimeDelta) -> Self {
        let now = Utc::now();
        let title = match &input {
            JobInput::Upload { filename, .. } => Some(filename.clone()),
            JobInput::Youtube { .. } => None,
        };
        Self {
            id,
            job_type: input.job_type(),
            status: JobStatus::Pending,
            progress: 0.0,
            stage: None,
            title,
            input,
            input_path: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: now + retention,
            processing_time: None,
        }
    }

    pub(crate) fn mark_processing(&mut self) -> Result<(), StateError> {
        self.transition(JobStatus::Pending, JobStatus::Processing)?;
        self.progress = 0.0;
        Ok(())
    }

    pub(crate) fn enter_stage(&mut self, stage: Stage) -> Result<(), StateError> {
        self.ensure_processing()?;
        self.stage = Some(stage);
        self.record_progress(stage.band().0)
    }

    /// Progress never moves backwards; lower values are ignored.
    pub(crate) fn record_progress(&mut self, progress: f32) -> Result<(), StateError> {
        self.ensure_processing()?;
        let progress = progress.clamp(0.0, 100.0);
        if progress > self.progress {
            self.progress = progress;
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    pub(crate) fn set_title(&mut self, title: String) -> Result<(), StateError> {
        self.ensure_processing()?;
        self.title = Some(title);
        Ok(())
    }

    pub(crate) fn set_input_path(&mut self, path: PathBuf) -> Result<(), StateError> {
        self.ensure_processing()?;
        self.input_path = Some(path);
        Ok(())
    }

    pub(crate) fn mark_completed(&mut self, output: JobOutput) -> Result<(), StateError> {
        self.transition(JobStatus::Processing, JobStatus::Completed)?;
        self.progress = 100.0;
        self.output = Some(output);
        self.finish();
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self, error: JobError) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: JobStatus::Failed,
            });
        }
        self.status = JobStatus::Failed;
        self.output = None;
        self.error = Some(error);
        self.finish();
        Ok(())
    }

    fn transition(&mut self, from: JobStatus, to: JobStatus) -> Result<(), StateError> {
        if self.status != from {
            return Err(StateError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn ensure_processing(&self) -> Result<(), StateError> {
        match self.status {
            JobStatus::Processing => Ok(()),
            status => Err(StateError::NotProcessing {
                id: self.id,
                status,
            }),
        }
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.completed_at = Some(now);
        self.processing_time = Some((now - self.created_at).num_milliseconds() as f64 / 1000.0);
    }

    /// Every path on disk that may belong to this job, excluding its working directory.
    pub(crate) fn input_files(&self) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(2);
        if let JobInput::Upload { path, .. } = &self.input {
            paths.push(path.clone());
        }
        if let Some(path) = &self.input_path {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use assert_matches::assert_matches;

    impl Job {
        pub(crate) fn raw_job() -> Self {
            Self::new(
                JobId::new(),
                JobInput::Youtube {
                    url: "https://youtu.be/dQw4w9WgXcQ".to_owned(),
                },
                TimeDelta::hours(24),
            )
        }

        pub(crate) fn with_status(mut self, status: JobStatus) -> Self {
            match status {
                JobStatus::Pending => {}
                JobStatus::Processing => self.mark_processing().unwrap(),
                JobStatus::Completed => {
                    self.mark_processing().unwrap();
                    self.mark_completed(JobOutput {
                        vocal_path: "vocals.wav".into(),
                        preview_path: None,
                    })
                    .unwrap();
                }
                JobStatus::Failed => self
                    .mark_failed(JobError::new(ErrorKind::InternalError, "failed"))
                    .unwrap(),
            }
            self
        }

        pub(crate) fn backdated(mut self, delta: TimeDelta) -> Self {
            self.created_at -= delta;
            self.expires_at -= delta;
            self
        }
    }

    #[test]
    fn new_job_is_pending_with_zero_progress() {
        let job = Job::raw_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.job_type, JobType::YoutubeDownload);
        assert_eq!(job.expires_at - job.created_at, TimeDelta::hours(24));
        assert!(job.output.is_none() && job.error.is_none());
    }

    #[test]
    fn progress_is_monotonic() {
        let mut job = Job::raw_job().with_status(JobStatus::Processing);
        job.record_progress(40.0).unwrap();
        job.record_progress(20.0).unwrap();
        assert_eq!(job.progress, 40.0);
        job.record_progress(250.0).unwrap();
        assert_eq!(job.progress, 100.0);
    }

    #[test]
    fn progress_rejected_unless_processing() {
        let mut job = Job::raw_job();
        assert_matches!(
            job.record_progress(10.0),
            Err(StateError::NotProcessing {
                status: JobStatus::Pending,
                ..
            })
        );
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn completion_sets_output_and_full_progress() {
        let job = Job::raw_job().with_status(JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert!(job.output.is_some());
        assert!(job.error.is_none());
        assert!(job.completed_at.is_some());
        assert!(job.processing_time.is_some());
    }

    #[test]
    fn terminal_jobs_are_immutable() {
        let mut completed = Job::raw_job().with_status(JobStatus::Completed);
        let snapshot = completed.clone();
        assert_matches!(
            completed.mark_failed(JobError::internal("late")),
            Err(StateError::InvalidTransition { .. })
        );
        assert_matches!(completed.mark_processing(), Err(StateError::InvalidTransition { .. }));
        assert_matches!(completed.record_progress(1.0), Err(StateError::NotProcessing { .. }));
        assert_eq!(completed, snapshot);

        let mut failed = Job::raw_job().with_status(JobStatus::Failed);
        assert_matches!(
            failed.mark_completed(JobOutput {
                vocal_path: "vocals.wav".into(),
                preview_path: None
            }),
            Err(StateError::InvalidTransition { .. })
        );
        assert!(failed.output.is_none());
    }

    #[test]
    fn pending_job_can_fail_without_processing() {
        let job = Job::raw_job().with_status(JobStatus::Failed);
        assert_eq!(job.status, JobStatus::Failed);
        assert_matches!(
            job.error,
            Some(JobError {
                kind: ErrorKind::InternalError,
                ..
            })
        );
    }

    #[test]
    fn pending_job_cannot_complete() {
        let mut job = Job::raw_job();
        assert_matches!(
            job.mark_completed(JobOutput {
                vocal_path: "vocals.wav".into(),
                preview_path: None
            }),
            Err(StateError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Completed,
                ..
            })
        );
    }

    #[test]
    fn entering_stage_moves_to_band_start() {
        let mut job = Job::raw_job().with_status(JobStatus::Processing);
        job.enter_stage(Stage::Separate).unwrap();
        assert_eq!(job.stage, Some(Stage::Separate));
        assert_eq!(job.progress, Stage::Separate.band().0);
    }

    #[test]
    fn stage_bands_are_contiguous() {
        let stages = [Stage::Acquire, Stage::Normalize, Stage::Separate, Stage::Finalize];
        assert_eq!(stages[0].band().0, 0.0);
        assert_eq!(stages[3].band().1, 100.0);
        for pair in stages.windows(2) {
            assert_eq!(pair[0].band().1, pair[1].band().0);
        }
    }

    #[test]
    fn job_id_round_trips_through_string() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn error_kind_serializes_as_code() {
        let json = serde_json::to_string(&ErrorKind::SeparationError).unwrap();
        assert_eq!(json, "\"SEPARATION_ERROR\"");
    }

    #[test]
    fn input_files_are_deduplicated() {
        let mut job = Job::new(
            JobId::new(),
            JobInput::Upload {
                path: "in.mp3".into(),
                filename: "in.mp3".to_owned(),
                size: 10,
            },
            TimeDelta::hours(1),
        )
        .with_status(JobStatus::Processing);
        job.set_input_path("in.mp3".into()).unwrap();
        assert_eq!(job.input_files(), vec![PathBuf::from("in.mp3")]);
    }
}
