use std::{collections::HashSet, path::Path};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, BackendError},
    config::Config,
    job::JobId,
    storage::{self, StorageLayout},
};

use super::{SweepReport, SweepSchedule};

pub(crate) struct SweeperRunner<B: Backend> {
    backend: B,
    layout: StorageLayout,
    schedule: SweepSchedule,
    retention: TimeDelta,
    grace: TimeDelta,
}

impl<B> SweeperRunner<B>
where
    B: Backend,
{
    pub(crate) fn new(
        backend: B,
        layout: StorageLayout,
        schedule: SweepSchedule,
        config: &Config,
    ) -> Self {
        Self {
            backend,
            layout,
            schedule,
            retention: config.retention(),
            grace: config.sweep_grace(),
        }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_fire = Utc::now();
            loop {
                let Some(next) = self.schedule.next_after(Utc::now().max(last_fire)) else {
                    tracing::warn!("No future scheduled time for the retention sweeper");
                    break;
                };
                let delay = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        last_fire = next;
                        let report = self.sweep(Utc::now()).await;
                        if report.is_empty() {
                            tracing::debug!(?report, "Retention sweep found nothing to remove");
                        } else {
                            tracing::info!(
                                ?report,
                                "Retention sweep removed {} jobs and {} orphaned files",
                                report.jobs_removed,
                                report.orphans_removed,
                            );
                        }
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the retention sweeper");
                        break;
                    }
                }
            }
        })
    }

    pub(crate) async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let expired = match self.backend.list_expired(now).await {
            Ok(expired) => expired,
            Err(err) => {
                tracing::error!(?err, "Failed to list expired jobs: {err}");
                return report;
            }
        };

        for job_id in expired {
            self.sweep_job(job_id, now, &mut report).await;
        }
        self.sweep_orphans(now, &mut report).await;
        report
    }

    async fn sweep_job(&self, job_id: JobId, now: DateTime<Utc>, report: &mut SweepReport) {
        let job = match self.backend.get(job_id).await {
            Ok(job) => job,
            Err(BackendError::JobNotFound(_)) => return,
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to load expired job {job_id}: {err}");
                return;
            }
        };

        let settled = job
            .completed_at
            .is_some_and(|completed_at| completed_at + self.grace <= now);
        if !job.status.is_terminal() || !settled {
            tracing::debug!(%job_id, status = %job.status, "Not sweeping job {job_id} yet");
            report.jobs_skipped += 1;
            return;
        }

        let removal = self.layout.remove_job_files(&job).await;
        report.files_removed += removal.removed;
        report.files_failed += removal.failed;

        match self.backend.delete(job_id).await {
            Ok(_) => {
                tracing::info!(%job_id, "Removed expired job {job_id}");
                report.jobs_removed += 1;
            }
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to delete expired job {job_id}: {err}")
            }
        }
    }

    async fn sweep_orphans(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let known = match self.backend.list().await {
            Ok(jobs) => jobs.into_iter().map(|job| job.id).collect::<HashSet<_>>(),
            Err(err) => {
                tracing::error!(?err, "Skipping orphan sweep, failed to list jobs: {err}");
                return;
            }
        };
        for dir in [self.layout.upload_dir(), self.layout.output_dir()] {
            self.sweep_orphans_in(dir, &known, now, report).await;
        }
    }

    async fn sweep_orphans_in(
        &self,
        dir: &Path,
        known: &HashSet<JobId>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                tracing::warn!(?err, dir = %dir.display(), "Cannot scan {}: {err}", dir.display());
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(?err, dir = %dir.display(), "Failed reading {}: {err}", dir.display());
                    break;
                }
            };
            let path = entry.path();
            if storage::owner_of(&path).is_some_and(|owner| known.contains(&owner)) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|metadata| metadata.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(err) => {
                    tracing::warn!(?err, path = %path.display(), "Cannot check {}: {err}", path.display());
                    continue;
                }
            };
            if now - modified < self.retention {
                continue;
            }
            match storage::remove_path(&path).await {
                Ok(true) => {
                    tracing::info!(path = %path.display(), "Deleted orphaned {}", path.display());
                    report.orphans_removed += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(?err, path = %path.display(), "Failed to delete {}: {err}", path.display());
                    report.files_failed += 1;
                }
            }
        }
    }
}
