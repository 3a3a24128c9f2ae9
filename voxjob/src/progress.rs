//! Progress reporting from opaque collaborators.
//!
//! A collaborator only sees [`ProgressReport`]. Reports are forwarded over a channel to a
//! [`ProgressPump`], which maps them into the stage's progress band and writes them to the
//! store. When the collaborator stays silent for a heartbeat interval the pump advances
//! progress by a small step on its own, stopping short of the band end, so pollers never see a
//! stalled job.
use std::time::Duration;

use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};

use crate::{backend::Backend, job::JobId};

/// Number of heartbeats needed to walk across a band.
const HEARTBEAT_STEPS: f32 = 30.0;
/// Share of the band heartbeats are allowed to cover.
const HEARTBEAT_CEILING: f32 = 0.9;

/// Receives progress in `0..=100` from a collaborator.
pub trait ProgressReport: Send + Sync {
    fn report(&self, progress: f32);
}

pub(crate) struct ChannelReporter {
    sender: mpsc::UnboundedSender<f32>,
}

impl ProgressReport for ChannelReporter {
    fn report(&self, progress: f32) {
        if self.sender.send(progress).is_err() {
            tracing::trace!("Dropping progress report, pump is gone");
        }
    }
}

/// Maps collaborator-local progress into a band of the overall job progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Band {
    start: f32,
    end: f32,
}

impl Band {
    pub(crate) fn new((start, end): (f32, f32)) -> Self {
        Self { start, end }
    }

    pub(crate) fn map(&self, local: f32) -> f32 {
        let local = if local.is_finite() {
            local.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.start + (self.end - self.start) * local / 100.0
    }

    fn heartbeat_step(&self) -> f32 {
        (self.end - self.start) / HEARTBEAT_STEPS
    }

    fn heartbeat_ceiling(&self) -> f32 {
        self.start + (self.end - self.start) * HEARTBEAT_CEILING
    }
}

pub(crate) struct ProgressPump<B: Backend> {
    backend: B,
    job_id: JobId,
    band: Band,
    heartbeat: Duration,
    receiver: mpsc::UnboundedReceiver<f32>,
}

pub(crate) fn channel<B: Backend>(
    backend: B,
    job_id: JobId,
    band: Band,
    heartbeat: Duration,
) -> (ChannelReporter, ProgressPump<B>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ChannelReporter { sender },
        ProgressPump {
            backend,
            job_id,
            band,
            heartbeat,
            receiver,
        },
    )
}

impl<B: Backend> ProgressPump<B> {
    /// Runs until dropped. Meant to be raced against the collaborator future.
    pub(crate) async fn run(mut self) {
        let mut current = self.band.map(0.0);
        let mut last_report = Instant::now();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reports_open = true;

        loop {
            tokio::select! {
                report = self.receiver.recv(), if reports_open => match report {
                    Some(local) => {
                        last_report = Instant::now();
                        current = current.max(self.band.map(local));
                        self.write(current).await;
                    }
                    None => reports_open = false,
                },
                _ = ticker.tick() => {
                    if last_report.elapsed() < self.heartbeat {
                        continue;
                    }
                    let ceiling = self.band.heartbeat_ceiling();
                    if current < ceiling {
                        current = (current + self.band.heartbeat_step()).min(ceiling);
                        tracing::trace!(job_id = %self.job_id, current, "Progress heartbeat");
                        self.write(current).await;
                    }
                }
            }
        }
    }

    async fn write(&self, progress: f32) {
        let _ = self
            .backend
            .update(self.job_id, move |job| job.record_progress(progress))
            .await
            .inspect_err(|err| {
                tracing::warn!(
                    ?err,
                    job_id = %self.job_id,
                    "Failed to record progress for job {}: {err}",
                    self.job_id
                )
            });
    }
}
