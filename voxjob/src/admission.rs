//! Concurrency gate for the processing pipeline.
//!
//! At most `capacity` jobs are processing at any time. Jobs arriving while every slot is taken
//! wait in a FIFO queue and stay pending. The controller owns the pending to processing edge:
//! a job is only ever marked as processing here, at the moment it is given a slot.
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    backend::{Backend, BackendError},
    job::JobId,
};

/// Outcome of [`Admission::try_admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// The job holds a slot and has been marked as processing.
    Admitted,
    /// Every slot is taken. `position` is 1-based.
    Queued { position: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub active: usize,
    pub queued: usize,
    pub capacity: usize,
}

#[async_trait]
pub trait Admission: Send + Sync + 'static {
    async fn try_admit(&self, id: JobId) -> Result<Admit, BackendError>;

    /// Free the slot held by `id`.
    ///
    /// If a job was waiting it is admitted into the freed slot and returned; the caller is then
    /// responsible for running it.
    async fn release(&self, id: JobId) -> Option<JobId>;

    /// 1-based position of `id` in the wait queue, `None` if it is not queued.
    async fn queue_position(&self, id: JobId) -> Option<usize>;

    /// Stop admitting and hand back every job still waiting, oldest first.
    async fn drain(&self) -> Vec<JobId>;

    async fn snapshot(&self) -> AdmissionSnapshot;
}

#[derive(Debug, Default)]
struct Slots {
    active: HashSet<JobId>,
    queue: VecDeque<JobId>,
    closed: bool,
}

/// [`Admission`] for a single process.
pub struct LocalAdmission<B: Backend> {
    backend: B,
    capacity: usize,
    slots: Arc<Mutex<Slots>>,
}

impl<B: Backend> LocalAdmission<B> {
    pub fn new(backend: B, capacity: usize) -> Self {
        Self {
            backend,
            capacity,
            slots: Default::default(),
        }
    }

    async fn start(&self, id: JobId) -> Result<(), BackendError> {
        self.backend
            .update(id, |job| job.mark_processing())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<B: Backend> Admission for LocalAdmission<B> {
    async fn try_admit(&self, id: JobId) -> Result<Admit, BackendError> {
        let mut slots = self.slots.lock().await;
        if !slots.closed && slots.active.len() < self.capacity {
            self.start(id).await?;
            slots.active.insert(id);
            tracing::debug!(%id, active = slots.active.len(), "Admitted job {id}");
            return Ok(Admit::Admitted);
        }
        slots.queue.push_back(id);
        let position = slots.queue.len();
        tracing::debug!(%id, position, "Queued job {id}");
        Ok(Admit::Queued { position })
    }

    async fn release(&self, id: JobId) -> Option<JobId> {
        let mut slots = self.slots.lock().await;
        if !slots.active.remove(&id) {
            tracing::warn!(%id, "Releasing job {id} which holds no slot");
            return None;
        }
        if slots.closed {
            return None;
        }
        while let Some(next) = slots.queue.pop_front() {
            match self.start(next).await {
                Ok(()) => {
                    slots.active.insert(next);
                    tracing::debug!(%next, "Admitted queued job {next}");
                    return Some(next);
                }
                Err(err) => {
                    tracing::warn!(?err, %next, "Skipping queued job {next}: {err}");
                }
            }
        }
        None
    }

    async fn queue_position(&self, id: JobId) -> Option<usize> {
        let slots = self.slots.lock().await;
        slots
            .queue
            .iter()
            .position(|queued| *queued == id)
            .map(|index| index + 1)
    }

    async fn drain(&self) -> Vec<JobId> {
        let mut slots = self.slots.lock().await;
        slots.closed = true;
        slots.queue.drain(..).collect()
    }

    async fn snapshot(&self) -> AdmissionSnapshot {
        let slots = self.slots.lock().await;
        AdmissionSnapshot {
            active: slots.active.len(),
            queued: slots.queue.len(),
            capacity: self.capacity,
        }
    }
}
