use std::sync::Arc;

use tokio::task::JoinError;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};

use crate::{
    admission::Admission,
    backend::Backend,
    executor::Executor,
    storage::StorageLayout,
};

use super::{JobError, JobId, JobOutput};

pub(crate) struct JobRunner<B>
where
    B: Backend,
{
    backend: B,
    executor: Executor<B>,
    admission: Arc<dyn Admission>,
    layout: StorageLayout,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl<B> JobRunner<B>
where
    B: Backend,
{
    pub(crate) fn new(
        backend: B,
        executor: Executor<B>,
        admission: Arc<dyn Admission>,
        layout: StorageLayout,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            backend,
            executor,
            admission,
            layout,
            tracker: TaskTracker::new(),
            cancellation_token,
        }
    }

    /// Run an admitted job in the background.
    ///
    /// The task keeps the slot for as long as there is queued work: once the job finishes its
    /// slot is released and any job admitted in its place is run on the same task.
    pub(crate) fn spawn(self: &Arc<Self>, job_id: JobId) {
        let runner = Arc::clone(self);
        self.tracker.spawn(async move {
            let mut next = Some(job_id);
            while let Some(job_id) = next {
                runner.execute_job(job_id).await;
                next = runner.admission.release(job_id).await;
            }
        });
    }

    /// Wait for every spawned job to finish. No new jobs can be spawned afterwards.
    pub(crate) async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    pub(crate) async fn execute_job(&self, job_id: JobId) {
        let executor = self.executor.clone();
        let token = self.cancellation_token.child_token();
        let fut = async move { executor.execute(job_id, &token).await }.in_current_span();

        tracing::debug!(%job_id, "Executing job {job_id}");
        match tokio::spawn(fut).await {
            Ok(Ok(output)) => self.handle_job_complete(job_id, output).await,
            Ok(Err(error)) => self.handle_job_error(job_id, error).await,
            Err(error) => self.handle_job_error(job_id, error.into()).await,
        }
    }

    async fn handle_job_complete(&self, job_id: JobId, output: JobOutput) {
        tracing::info!(%job_id, "Job complete {job_id}");
        let _ = self
            .backend
            .update(job_id, move |job| job.mark_completed(output))
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {err:?}",
                )
            });
    }

    pub(crate) async fn handle_job_error(&self, job_id: JobId, error: JobError) {
        tracing::error!(
            %job_id,
            ?error,
            "Job {job_id} failed: error type: {}, message: {}",
            error.kind,
            error.message
        );
        match self.backend.get(job_id).await {
            Ok(job) => {
                let removal = self.layout.remove_job_files(&job).await;
                tracing::debug!(%job_id, ?removal, "Removed artifacts of failed job {job_id}");
            }
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to load job {job_id} for cleanup: {err}")
            }
        }
        let _ = self
            .backend
            .update(job_id, move |job| job.mark_failed(error))
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as failed, error: {err:?}",
                )
            });
    }
}

impl From<JoinError> for JobError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        JobError::internal(format!("Job panicked: {message}"))
    }
}
