use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, instrument, Instrument};

use crate::error::RegistryError;
use crate::events::{self, EventKind, Frame, POLL_TIMEOUT};
use crate::job::{Job, StopResult};
use crate::lock::RenderLock;
use crate::renderer::Renderer;
use crate::worker;

/// All jobs submitted during this process's lifetime, plus the shared
/// pieces every worker needs.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    lock: RenderLock,
    renderer: Arc<Renderer>,
    stop_grace: Duration,
}

impl JobRegistry {
    pub fn new(renderer: Arc<Renderer>, stop_grace: Duration) -> Self {
        JobRegistry {
            jobs: RwLock::new(HashMap::new()),
            lock: RenderLock::new(),
            renderer,
            stop_grace,
        }
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }

    pub fn render_lock(&self) -> &RenderLock {
        &self.lock
    }

    /// Registers a new job and starts its worker in the background. The
    /// request is only interpreted by the worker; problems with it surface as
    /// job events.
    pub async fn submit(&self, request: Map<String, Value>) -> String {
        let job = Arc::new(Job::new());
        self.jobs
            .write()
            .await
            .insert(job.id().to_string(), Arc::clone(&job));
        info!(job_id = %job.id(), "Job submitted");

        let span = info_span!("worker", job_id = %job.id());
        tokio::spawn(
            worker::start(
                Arc::clone(&job),
                request,
                self.lock.clone(),
                Arc::clone(&self.renderer),
            )
            .instrument(span),
        );
        job.id().to_string()
    }

    pub async fn get(&self, job_id: &str) -> Result<Arc<Job>, RegistryError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Live frames for `job_id`, ending once the job is done and drained.
    pub async fn stream(&self, job_id: &str) -> Result<BoxStream<'static, Frame>, RegistryError> {
        let job = self.get(job_id).await?;
        Ok(events::frames(job, POLL_TIMEOUT).boxed())
    }

    /// Requests that `job_id` stop. A running process is terminated and,
    /// if it outlives the grace period, killed. Safe to repeat, and a no-op
    /// beyond the flag once the job is done.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: &str) -> Result<(), RegistryError> {
        let job = self.get(job_id).await?;
        job.request_stop();
        job.emit_while_running(EventKind::JobStopping, json!({}));

        if let Some(process) = job.active_process() {
            let result = process.terminate(self.stop_grace).await;
            match result {
                StopResult::NotRunning => debug!("Render process had already exited"),
                StopResult::Terminated => info!(pid = ?process.pid(), "Render process terminated"),
                StopResult::Killed => info!(pid = ?process.pid(), "Render process killed"),
            }
        }
        Ok(())
    }
}
