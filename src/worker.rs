use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::*;

use crate::error::RenderError;
use crate::events::EventKind;
use crate::job::{Job, JobOutcome};
use crate::lock::RenderLock;
use crate::renderer::{ItemOutcome, Renderer};
use crate::request::RenderParams;

/// Drives one job from admission to its terminal event. Every path ends by
/// releasing the render lock (if taken) and then marking the job done.
#[instrument(skip_all, fields(job_id = %job.id()))]
pub async fn start(
    job: Arc<Job>,
    request: Map<String, Value>,
    lock: RenderLock,
    renderer: Arc<Renderer>,
) {
    let outcome = match lock.try_acquire(job.id()) {
        Err(busy) => {
            warn!(error = %busy, "Render lock busy, rejecting job");
            JobOutcome::Failed(busy.to_string())
        }
        Ok(permit) => {
            let outcome = AssertUnwindSafe(process(&job, &request, &renderer))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!("Render worker panicked");
                    JobOutcome::Failed(RenderError::Panicked.to_string())
                });
            drop(permit);
            outcome
        }
    };
    finish(&job, outcome);
}

async fn process(job: &Job, request: &Map<String, Value>, renderer: &Renderer) -> JobOutcome {
    job.emit(EventKind::JobStarted, json!({}));

    let params = match RenderParams::from_request(request) {
        Ok(params) => params,
        Err(err) => return JobOutcome::Failed(err.to_string()),
    };
    let models = renderer.list_models().await;
    let Some(model) = params.choose_model(&models) else {
        let err = RenderError::NoModels {
            dir: renderer.paths().model_dir.clone(),
        };
        return JobOutcome::Failed(err.to_string());
    };
    info!(model, batch_size = params.batch_size, "Starting batch");

    for idx in 0..params.batch_size {
        if job.stop_requested() {
            return JobOutcome::Cancelled;
        }
        let seed = params.seed.seed_for(idx);
        job.emit(
            EventKind::RenderStart,
            json!({
                "idx": idx,
                "batch_size": params.batch_size,
                "seed": seed,
                "width": params.width,
                "height": params.height,
                "sd_model": model,
            }),
        );

        match renderer.render_item(job, &params, model, seed).await {
            ItemOutcome::Rendered(image) => {
                job.emit(
                    EventKind::RenderDone,
                    json!({
                        "seed": image.seed,
                        "duration": image.duration.as_secs_f64(),
                        "path": image.path.display().to_string(),
                    }),
                );
                job.emit(
                    EventKind::Image,
                    json!({
                        "idx": idx,
                        "batch_size": params.batch_size,
                        "seed": image.seed,
                        "width": params.width,
                        "height": params.height,
                        "url": format!("/outputs/{}", image.filename),
                        "filename": image.filename,
                    }),
                );
            }
            ItemOutcome::Failed(err) => return JobOutcome::Failed(err.to_string()),
            ItemOutcome::Cancelled => return JobOutcome::Cancelled,
        }
    }

    JobOutcome::Succeeded
}

/// Emits the terminal event for `outcome` and publishes `done`. A failure
/// that coincides with a stop request is reported as a cancellation.
fn finish(job: &Job, outcome: JobOutcome) {
    let (kind, payload) = match outcome {
        JobOutcome::Succeeded => {
            info!("Job completed");
            (EventKind::JobDone, json!({}))
        }
        JobOutcome::Failed(message) if job.stop_requested() => {
            info!(error = %message, "Job cancelled");
            job.mark_cancelled();
            (EventKind::JobCancelled, json!({ "message": message }))
        }
        JobOutcome::Failed(message) => {
            info!(error = %message, "Job failed");
            job.set_error(message.clone());
            (EventKind::JobError, json!({ "message": message }))
        }
        JobOutcome::Cancelled => {
            info!("Job cancelled");
            job.mark_cancelled();
            (EventKind::JobCancelled, json!({}))
        }
    };
    job.finish(kind, payload);
}
