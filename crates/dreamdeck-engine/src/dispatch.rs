//! Runs backend calls off the host thread and hands results back through the
//! task queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dreamdeck_contracts::{
    ErrorReporter, GenerationError, GenerationRequest, GenerationResult, UpscaleRequest,
};
use tracing::{debug, info};

use crate::backends::BackendClient;

/// Calls `generate`; a failure is reported exactly once and yields `None`.
pub fn run_generation(
    backend: &dyn BackendClient,
    request: &GenerationRequest,
    file_prefix: &str,
    reporter: &ErrorReporter,
) -> Option<PathBuf> {
    info!(
        backend = %backend.id(),
        width = request.width,
        height = request.height,
        steps = request.steps,
        "starting generation"
    );
    settle(backend.generate(request, file_prefix), reporter)
}

pub fn run_upscale(
    backend: &dyn BackendClient,
    request: &UpscaleRequest,
    file_prefix: &str,
    reporter: &ErrorReporter,
) -> Option<PathBuf> {
    info!(backend = %backend.id(), factor = request.factor, "starting upscale");
    settle(backend.upscale(request, file_prefix), reporter)
}

/// Generates on a worker thread. `on_success` runs later on the host thread,
/// when the reporter's queue is drained.
pub fn spawn_generation<F>(
    backend: Arc<dyn BackendClient>,
    request: GenerationRequest,
    file_prefix: String,
    reporter: ErrorReporter,
    on_success: F,
) -> Option<JoinHandle<()>>
where
    F: FnOnce(PathBuf) + Send + 'static,
{
    let worker_reporter = reporter.clone();
    spawn_worker("dreamdeck-generate", reporter, move || {
        let result = run_generation(backend.as_ref(), &request, &file_prefix, &worker_reporter);
        if let Some(path) = result {
            worker_reporter.queue().enqueue(move || on_success(path));
        }
    })
}

pub fn spawn_upscale<F>(
    backend: Arc<dyn BackendClient>,
    request: UpscaleRequest,
    file_prefix: String,
    reporter: ErrorReporter,
    on_success: F,
) -> Option<JoinHandle<()>>
where
    F: FnOnce(PathBuf) + Send + 'static,
{
    let worker_reporter = reporter.clone();
    spawn_worker("dreamdeck-upscale", reporter, move || {
        let result = run_upscale(backend.as_ref(), &request, &file_prefix, &worker_reporter);
        if let Some(path) = result {
            worker_reporter.queue().enqueue(move || on_success(path));
        }
    })
}

fn settle(result: GenerationResult, reporter: &ErrorReporter) -> Option<PathBuf> {
    match result {
        Ok(path) => {
            debug!(path = %path.display(), "backend call succeeded");
            Some(path)
        }
        Err(err) => {
            reporter.report_error(err);
            None
        }
    }
}

fn spawn_worker<F>(name: &str, reporter: ErrorReporter, job: F) -> Option<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.to_string()).spawn(job) {
        Ok(handle) => Some(handle),
        Err(err) => {
            reporter.report_error(GenerationError::generic(format!(
                "Couldn't start a background worker: {err}"
            )));
            None
        }
    }
}
