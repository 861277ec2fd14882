use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dreamdeck_contracts::{
    BackendCapabilities, BackendId, ErrorKey, GenerationError, GenerationRequest,
    GenerationResult, Sampler,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{BackendClient, ClientContext};
use crate::classify::{self, pattern, ErrorPattern};
use crate::mapper::{self, WireParams};
use crate::output;
use crate::transport::{TransportError, WireRequest};

const ANONYMOUS_API_KEY: &str = "0000000000";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MIN_CHECK_TIMEOUT: Duration = Duration::from_millis(50);

const ERROR_PATTERNS: &[ErrorPattern] = &[
    pattern(
        "no user matching sent api key",
        ErrorKey::ApiKey,
        "Stable Horde doesn't recognize your API key. Check it in the backend settings, or leave it empty to generate anonymously.",
    ),
    pattern(
        "invalid api key",
        ErrorKey::ApiKey,
        "Stable Horde rejected your API key. Check it in the backend settings.",
    ),
    pattern(
        "kudos",
        ErrorKey::InsufficientCredits,
        "You don't have enough Stable Horde kudos for this request. Try a smaller image, fewer steps, or a registered API key.",
    ),
    pattern(
        "corrupt",
        ErrorKey::ContentFiltered,
        "Stable Horde's content filter rejected the prompt.",
    ),
    pattern(
        "nsfw",
        ErrorKey::ContentFiltered,
        "Stable Horde's content filter rejected the request.",
    ),
    pattern(
        "resolution",
        ErrorKey::InvalidDimensions,
        "Stable Horde rejected the image size.",
    ),
    pattern(
        "width",
        ErrorKey::InvalidDimensions,
        "Stable Horde rejected the image width. Use a multiple of 64.",
    ),
    pattern(
        "height",
        ErrorKey::InvalidDimensions,
        "Stable Horde rejected the image height. Use a multiple of 64.",
    ),
    pattern(
        "sampler",
        ErrorKey::Sampler,
        "Stable Horde rejected the sampler. Pick a different one.",
    ),
    pattern(
        "steps",
        ErrorKey::Steps,
        "Stable Horde rejected the number of steps.",
    ),
    pattern(
        "denoising_strength",
        ErrorKey::PromptStrength,
        "Stable Horde rejected the image similarity value.",
    ),
];

pub fn capabilities() -> BackendCapabilities {
    BackendCapabilities {
        backend: BackendId::StableHorde,
        default_sampler: Sampler::EulerAncestral,
        samplers: Sampler::ALL
            .iter()
            .copied()
            .filter(|sampler| *sampler != Sampler::Plms)
            .collect(),
        min_image_size: 64 * 64,
        max_image_size: 1024 * 1024,
        max_steps: 100,
        supports_negative_prompts: true,
        supports_model_choice: true,
        supports_upscaling: false,
        supports_inpainting: false,
        requires_api_key: false,
        output_extension: "webp",
    }
}

/// What one `check` call said about the job.
#[derive(Debug)]
enum CheckOutcome {
    Pending,
    Done,
    Failed(GenerationError),
    Transient(String),
}

/// Crowd-sourced Stable Horde. Jobs are submitted, then polled until a
/// worker finishes them.
pub struct StableHordeClient {
    ctx: ClientContext,
    poll_interval: Duration,
}

impl StableHordeClient {
    pub fn new(ctx: ClientContext) -> Self {
        Self {
            ctx,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn api_key(&self) -> &str {
        self.ctx.settings.api_key().unwrap_or(ANONYMOUS_API_KEY)
    }

    fn horde_request(&self, request: WireRequest) -> WireRequest {
        request
            .header("apikey", self.api_key())
            .header(
                "Client-Agent",
                format!("dreamdeck:{}:unknown", env!("CARGO_PKG_VERSION")),
            )
            .timeout(self.ctx.settings.timeout())
    }

    fn submit(&self, payload: Value) -> Result<String, GenerationError> {
        let request = self.horde_request(WireRequest::post_json(
            self.ctx.url("api/v2/generate/async"),
            payload,
        ));
        let response = self.ctx.send_ok(request, ERROR_PATTERNS)?;
        let body = response.json().map_err(|_| {
            classify::unexpected_response(BackendId::StableHorde, "submit reply", &response.body)
        })?;
        match body.get("id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => Ok(id.to_string()),
            _ => Err(classify::unexpected_response(
                BackendId::StableHorde,
                "submit reply without a job id",
                &response.body,
            )),
        }
    }

    /// One status poll. `timeout` is what is left of the poll budget.
    fn check(&self, id: &str, timeout: Duration) -> CheckOutcome {
        let request = self
            .horde_request(WireRequest::get(
                self.ctx.url(&format!("api/v2/generate/check/{id}")),
            ))
            .timeout(timeout.max(MIN_CHECK_TIMEOUT));
        let response = match self.ctx.transport.send(request) {
            Ok(response) => response,
            Err(err @ TransportError::InvalidUrl(_)) => {
                return CheckOutcome::Failed(classify::from_transport(
                    BackendId::StableHorde,
                    false,
                    &err,
                ))
            }
            Err(err) => return CheckOutcome::Transient(err.to_string()),
        };
        if response.status == 429 {
            return CheckOutcome::Transient("rate limited (HTTP 429)".to_string());
        }
        if !response.is_success() {
            return CheckOutcome::Failed(classify::from_status(
                BackendId::StableHorde,
                &response,
                ERROR_PATTERNS,
            ));
        }
        let Ok(body) = response.json() else {
            return CheckOutcome::Transient("undecodable check reply".to_string());
        };
        interpret_check(&body)
    }

    /// Polls until the job is done, failed, or the budget runs out.
    fn wait_for_job(&self, id: &str) -> Result<(), GenerationError> {
        let budget = self.ctx.settings.timeout();
        let started = Instant::now();
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            let remaining = budget.saturating_sub(started.elapsed());
            match self.check(id, remaining) {
                CheckOutcome::Done => {
                    debug!(backend = "stablehorde", job = id, attempts, "job done");
                    return Ok(());
                }
                CheckOutcome::Failed(err) => {
                    warn!(backend = "stablehorde", job = id, attempts, error = %err, "job failed");
                    return Err(err);
                }
                CheckOutcome::Transient(reason) => {
                    warn!(
                        backend = "stablehorde",
                        job = id,
                        attempts,
                        reason = %reason,
                        "transient poll error"
                    );
                }
                CheckOutcome::Pending => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= budget {
                warn!(backend = "stablehorde", job = id, attempts, "job timed out");
                return Err(GenerationError::new(
                    format!(
                        "Stable Horde didn't finish the image within {:.1} seconds. The horde may be busy; try again later or raise the timeout.",
                        budget.as_secs_f64()
                    ),
                    ErrorKey::Timeout,
                ));
            }
            thread::sleep(self.poll_interval.min(budget - elapsed));
        }
    }

    fn fetch_image(&self, id: &str) -> Result<Vec<u8>, GenerationError> {
        let request = self.horde_request(WireRequest::get(
            self.ctx.url(&format!("api/v2/generate/status/{id}")),
        ));
        let response = self.ctx.send_ok(request, ERROR_PATTERNS)?;
        let body = response.json().map_err(|_| {
            classify::unexpected_response(BackendId::StableHorde, "status reply", &response.body)
        })?;
        if body.get("faulted").and_then(Value::as_bool) == Some(true) {
            return Err(job_faulted());
        }
        let Some(generation) = body
            .get("generations")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
        else {
            return Err(classify::unexpected_response(
                BackendId::StableHorde,
                "status reply without generations",
                &response.body,
            ));
        };
        if generation.get("censored").and_then(Value::as_bool) == Some(true) {
            return Err(GenerationError::new(
                "Stable Horde's content filter blocked the generated image. Try a different prompt or seed.",
                ErrorKey::ContentFiltered,
            ));
        }
        let Some(img) = generation.get("img").and_then(Value::as_str) else {
            return Err(classify::unexpected_response(
                BackendId::StableHorde,
                "generation without an image",
                &response.body,
            ));
        };
        if img.starts_with("http://") || img.starts_with("https://") {
            return self.download(img);
        }
        output::decode_base64_image(img).ok_or_else(|| {
            classify::unexpected_response(
                BackendId::StableHorde,
                "undecodable image data",
                &response.body,
            )
        })
    }

    /// Results stored on R2 come back as a link.
    fn download(&self, url: &str) -> Result<Vec<u8>, GenerationError> {
        debug!(backend = "stablehorde", url, "downloading result");
        let request = WireRequest::get(url).timeout(self.ctx.settings.timeout());
        let response = self.ctx.send_ok(request, &[])?;
        Ok(response.body)
    }
}

fn interpret_check(body: &Value) -> CheckOutcome {
    if body.get("faulted").and_then(Value::as_bool) == Some(true) {
        return CheckOutcome::Failed(job_faulted());
    }
    if body.get("is_possible").and_then(Value::as_bool) == Some(false) {
        return CheckOutcome::Failed(GenerationError::new(
            "No Stable Horde worker can currently fulfil this request. Try a different model, a smaller size, or fewer steps.",
            ErrorKey::UnknownErrorResponse,
        ));
    }
    match body.get("done").and_then(Value::as_bool) {
        Some(true) => CheckOutcome::Done,
        Some(false) => {
            let queue_position = body.get("queue_position").and_then(Value::as_i64);
            let wait_time = body.get("wait_time").and_then(Value::as_i64);
            debug!(backend = "stablehorde", queue_position, wait_time, "job pending");
            CheckOutcome::Pending
        }
        None => CheckOutcome::Transient("check reply without 'done'".to_string()),
    }
}

fn job_faulted() -> GenerationError {
    GenerationError::new(
        "The Stable Horde worker failed while generating the image. Please try again.",
        ErrorKey::UnknownErrorResponse,
    )
}

impl BackendClient for StableHordeClient {
    fn id(&self) -> BackendId {
        BackendId::StableHorde
    }

    fn capabilities(&self) -> BackendCapabilities {
        capabilities()
    }

    fn generate(&self, request: &GenerationRequest, file_prefix: &str) -> GenerationResult {
        self.validate(request)?;
        let WireParams::StableHorde(params) = mapper::map(request, BackendId::StableHorde)? else {
            return Err(GenerationError::generic(
                "Stable Horde parameters could not be built.",
            ));
        };
        let source = self.ctx.read_source(&request.source_image)?;

        let mut payload = serde_json::to_value(&params).map_err(|err| {
            GenerationError::generic(format!("Couldn't encode the request: {err}"))
        })?;
        if let Some(object) = payload.as_object_mut() {
            object.insert("source_image".to_string(), json!(BASE64.encode(source)));
            if let Some(model) = self.ctx.settings.model() {
                object.insert("models".to_string(), json!([model]));
            }
        }

        let id = self.submit(payload)?;
        info!(backend = "stablehorde", job = %id, "job submitted");
        self.wait_for_job(&id)?;
        let bytes = self.fetch_image(&id)?;
        self.ctx.write_image(file_prefix, "webp", &bytes)
    }

    fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        let request = self.horde_request(WireRequest::get(
            self.ctx.url("api/v2/status/models?type=image"),
        ));
        let response = self.ctx.send_ok(request, ERROR_PATTERNS)?;
        let payload = response.json().map_err(|_| {
            classify::unexpected_response(BackendId::StableHorde, "model list", &response.body)
        })?;
        let Some(rows) = payload.as_array() else {
            return Err(classify::unexpected_response(
                BackendId::StableHorde,
                "model list",
                &response.body,
            ));
        };
        // Models without workers can't serve anything right now.
        Ok(rows
            .iter()
            .filter(|row| row.get("count").and_then(Value::as_u64).unwrap_or(1) > 0)
            .filter_map(|row| row.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}
