use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dreamdeck_contracts::{
    BackendCapabilities, BackendId, ErrorKey, GenerationError, GenerationRequest,
    GenerationResult, Sampler, UpscaleRequest,
};
use serde_json::{json, Value};
use tracing::info;

use super::{BackendClient, ClientContext};
use crate::classify::{self, pattern, ErrorPattern};
use crate::mapper::{self, WireParams};
use crate::output;
use crate::transport::{WireRequest, WireResponse};

const ERROR_PATTERNS: &[ErrorPattern] = &[
    pattern(
        "not authenticated",
        ErrorKey::ApiKey,
        "The Automatic1111 server requires API credentials. Enter them as user:password in the API key setting.",
    ),
    pattern(
        "incorrect username or password",
        ErrorKey::ApiKey,
        "The Automatic1111 server rejected your API credentials.",
    ),
    pattern(
        "sampler not found",
        ErrorKey::Sampler,
        "The Automatic1111 server doesn't know this sampler. Pick a different one.",
    ),
    pattern(
        "out of memory",
        ErrorKey::InvalidDimensions,
        "The Automatic1111 server ran out of GPU memory. Try a smaller image size.",
    ),
    pattern(
        "sizes of tensors must match",
        ErrorKey::InvalidDimensions,
        "The Automatic1111 server couldn't handle this image size. Use dimensions that are multiples of 64.",
    ),
    pattern(
        "denoising_strength",
        ErrorKey::PromptStrength,
        "The Automatic1111 server rejected the image similarity value.",
    ),
    pattern(
        "seed",
        ErrorKey::Seed,
        "The Automatic1111 server rejected the seed.",
    ),
    pattern(
        "steps",
        ErrorKey::Steps,
        "The Automatic1111 server rejected the number of steps.",
    ),
];

pub fn capabilities() -> BackendCapabilities {
    BackendCapabilities {
        backend: BackendId::Automatic1111,
        default_sampler: Sampler::DpmPp2m,
        samplers: Sampler::ALL.to_vec(),
        min_image_size: 64 * 64,
        max_image_size: 2048 * 2048,
        max_steps: 150,
        supports_negative_prompts: true,
        supports_model_choice: true,
        supports_upscaling: true,
        supports_inpainting: false,
        requires_api_key: false,
        output_extension: "png",
    }
}

/// Self-hosted Stable Diffusion web UI. Synchronous, base64 JSON payloads.
pub struct Automatic1111Client {
    ctx: ClientContext,
}

impl Automatic1111Client {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    /// `--api-auth user:password` servers take the API key as basic auth.
    fn authorize(&self, request: WireRequest) -> WireRequest {
        match self.ctx.settings.api_key() {
            Some(credentials) => request.header(
                "Authorization",
                format!("Basic {}", BASE64.encode(credentials.as_bytes())),
            ),
            None => request,
        }
    }

    fn post(&self, path: &str, payload: Value) -> Result<WireResponse, GenerationError> {
        let request = WireRequest::post_json(self.ctx.url(path), payload)
            .timeout(self.ctx.settings.timeout());
        self.ctx.send_ok(self.authorize(request), ERROR_PATTERNS)
    }

    fn decode_image_field(
        &self,
        response: &WireResponse,
        field: &str,
    ) -> Result<Vec<u8>, GenerationError> {
        let payload = response.json().map_err(|_| {
            classify::unexpected_response(BackendId::Automatic1111, "not JSON", &response.body)
        })?;
        let encoded = match payload.get(field) {
            Some(Value::Array(rows)) => rows.first().and_then(Value::as_str),
            Some(Value::String(value)) => Some(value.as_str()),
            _ => None,
        };
        encoded
            .and_then(output::decode_base64_image)
            .ok_or_else(|| {
                classify::unexpected_response(
                    BackendId::Automatic1111,
                    &format!("missing '{field}'"),
                    &response.body,
                )
            })
    }
}

impl BackendClient for Automatic1111Client {
    fn id(&self) -> BackendId {
        BackendId::Automatic1111
    }

    fn capabilities(&self) -> BackendCapabilities {
        capabilities()
    }

    fn generate(&self, request: &GenerationRequest, file_prefix: &str) -> GenerationResult {
        self.validate(request)?;
        let WireParams::Automatic1111(params) = mapper::map(request, BackendId::Automatic1111)?
        else {
            return Err(GenerationError::generic(
                "Automatic1111 parameters could not be built.",
            ));
        };
        let init_image = self.ctx.read_source(&request.source_image)?;

        let mut payload = serde_json::to_value(&params).map_err(|err| {
            GenerationError::generic(format!("Couldn't encode the request: {err}"))
        })?;
        if let Some(object) = payload.as_object_mut() {
            object.insert(
                "init_images".to_string(),
                json!([BASE64.encode(init_image)]),
            );
            if let Some(model) = self.ctx.settings.model() {
                object.insert(
                    "override_settings".to_string(),
                    json!({ "sd_model_checkpoint": model }),
                );
            }
        }

        info!(
            backend = "automatic1111",
            base = %self.ctx.settings.api_base(),
            "submitting img2img request"
        );
        let response = self.post("sdapi/v1/img2img", payload)?;
        let bytes = self.decode_image_field(&response, "images")?;
        self.ctx.write_image(file_prefix, "png", &bytes)
    }

    fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        let request = WireRequest::get(self.ctx.url("sdapi/v1/sd-models"))
            .timeout(self.ctx.settings.timeout());
        let response = self.ctx.send_ok(self.authorize(request), ERROR_PATTERNS)?;
        let payload = response.json().map_err(|_| {
            classify::unexpected_response(BackendId::Automatic1111, "model list", &response.body)
        })?;
        let Some(rows) = payload.as_array() else {
            return Err(classify::unexpected_response(
                BackendId::Automatic1111,
                "model list",
                &response.body,
            ));
        };
        Ok(rows
            .iter()
            .filter_map(|row| {
                row.get("title")
                    .or_else(|| row.get("model_name"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string)
            .collect())
    }

    fn upscale(&self, request: &UpscaleRequest, file_prefix: &str) -> GenerationResult {
        if !request.factor.is_finite() || !(1.0..=8.0).contains(&request.factor) {
            return Err(GenerationError::generic(
                "The upscale factor must be between 1 and 8.",
            ));
        }
        let image = self.ctx.read_source(&request.source_image)?;
        let upscaler = Some(request.upscaler.trim())
            .filter(|value| !value.is_empty())
            .unwrap_or("ESRGAN_4x");
        let payload = json!({
            "image": BASE64.encode(image),
            "resize_mode": 0,
            "upscaling_resize": request.factor,
            "upscaler_1": upscaler,
        });
        info!(
            backend = "automatic1111",
            factor = request.factor,
            upscaler,
            "submitting upscale request"
        );
        let response = self.post("sdapi/v1/extra-single-image", payload)?;
        let bytes = self.decode_image_field(&response, "image")?;
        self.ctx.write_image(file_prefix, "png", &bytes)
    }
}
