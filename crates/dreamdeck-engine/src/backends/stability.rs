use dreamdeck_contracts::{
    BackendCapabilities, BackendId, ErrorKey, GenerationError, GenerationRequest,
    GenerationResult, Sampler,
};
use serde_json::Value;
use tracing::info;

use super::{BackendClient, ClientContext};
use crate::classify::{self, pattern, ErrorPattern};
use crate::mapper::{self, WireParams};
use crate::output;
use crate::transport::{MultipartField, WireRequest};

const ERROR_PATTERNS: &[ErrorPattern] = &[
    pattern(
        "missing authorization header",
        ErrorKey::ApiKey,
        "Your Stability API key is missing. Add it in the backend settings.",
    ),
    pattern(
        "incorrect api key",
        ErrorKey::ApiKey,
        "Your Stability API key is incorrect. Check it in the backend settings.",
    ),
    pattern(
        "unauthorized",
        ErrorKey::ApiKey,
        "Stability rejected your API key. Check it in the backend settings.",
    ),
    pattern(
        "not have enough balance",
        ErrorKey::InsufficientCredits,
        "Your Stability account doesn't have enough credits left for this image.",
    ),
    pattern(
        "insufficient_balance",
        ErrorKey::InsufficientCredits,
        "Your Stability account doesn't have enough credits left for this image.",
    ),
    pattern(
        "invalid_prompts",
        ErrorKey::ContentFiltered,
        "Stability's content filter rejected the prompt. Try rewording it.",
    ),
    pattern(
        "content moderation",
        ErrorKey::ContentFiltered,
        "Stability's content filter rejected the request.",
    ),
    pattern(
        "dimensions",
        ErrorKey::InvalidDimensions,
        "Stability rejected the image size. Use dimensions that are multiples of 64 within the supported range.",
    ),
    pattern(
        "sampler",
        ErrorKey::Sampler,
        "Stability rejected the sampler. Pick a different one.",
    ),
    pattern(
        "seed",
        ErrorKey::Seed,
        "Stability rejected the seed. Use a number between 0 and 4294967295.",
    ),
    pattern(
        "steps",
        ErrorKey::Steps,
        "Stability rejected the number of steps. Use between 10 and 50.",
    ),
    pattern(
        "image_strength",
        ErrorKey::PromptStrength,
        "Stability rejected the image similarity. Use a value between 0 and 1.",
    ),
    pattern(
        "text_prompts",
        ErrorKey::Prompt,
        "Stability rejected the prompt. Make sure it isn't empty or too long.",
    ),
];

pub fn capabilities() -> BackendCapabilities {
    BackendCapabilities {
        backend: BackendId::Stability,
        default_sampler: Sampler::DpmPp2m,
        samplers: vec![
            Sampler::Euler,
            Sampler::EulerAncestral,
            Sampler::Heun,
            Sampler::Dpm2,
            Sampler::Dpm2Ancestral,
            Sampler::Lms,
            Sampler::DpmPp2sAncestral,
            Sampler::DpmPp2m,
            Sampler::Ddim,
        ],
        min_image_size: 320 * 320,
        max_image_size: 1536 * 1536,
        max_steps: 50,
        supports_negative_prompts: true,
        supports_model_choice: true,
        supports_upscaling: false,
        supports_inpainting: false,
        requires_api_key: true,
        output_extension: "png",
    }
}

/// Stability AI REST v1. Synchronous: the image comes back in the response.
pub struct StabilityClient {
    ctx: ClientContext,
}

impl StabilityClient {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    fn engine(&self) -> &str {
        self.ctx.settings.model().unwrap_or("stable-diffusion-v1-6")
    }

    fn api_key(&self) -> Result<&str, GenerationError> {
        self.ctx.settings.api_key().ok_or_else(|| {
            GenerationError::new(
                "Please add your Stability AI API key in the backend settings.",
                ErrorKey::ApiKey,
            )
        })
    }

    /// Finds the first artifact in a JSON body. Stability flags filtered
    /// artifacts instead of failing the request.
    fn decode_json_artifact(&self, payload: &Value) -> Result<Vec<u8>, GenerationError> {
        let artifact = payload
            .get("artifacts")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(Value::as_object);
        let Some(artifact) = artifact else {
            return Err(classify::unexpected_response(
                BackendId::Stability,
                "no artifacts",
                payload.to_string().as_bytes(),
            ));
        };
        if artifact.get("finishReason").and_then(Value::as_str) == Some("CONTENT_FILTERED") {
            return Err(GenerationError::new(
                "Stability's content filter blocked the generated image. Try a different prompt or seed.",
                ErrorKey::ContentFiltered,
            ));
        }
        artifact
            .get("base64")
            .and_then(Value::as_str)
            .and_then(output::decode_base64_image)
            .ok_or_else(|| {
                classify::unexpected_response(
                    BackendId::Stability,
                    "artifact without image data",
                    payload.to_string().as_bytes(),
                )
            })
    }
}

impl BackendClient for StabilityClient {
    fn id(&self) -> BackendId {
        BackendId::Stability
    }

    fn capabilities(&self) -> BackendCapabilities {
        capabilities()
    }

    fn has_credentials(&self) -> bool {
        self.ctx.settings.api_key().is_some()
    }

    fn generate(&self, request: &GenerationRequest, file_prefix: &str) -> GenerationResult {
        self.validate(request)?;
        let WireParams::Stability(params) = mapper::map(request, BackendId::Stability)? else {
            return Err(GenerationError::generic("Stability parameters could not be built."));
        };
        let api_key = self.api_key()?;
        let init_image = self.ctx.read_source(&request.source_image)?;

        let mut fields = params.form_fields();
        fields.push(MultipartField::File {
            name: "init_image".to_string(),
            file_name: "init_image.png".to_string(),
            mime: "image/png".to_string(),
            bytes: init_image,
        });
        let endpoint = self
            .ctx
            .url(&format!("v1/generation/{}/image-to-image", self.engine()));
        info!(backend = "stability", endpoint = %endpoint, "submitting image-to-image request");
        let response = self.ctx.send_ok(
            WireRequest::post_multipart(&endpoint, fields)
                .bearer(api_key)
                .header("Accept", "image/png")
                .timeout(self.ctx.settings.timeout()),
            ERROR_PATTERNS,
        )?;

        let bytes = if response.is_image() {
            response.body
        } else {
            let payload = response.json().map_err(|_| {
                classify::unexpected_response(BackendId::Stability, "not JSON", &response.body)
            })?;
            self.decode_json_artifact(&payload)?
        };
        self.ctx.write_image(file_prefix, "png", &bytes)
    }

    fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        let api_key = self.api_key()?;
        let response = self.ctx.send_ok(
            WireRequest::get(self.ctx.url("v1/engines/list"))
                .bearer(api_key)
                .timeout(self.ctx.settings.timeout()),
            ERROR_PATTERNS,
        )?;
        let payload = response.json().map_err(|_| {
            classify::unexpected_response(BackendId::Stability, "engine list", &response.body)
        })?;
        let Some(rows) = payload.as_array() else {
            return Err(classify::unexpected_response(
                BackendId::Stability,
                "engine list",
                &response.body,
            ));
        };
        Ok(rows
            .iter()
            .filter(|row| {
                row.get("type")
                    .and_then(Value::as_str)
                    .map(|kind| kind.eq_ignore_ascii_case("PICTURE"))
                    .unwrap_or(true)
            })
            .filter_map(|row| row.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use base64::Engine as _;
    use dreamdeck_contracts::{
        BackendId, BackendSettings, ErrorKey, GenerationRequest, Sampler, Seed,
    };
    use serde_json::json;

    use super::StabilityClient;
    use crate::backends::{BackendClient, ClientContext};
    use crate::output::decode_base64_image;
    use crate::transport::testing::{bytes, json as json_reply, png_bytes, text, ScriptedTransport};
    use crate::transport::{Method, TransportError};

    fn client(transport: Arc<ScriptedTransport>, dir: &Path, api_key: &str) -> StabilityClient {
        let mut settings = BackendSettings::defaults_for(BackendId::Stability);
        settings.base_url = "https://stability.test".to_string();
        settings.api_key = api_key.to_string();
        StabilityClient::new(ClientContext {
            backend: BackendId::Stability,
            settings,
            transport,
            output_dir: dir.to_path_buf(),
            self_hosted: false,
        })
    }

    fn request(dir: &Path) -> anyhow::Result<GenerationRequest> {
        let source = dir.join("source.png");
        fs::write(&source, png_bytes())?;
        let mut request = GenerationRequest::new("a castle", source);
        request.width = 512;
        request.height = 512;
        request.similarity = 0.15;
        request.seed = Seed::Fixed(42);
        request.sampler = Sampler::Lms;
        request.steps = 25;
        Ok(request)
    }

    #[test]
    fn generate_writes_raw_png_body() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new().on(
            Method::Post,
            "/v1/generation/stable-diffusion-v1-6/image-to-image",
            vec![bytes(200, "image/png", png_bytes())],
        ));
        let client = client(transport.clone(), temp.path(), "sk-test");

        let path = client.generate(&request(temp.path())?, "stability-")?;
        assert_eq!(fs::read(&path)?, png_bytes());
        assert!(path.extension().is_some_and(|ext| ext == "png"));

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.header_value("Authorization"), Some("Bearer sk-test"));
        assert_eq!(call.header_value("Accept"), Some("image/png"));
        assert_eq!(call.multipart_text("image_strength"), Some("0.15"));
        assert_eq!(call.multipart_text("sampler"), Some("K_LMS"));
        assert_eq!(call.multipart_text("seed"), Some("42"));
        assert_eq!(call.multipart_text("init_image_mode"), Some("IMAGE_STRENGTH"));
        Ok(())
    }

    #[test]
    fn generate_decodes_json_artifacts() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes());
        let transport = Arc::new(ScriptedTransport::new().on(
            Method::Post,
            "image-to-image",
            vec![json_reply(
                200,
                json!({"artifacts": [{"base64": encoded, "finishReason": "SUCCESS", "seed": 42}]}),
            )],
        ));
        let client = client(transport, temp.path(), "sk-test");

        let path = client.generate(&request(temp.path())?, "stability-")?;
        assert_eq!(Some(fs::read(&path)?), decode_base64_image(&encoded));
        Ok(())
    }

    #[test]
    fn filtered_artifact_is_content_filtered() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new().on(
            Method::Post,
            "image-to-image",
            vec![json_reply(
                200,
                json!({"artifacts": [{"base64": "", "finishReason": "CONTENT_FILTERED"}]}),
            )],
        ));
        let client = client(transport, temp.path(), "sk-test");
        let err = client
            .generate(&request(temp.path())?, "stability-")
            .expect_err("filtered");
        assert!(err.is(ErrorKey::ContentFiltered));
        Ok(())
    }

    #[test]
    fn oversized_request_is_rejected_without_network() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        let client = client(transport.clone(), temp.path(), "sk-test");
        let mut request = request(temp.path())?;
        request.width = 2048;
        request.height = 2048;

        let err = client.generate(&request, "stability-").expect_err("too large");
        assert!(err.is(ErrorKey::InvalidDimensions));
        assert!(transport.calls().is_empty());
        Ok(())
    }

    #[test]
    fn missing_api_key_is_rejected_without_network() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new());
        let client = client(transport.clone(), temp.path(), "  ");

        let err = client
            .generate(&request(temp.path())?, "stability-")
            .expect_err("no key");
        assert!(err.is(ErrorKey::ApiKey));
        assert!(transport.calls().is_empty());
        Ok(())
    }

    #[test]
    fn server_errors_map_to_stable_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new().on(
            Method::Post,
            "image-to-image",
            vec![
                json_reply(401, json!({"name": "unauthorized", "message": "Incorrect API key provided"})),
                json_reply(402, json!({"name": "insufficient_balance", "message": "You do not have enough balance"})),
                text(404, "Not Found"),
                json_reply(500, json!({"name": "server_error", "message": "something odd"})),
            ],
        ));
        let client = client(transport, temp.path(), "sk-test");
        let request = request(temp.path())?;

        let keys = (0..4)
            .map(|_| client.generate(&request, "stability-").map(|_| ()).unwrap_err().key)
            .collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                Some(ErrorKey::ApiKey),
                Some(ErrorKey::InsufficientCredits),
                Some(ErrorKey::ServiceMissing),
                Some(ErrorKey::UnknownErrorResponse),
            ]
        );
        Ok(())
    }

    #[test]
    fn read_timeout_becomes_timeout_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new().on(
            Method::Post,
            "image-to-image",
            vec![Err(TransportError::Timeout)],
        ));
        let client = client(transport, temp.path(), "sk-test");
        let err = client
            .generate(&request(temp.path())?, "stability-")
            .expect_err("timeout");
        assert!(err.is(ErrorKey::Timeout));
        Ok(())
    }

    #[test]
    fn html_body_is_unexpected_response() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new().on(
            Method::Post,
            "image-to-image",
            vec![bytes(200, "text/html", b"<html>maintenance</html>".to_vec())],
        ));
        let client = client(transport, temp.path(), "sk-test");
        let err = client
            .generate(&request(temp.path())?, "stability-")
            .expect_err("html");
        assert!(err.is(ErrorKey::UnexpectedResponse));
        assert_eq!(fs::read_dir(temp.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn list_models_keeps_picture_engines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new().on(
            Method::Get,
            "/v1/engines/list",
            vec![json_reply(
                200,
                json!([
                    {"id": "stable-diffusion-v1-6", "type": "PICTURE"},
                    {"id": "esrgan-v1-x2plus", "type": "PICTURE"},
                    {"id": "gpt-thing", "type": "TEXT"}
                ]),
            )],
        ));
        let client = client(transport, temp.path(), "sk-test");
        assert_eq!(
            client.list_models()?,
            vec!["stable-diffusion-v1-6".to_string(), "esrgan-v1-x2plus".to_string()]
        );
        Ok(())
    }
}
