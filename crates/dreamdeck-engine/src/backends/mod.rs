use std::path::{Path, PathBuf};
use std::sync::Arc;

use dreamdeck_contracts::{
    BackendCapabilities, BackendId, BackendSettings, ErrorKey, GenerationError, GenerationRequest,
    GenerationResult, UpscaleRequest,
};
use tracing::debug;

use crate::classify::{self, ErrorPattern};
use crate::output;
use crate::transport::{HttpTransport, WireRequest, WireResponse};

pub mod automatic1111;
pub mod stability;
pub mod stablehorde;

pub use automatic1111::Automatic1111Client;
pub use stability::StabilityClient;
pub use stablehorde::StableHordeClient;

/// One remote image-generation service.
///
/// Implementations never panic on remote input: every failure comes back as
/// a [`GenerationError`].
pub trait BackendClient: Send + Sync {
    fn id(&self) -> BackendId;

    fn capabilities(&self) -> BackendCapabilities;

    fn has_credentials(&self) -> bool {
        true
    }

    /// Request shape and credentials. No I/O.
    fn validate(&self, request: &GenerationRequest) -> Result<(), GenerationError> {
        let capabilities = self.capabilities();
        if capabilities.requires_api_key && !self.has_credentials() {
            return Err(GenerationError::new(
                format!(
                    "Please add your {} API key in the backend settings.",
                    self.id().display_name()
                ),
                ErrorKey::ApiKey,
            ));
        }
        capabilities.validate(request)
    }

    /// Transforms the source image and writes the result as
    /// `<output_dir>/<file_prefix>*.<ext>`.
    fn generate(&self, request: &GenerationRequest, file_prefix: &str) -> GenerationResult;

    /// Models (engines, checkpoints) the service currently offers.
    fn list_models(&self) -> Result<Vec<String>, GenerationError>;

    fn upscale(&self, _request: &UpscaleRequest, _file_prefix: &str) -> GenerationResult {
        Err(GenerationError::new(
            format!("{} does not support upscaling.", self.id().display_name()),
            ErrorKey::Unsupported,
        ))
    }
}

/// Static capabilities of a backend, without constructing a client.
pub fn capabilities_for(backend: BackendId) -> BackendCapabilities {
    match backend {
        BackendId::Stability => stability::capabilities(),
        BackendId::Automatic1111 => automatic1111::capabilities(),
        BackendId::StableHorde => stablehorde::capabilities(),
    }
}

/// What every client needs: its settings, the transport, and where to put
/// results.
#[derive(Clone)]
pub struct ClientContext {
    pub backend: BackendId,
    pub settings: BackendSettings,
    pub transport: Arc<dyn HttpTransport>,
    pub output_dir: PathBuf,
    pub self_hosted: bool,
}

impl ClientContext {
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.api_base(), path.trim_start_matches('/'))
    }

    /// Sends a request; transport failures are classified, HTTP statuses are
    /// left to the caller.
    pub fn send(&self, request: WireRequest) -> Result<WireResponse, GenerationError> {
        let url = request.url.clone();
        self.transport.send(request).map_err(|err| {
            debug!(backend = %self.backend, url = %url, error = %err, "transport failure");
            classify::from_transport(self.backend, self.self_hosted, &err)
        })
    }

    /// Sends a request and classifies any non-success status.
    pub fn send_ok(
        &self,
        request: WireRequest,
        patterns: &[ErrorPattern],
    ) -> Result<WireResponse, GenerationError> {
        let response = self.send(request)?;
        if response.is_success() {
            return Ok(response);
        }
        debug!(
            backend = %self.backend,
            status = response.status,
            body = %classify::truncate_text(&response.text(), 512),
            "request failed"
        );
        Err(classify::from_status(self.backend, &response, patterns))
    }

    pub fn read_source(&self, path: &Path) -> Result<Vec<u8>, GenerationError> {
        output::read_source_image(path)
    }

    /// Writes image bytes after checking they really are an image.
    pub fn write_image(
        &self,
        file_prefix: &str,
        fallback_extension: &str,
        bytes: &[u8],
    ) -> GenerationResult {
        if bytes.is_empty() {
            return Err(classify::unexpected_response(self.backend, "empty image", bytes));
        }
        let Some(extension) = output::sniff_extension(bytes) else {
            return Err(classify::unexpected_response(
                self.backend,
                "image data in an unknown format",
                &bytes[..bytes.len().min(256)],
            ));
        };
        if extension != fallback_extension {
            debug!(
                backend = %self.backend,
                expected = fallback_extension,
                actual = extension,
                "image format differs from the backend default"
            );
        }
        output::write_output(&self.output_dir, file_prefix, extension, bytes)
    }
}
