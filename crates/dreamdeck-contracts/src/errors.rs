use std::fmt;
use std::path::PathBuf;

/// Outcome of one generation or upscale call.
pub type GenerationResult = Result<PathBuf, GenerationError>;

/// Stable, backend-independent failure categories.
///
/// The string form is what hosts match on, so it must never change for an
/// existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKey {
    ApiKey,
    InvalidDimensions,
    Sampler,
    Steps,
    Seed,
    Prompt,
    PromptStrength,
    InsufficientCredits,
    ContentFiltered,
    Timeout,
    LocalServerNotFound,
    NetworkError,
    InvalidUrl,
    ServiceMissing,
    UnexpectedResponse,
    UnknownError,
    UnknownErrorResponse,
    BackendConfig,
    Unsupported,
}

/// Request fields a host UI can highlight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HighlightField {
    ApiKey,
    Dimensions,
    Sampler,
    Steps,
    Seed,
    Prompt,
    PromptStrength,
}

impl ErrorKey {
    pub const ALL: [ErrorKey; 19] = [
        ErrorKey::ApiKey,
        ErrorKey::InvalidDimensions,
        ErrorKey::Sampler,
        ErrorKey::Steps,
        ErrorKey::Seed,
        ErrorKey::Prompt,
        ErrorKey::PromptStrength,
        ErrorKey::InsufficientCredits,
        ErrorKey::ContentFiltered,
        ErrorKey::Timeout,
        ErrorKey::LocalServerNotFound,
        ErrorKey::NetworkError,
        ErrorKey::InvalidUrl,
        ErrorKey::ServiceMissing,
        ErrorKey::UnexpectedResponse,
        ErrorKey::UnknownError,
        ErrorKey::UnknownErrorResponse,
        ErrorKey::BackendConfig,
        ErrorKey::Unsupported,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKey::ApiKey => "api_key",
            ErrorKey::InvalidDimensions => "invalid_dimensions",
            ErrorKey::Sampler => "sampler",
            ErrorKey::Steps => "steps",
            ErrorKey::Seed => "seed",
            ErrorKey::Prompt => "prompt",
            ErrorKey::PromptStrength => "prompt_strength",
            ErrorKey::InsufficientCredits => "insufficient_credits",
            ErrorKey::ContentFiltered => "content_filtered",
            ErrorKey::Timeout => "timeout",
            ErrorKey::LocalServerNotFound => "local_server_not_found",
            ErrorKey::NetworkError => "network_error",
            ErrorKey::InvalidUrl => "invalid_url",
            ErrorKey::ServiceMissing => "service_missing",
            ErrorKey::UnexpectedResponse => "unexpected_response",
            ErrorKey::UnknownError => "unknown_error",
            ErrorKey::UnknownErrorResponse => "unknown_error_response",
            ErrorKey::BackendConfig => "backend_config",
            ErrorKey::Unsupported => "unsupported",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let needle = raw.trim();
        Self::ALL.into_iter().find(|key| key.as_str() == needle)
    }

    /// The request field a UI should highlight, if any. Keys without a field
    /// mean "generic failure".
    pub fn field(self) -> Option<HighlightField> {
        match self {
            ErrorKey::ApiKey => Some(HighlightField::ApiKey),
            ErrorKey::InvalidDimensions => Some(HighlightField::Dimensions),
            ErrorKey::Sampler => Some(HighlightField::Sampler),
            ErrorKey::Steps => Some(HighlightField::Steps),
            ErrorKey::Seed => Some(HighlightField::Seed),
            ErrorKey::Prompt | ErrorKey::ContentFiltered => Some(HighlightField::Prompt),
            ErrorKey::PromptStrength => Some(HighlightField::PromptStrength),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure ready to be shown to a user: a human readable message plus an
/// optional machine readable category.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct GenerationError {
    pub message: String,
    pub key: Option<ErrorKey>,
}

impl GenerationError {
    pub fn new(message: impl Into<String>, key: ErrorKey) -> Self {
        Self {
            message: message.into(),
            key: Some(key),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: None,
        }
    }

    /// Key in wire form; empty when the failure has no category.
    pub fn key_str(&self) -> &'static str {
        self.key.map(ErrorKey::as_str).unwrap_or("")
    }

    pub fn is(&self, key: ErrorKey) -> bool {
        self.key == Some(key)
    }

    pub fn field(&self) -> Option<HighlightField> {
        self.key.and_then(ErrorKey::field)
    }
}
