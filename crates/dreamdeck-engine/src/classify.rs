//! Normalizes transport failures and non-200 responses into [`GenerationError`].

use dreamdeck_contracts::{BackendId, ErrorKey, GenerationError};
use serde_json::Value;
use tracing::warn;

use crate::transport::{TransportError, WireResponse};

const MAX_SERVER_TEXT_CHARS: usize = 400;

/// One entry of a backend's error-text table. Matching is a case-insensitive
/// substring search over the raw response body.
#[derive(Debug, Clone, Copy)]
pub struct ErrorPattern {
    pub needle: &'static str,
    pub key: ErrorKey,
    pub message: &'static str,
}

pub const fn pattern(needle: &'static str, key: ErrorKey, message: &'static str) -> ErrorPattern {
    ErrorPattern {
        needle,
        key,
        message,
    }
}

pub fn from_transport(
    backend: BackendId,
    self_hosted: bool,
    err: &TransportError,
) -> GenerationError {
    let name = backend.display_name();
    match err {
        TransportError::Timeout => GenerationError::new(
            format!(
                "The request to {name} timed out. Try again, or raise the timeout in the backend settings."
            ),
            ErrorKey::Timeout,
        ),
        TransportError::Connect(detail) if self_hosted => GenerationError::new(
            format!(
                "Couldn't reach the local {name} server. Make sure it is running with its API enabled and that the server URL is correct. ({detail})"
            ),
            ErrorKey::LocalServerNotFound,
        ),
        TransportError::Connect(detail) => GenerationError::new(
            format!("Couldn't connect to {name}. Check your internet connection. ({detail})"),
            ErrorKey::NetworkError,
        ),
        TransportError::InvalidUrl(detail) => GenerationError::new(
            format!("The {name} server URL is not valid: {detail}"),
            ErrorKey::InvalidUrl,
        ),
        TransportError::Body(detail) | TransportError::Other(detail) => GenerationError::new(
            format!("The connection to {name} failed: {detail}"),
            ErrorKey::NetworkError,
        ),
    }
}

/// Classifies a non-success response.
pub fn from_status(
    backend: BackendId,
    response: &WireResponse,
    patterns: &[ErrorPattern],
) -> GenerationError {
    let name = backend.display_name();
    if matches!(response.status, 403 | 404) {
        return service_missing(backend);
    }

    let body = response.text();
    let lowered = body.to_ascii_lowercase();
    if let Some(found) = patterns
        .iter()
        .find(|entry| lowered.contains(&entry.needle.to_ascii_lowercase()))
    {
        return GenerationError::new(found.message, found.key);
    }

    match server_message(&body) {
        Some(message) => GenerationError::new(
            format!(
                "{name} reported an error: {}",
                truncate_text(&message, MAX_SERVER_TEXT_CHARS)
            ),
            ErrorKey::UnknownErrorResponse,
        ),
        None if body.trim().is_empty() => GenerationError::new(
            format!("{name} returned an unknown error (HTTP {}).", response.status),
            ErrorKey::UnknownError,
        ),
        None => GenerationError::new(
            format!(
                "{name} returned an unknown error (HTTP {}): {}",
                response.status,
                truncate_text(body.trim(), MAX_SERVER_TEXT_CHARS)
            ),
            ErrorKey::UnknownError,
        ),
    }
}

/// Same message for every backend, so hosts can treat it as one class.
pub fn service_missing(backend: BackendId) -> GenerationError {
    GenerationError::new(
        format!(
            "It looks like the {} service is missing or unreachable. This may be temporary; please try again later.",
            backend.display_name()
        ),
        ErrorKey::ServiceMissing,
    )
}

/// A 200 response whose body could not be understood. The raw body goes to
/// the log, the user gets a generic message.
pub fn unexpected_response(backend: BackendId, what: &str, body: &[u8]) -> GenerationError {
    let raw = String::from_utf8_lossy(body);
    warn!(
        backend = %backend,
        what,
        body = %truncate_text(&raw, 2048),
        "unexpected response body"
    );
    GenerationError::new(
        format!(
            "{} sent an unexpected response ({what}). See the log for details.",
            backend.display_name()
        ),
        ErrorKey::UnexpectedResponse,
    )
}

/// Human readable error text from a JSON error body, if there is any.
pub fn server_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let object = parsed.as_object()?;
    for field in ["message", "detail", "error", "errors"] {
        let Some(value) = object.get(field) else {
            continue;
        };
        let text = match value {
            Value::String(text) => text.trim().to_string(),
            Value::Null => continue,
            other => other.to_string(),
        };
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
