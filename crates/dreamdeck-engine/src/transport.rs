//! The HTTP seam between backend clients and the network.
//!
//! Clients describe requests as [`WireRequest`] values and receive fully
//! buffered [`WireResponse`]s, so tests can script a service without sockets.

use std::time::Duration;

use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MultipartField {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime: String,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireBody {
    Empty,
    Json(Value),
    Multipart(Vec<MultipartField>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: WireBody,
    pub timeout: Option<Duration>,
}

impl WireRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: WireBody::Empty,
            timeout: None,
        }
    }

    pub fn post_json(url: impl Into<String>, payload: Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: WireBody::Json(payload),
            timeout: None,
        }
    }

    pub fn post_multipart(url: impl Into<String>, fields: Vec<MultipartField>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: WireBody::Multipart(fields),
            timeout: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            WireBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn multipart_text(&self, name: &str) -> Option<&str> {
        let WireBody::Multipart(fields) = &self.body else {
            return None;
        };
        fields.iter().find_map(|field| match field {
            MultipartField::Text { name: key, value } if key == name => Some(value.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|value| value.to_ascii_lowercase().starts_with("image/"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("the request timed out")]
    Timeout,
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("failed reading response body: {0}")]
    Body(String),
    #[error("{0}")]
    Other(String),
}

/// Sends one request and buffers the whole response.
pub trait HttpTransport: Send + Sync {
    fn send(&self, request: WireRequest) -> Result<WireResponse, TransportError>;
}

/// Blocking reqwest transport. Must not be used from the host thread.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    http: HttpClient,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        debug!(method = ?request.method, url = %request.url, "sending request");
        let mut builder = match request.method {
            Method::Get => self.http.get(&request.url),
            Method::Post => self.http.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match request.body {
            WireBody::Empty => builder,
            WireBody::Json(payload) => builder.json(&payload),
            WireBody::Multipart(fields) => builder.multipart(multipart_form(fields)?),
        };

        let response = builder.send().map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Body(err.to_string())
                }
            })?
            .to_vec();
        debug!(status, bytes = body.len(), "received response");
        Ok(WireResponse {
            status,
            content_type,
            body,
        })
    }
}

fn multipart_form(fields: Vec<MultipartField>) -> Result<MultipartForm, TransportError> {
    let mut form = MultipartForm::new();
    for field in fields {
        form = match field {
            MultipartField::Text { name, value } => form.text(name, value),
            MultipartField::File {
                name,
                file_name,
                mime,
                bytes,
            } => {
                let part = MultipartPart::bytes(bytes)
                    .file_name(file_name)
                    .mime_str(&mime)
                    .map_err(|err| TransportError::Other(err.to_string()))?;
                form.part(name, part)
            }
        };
    }
    Ok(form)
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() {
        TransportError::InvalidUrl(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
