use super::{GenerationBackend, GenerationRequest};
use crate::config::Config;
use crate::error::BackendError;
use crate::util::is_local_endpoint_url;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

const MAX_ERROR_BODY_CHARS: usize = 300;

/// Generation backend reached over HTTP: `POST {prompt, kind}` with the
/// credential as a bearer token, answered with a JSON body naming the media.
#[derive(Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    url: String,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.backend_url.clone(), config.backend_timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<String, BackendError> {
        let response = self
            .http
            .post(&self.url)
            .header("content-type", "application/json")
            .bearer_auth(&request.credential)
            .json(&request)
            .send()
            .await
            .map_err(|error| map_request_error(error, &self.url))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| map_request_error(error, &self.url))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|error| {
            BackendError::Permanent(format!("backend returned malformed JSON: {error}"))
        })?;
        extract_media_ref(&parsed).ok_or_else(|| {
            BackendError::Permanent("backend response did not name any media".to_string())
        })
    }
}

fn map_request_error(error: reqwest::Error, url: &str) -> BackendError {
    if error.is_connect() && is_local_endpoint_url(url) {
        return BackendError::Transient(format!(
            "cannot reach local backend '{url}': {error}. Start the backend or update SCENESYNC_BACKEND_URL."
        ));
    }
    if error.is_connect() {
        return BackendError::Transient(format!("cannot reach backend '{url}': {error}"));
    }
    if error.is_timeout() {
        return BackendError::Transient(format!("backend request to '{url}' timed out"));
    }
    if error.is_body() || error.is_request() {
        return BackendError::Transient(format!("backend request to '{url}' failed: {error}"));
    }
    BackendError::Permanent(format!("backend request to '{url}' failed: {error}"))
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let detail = truncate(body.trim(), MAX_ERROR_BODY_CHARS);
    let message = if detail.is_empty() {
        format!("backend returned HTTP {status}")
    } else {
        format!("backend returned HTTP {status}: {detail}")
    };

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        BackendError::Transient(message)
    } else {
        BackendError::Permanent(message)
    }
}

pub(crate) fn extract_media_ref(body: &Value) -> Option<String> {
    let candidates = [
        body.get("media_ref"),
        body.get("url"),
        body.get("data")
            .and_then(|data| data.get(0))
            .and_then(|first| first.get("url")),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...")
}
