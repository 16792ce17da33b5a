use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config;

use super::models::{
    GenerationInput, GenerationParameters, GenerationRequest, GenerationType, InputImage,
};
use super::retry::Retryable;

/// key: backend-failure-taxonomy
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    InvalidAuth,
    RateLimited,
    SafetyRejected,
    Timeout,
    UpstreamError,
    InvalidInput,
}

impl BackendErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendErrorKind::InvalidAuth => "invalid_auth",
            BackendErrorKind::RateLimited => "rate_limited",
            BackendErrorKind::SafetyRejected => "safety_rejected",
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::UpstreamError => "upstream_error",
            BackendErrorKind::InvalidInput => "invalid_input",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendErrorKind::RateLimited
                | BackendErrorKind::Timeout
                | BackendErrorKind::UpstreamError
        )
    }
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    pub status: Option<u16>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BackendRequest {
    pub generation_type: GenerationType,
    pub prompt: String,
    pub parameters: GenerationParameters,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input_images: Vec<InputImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl BackendRequest {
    pub fn from_request(request: &GenerationRequest) -> Self {
        let (strength, instructions) = match &request.input {
            GenerationInput::ImageToImage { strength, .. } => (Some(*strength), None),
            GenerationInput::Refine { instructions, .. } => (None, instructions.clone()),
            _ => (None, None),
        };
        Self {
            generation_type: request.generation_type(),
            prompt: request.prompt.trim().to_string(),
            parameters: request.parameters.clone(),
            input_images: request.input.references(),
            strength,
            instructions,
        }
    }
}

/// Image as returned by the backend, before post-processing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawImage {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BackendResponse {
    pub images: Vec<RawImage>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub usage: Value,
}

/// key: generation-backend -> external image model
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError>;
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorPayload,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Maps an HTTP failure from the backend onto the failure taxonomy. A body-level `code`
/// wins over the status when it names a known kind.
pub fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let payload = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|envelope| envelope.error);
    let code = payload.as_ref().and_then(|payload| payload.code.clone());
    let message = payload
        .and_then(|payload| payload.message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status.to_string()
            } else {
                trimmed.chars().take(512).collect()
            }
        });

    let from_code = code.as_deref().and_then(|code| match code {
        "safety_rejected" | "content_policy_violation" => Some(BackendErrorKind::SafetyRejected),
        "invalid_auth" => Some(BackendErrorKind::InvalidAuth),
        "rate_limited" => Some(BackendErrorKind::RateLimited),
        "invalid_input" => Some(BackendErrorKind::InvalidInput),
        "timeout" => Some(BackendErrorKind::Timeout),
        _ => None,
    });

    let kind = from_code.unwrap_or(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendErrorKind::InvalidAuth,
        StatusCode::TOO_MANY_REQUESTS => BackendErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendErrorKind::Timeout,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            BackendErrorKind::InvalidInput
        }
        _ => BackendErrorKind::UpstreamError,
    });

    BackendError::new(kind, message).with_status(status.as_u16())
}

/// key: generation-backend-http -> reqwest client
pub struct HttpGenerationBackend {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpGenerationBackend {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .with_context(|| format!("invalid generation backend url `{base_url}`"))?
            .join("v1/generations")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build generation backend client")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = config::GENERATION_BACKEND_URL
            .as_deref()
            .ok_or_else(|| anyhow!("GENERATION_BACKEND_URL must be set"))?;
        Self::new(
            base_url,
            config::GENERATION_BACKEND_API_KEY.clone(),
            Duration::from_secs(*config::GENERATION_BACKEND_TIMEOUT_SECS),
        )
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let mut builder = self.client.post(self.endpoint.clone()).json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                BackendError::new(BackendErrorKind::Timeout, err.to_string())
            } else {
                BackendError::new(BackendErrorKind::UpstreamError, err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = classify_status(status, &body);
            tracing::debug!(
                target: "generation.backend",
                status = status.as_u16(),
                kind = %error.kind,
                "backend returned error status"
            );
            return Err(error);
        }

        response.json::<BackendResponse>().await.map_err(|err| {
            if err.is_timeout() {
                BackendError::new(BackendErrorKind::Timeout, err.to_string())
            } else {
                BackendError::new(
                    BackendErrorKind::UpstreamError,
                    format!("malformed backend response: {err}"),
                )
                .with_status(status.as_u16())
            }
        })
    }
}
