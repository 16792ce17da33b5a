use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Longest prompt accepted by the orchestrator, in characters.
pub const MAX_PROMPT_LENGTH: usize = 2000;

/// key: generation-type -> lifecycle discriminant
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationType {
    TextToImage,
    ImageToImage,
    MultiImage,
    Refine,
}

impl GenerationType {
    pub const ALL: [GenerationType; 4] = [
        GenerationType::TextToImage,
        GenerationType::ImageToImage,
        GenerationType::MultiImage,
        GenerationType::Refine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationType::TextToImage => "text-to-image",
            GenerationType::ImageToImage => "image-to-image",
            GenerationType::MultiImage => "multi-image",
            GenerationType::Refine => "refine",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text-to-image" => Some(GenerationType::TextToImage),
            "image-to-image" => Some(GenerationType::ImageToImage),
            "multi-image" => Some(GenerationType::MultiImage),
            "refine" => Some(GenerationType::Refine),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Standard,
    Hd,
    Ultra,
}

impl Quality {
    pub const ALL: [Quality; 3] = [Quality::Standard, Quality::Hd, Quality::Ultra];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Standard => "standard",
            Quality::Hd => "hd",
            Quality::Ultra => "ultra",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "9:16")]
    Tall,
    #[serde(rename = "16:9")]
    Wide,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        AspectRatio::Square,
        AspectRatio::Portrait,
        AspectRatio::Landscape,
        AspectRatio::Tall,
        AspectRatio::Wide,
    ];
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    Natural,
    Sketch,
    Vivid,
    Anime,
    Photorealistic,
    Artistic,
}

impl Style {
    pub const ALL: [Style; 6] = [
        Style::Natural,
        Style::Sketch,
        Style::Vivid,
        Style::Anime,
        Style::Photorealistic,
        Style::Artistic,
    ];
}

/// Tunables shared by every generation type.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationParameters {
    pub quality: Quality,
    pub aspect_ratio: AspectRatio,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<Style>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<f32>,
    pub batch_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Custom model identifier; only honoured for tiers that allow custom models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            quality: Quality::Standard,
            aspect_ratio: AspectRatio::Square,
            style: None,
            seed: None,
            steps: None,
            guidance: None,
            batch_size: 1,
            negative_prompt: None,
            model: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl InputImage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mime_type: None,
        }
    }
}

fn default_strength() -> f32 {
    0.6
}

/// key: generation-input -> per-type payload
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GenerationInput {
    TextToImage,
    ImageToImage {
        source: InputImage,
        #[serde(default = "default_strength")]
        strength: f32,
    },
    MultiImage {
        sources: Vec<InputImage>,
    },
    Refine {
        source: InputImage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
}

impl GenerationInput {
    pub fn generation_type(&self) -> GenerationType {
        match self {
            GenerationInput::TextToImage => GenerationType::TextToImage,
            GenerationInput::ImageToImage { .. } => GenerationType::ImageToImage,
            GenerationInput::MultiImage { .. } => GenerationType::MultiImage,
            GenerationInput::Refine { .. } => GenerationType::Refine,
        }
    }

    pub fn references(&self) -> Vec<InputImage> {
        match self {
            GenerationInput::TextToImage => Vec::new(),
            GenerationInput::ImageToImage { source, .. } | GenerationInput::Refine { source, .. } => {
                vec![source.clone()]
            }
            GenerationInput::MultiImage { sources } => sources.clone(),
        }
    }
}

/// key: generation-request -> caller payload
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub parameters: GenerationParameters,
    pub input: GenerationInput,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, input: GenerationInput) -> Self {
        Self {
            prompt: prompt.into(),
            parameters: GenerationParameters::default(),
            input,
        }
    }

    pub fn with_parameters(mut self, parameters: GenerationParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn generation_type(&self) -> GenerationType {
        self.input.generation_type()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputImage {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size_bytes: u64,
}

/// key: generation-status -> record state machine
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Processing => "processing",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
            GenerationStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(GenerationStatus::Pending),
            "processing" => Some(GenerationStatus::Processing),
            "completed" => Some(GenerationStatus::Completed),
            "failed" => Some(GenerationStatus::Failed),
            "canceled" => Some(GenerationStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationStatus::Completed | GenerationStatus::Failed | GenerationStatus::Canceled
        )
    }

    /// `pending` may fail or be canceled before quota is held; completion always
    /// goes through `processing`.
    pub fn can_transition_to(&self, next: GenerationStatus) -> bool {
        use GenerationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Canceled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Canceled)
        )
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal generation transition {from} -> {to}")]
    Illegal {
        from: GenerationStatus,
        to: GenerationStatus,
    },
    #[error("failed generations require an error message")]
    MissingErrorMessage,
}

/// key: generation-record -> persisted lifecycle
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub generation_type: GenerationType,
    pub status: GenerationStatus,
    pub prompt: String,
    pub parameters: GenerationParameters,
    pub input_references: Vec<InputImage>,
    pub output_images: Vec<OutputImage>,
    pub cost: i64,
    /// Quota period (the subscriber's reset date) the cost was reserved against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_period: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationRecord {
    pub fn pending(subscriber_id: Uuid, request: &GenerationRequest, cost: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            subscriber_id,
            generation_type: request.generation_type(),
            status: GenerationStatus::Pending,
            prompt: request.prompt.clone(),
            parameters: request.parameters.clone(),
            input_references: request.input.references(),
            output_images: Vec::new(),
            cost: cost.max(0),
            quota_period: None,
            processing_time_ms: None,
            error_message: None,
            backend_metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Entered once quota is reserved; `quota_period` is the reservation's reset date.
    pub fn begin_processing(
        &mut self,
        quota_period: DateTime<Utc>,
    ) -> Result<GenerationPatch, TransitionError> {
        let mut patch = self.patch_to(GenerationStatus::Processing)?;
        patch.quota_period = Some(quota_period);
        patch.apply_to(self);
        Ok(patch)
    }

    pub fn complete(
        &mut self,
        images: Vec<OutputImage>,
        processing_time_ms: i64,
        backend_metadata: Value,
    ) -> Result<GenerationPatch, TransitionError> {
        let mut patch = self.patch_to(GenerationStatus::Completed)?;
        patch.output_images = Some(images);
        patch.processing_time_ms = Some(processing_time_ms.max(0));
        patch.backend_metadata = Some(backend_metadata);
        patch.apply_to(self);
        Ok(patch)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<GenerationPatch, TransitionError> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(TransitionError::MissingErrorMessage);
        }
        let mut patch = self.patch_to(GenerationStatus::Failed)?;
        patch.error_message = Some(message);
        patch.apply_to(self);
        Ok(patch)
    }

    pub fn cancel(&mut self) -> Result<GenerationPatch, TransitionError> {
        let patch = self.patch_to(GenerationStatus::Canceled)?;
        patch.apply_to(self);
        Ok(patch)
    }

    fn patch_to(&self, next: GenerationStatus) -> Result<GenerationPatch, TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next,
            });
        }
        Ok(GenerationPatch {
            expected_status: self.status,
            status: next,
            quota_period: None,
            output_images: None,
            processing_time_ms: None,
            error_message: None,
            backend_metadata: None,
            updated_at: Utc::now(),
        })
    }
}

/// key: generation-patch -> compare-and-set update
/// Applied by stores only while the persisted status still equals `expected_status`.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct GenerationPatch {
    pub expected_status: GenerationStatus,
    pub status: GenerationStatus,
    pub quota_period: Option<DateTime<Utc>>,
    pub output_images: Option<Vec<OutputImage>>,
    pub processing_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub backend_metadata: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationPatch {
    pub fn apply_to(&self, record: &mut GenerationRecord) {
        record.status = self.status;
        if let Some(period) = self.quota_period {
            record.quota_period = Some(period);
        }
        if let Some(images) = &self.output_images {
            record.output_images = images.clone();
        }
        if let Some(elapsed) = self.processing_time_ms {
            record.processing_time_ms = Some(elapsed);
        }
        if let Some(message) = &self.error_message {
            record.error_message = Some(message.clone());
        }
        if let Some(metadata) = &self.backend_metadata {
            record.backend_metadata = Some(metadata.clone());
        }
        record.updated_at = self.updated_at;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationUsage {
    pub credits_charged: i64,
    pub quota_used: i64,
    pub quota_limit: i64,
    pub quota_remaining: i64,
    pub quota_reset_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationData {
    pub images: Vec<OutputImage>,
    pub metadata: Value,
    pub usage: GenerationUsage,
    pub generation_record: GenerationRecord,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// key: generation-result -> caller contract
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<GenerationData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Record id, present whenever a record was created, including on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<Uuid>,
}

impl GenerationResult {
    pub fn succeeded(data: GenerationData) -> Self {
        let generation_id = Some(data.generation_record.id);
        Self {
            success: true,
            data: Some(data),
            error: None,
            generation_id,
        }
    }

    pub fn failed(error: ErrorBody, generation_id: Option<Uuid>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            generation_id,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|error| error.code.as_str())
    }
}
