pub mod api;
pub mod backend;
pub mod cost;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod postprocess;
pub mod retry;
pub mod store;
pub mod validation;

pub use api::{
    cancel_generation, create_generation, get_generation, list_generations, preview_generation,
};
pub use backend::{
    BackendError, BackendErrorKind, BackendRequest, BackendResponse, GenerationBackend,
    HttpGenerationBackend, RawImage,
};
pub use error::GenerationError;
pub use models::{
    AspectRatio, GenerationInput, GenerationParameters, GenerationRecord, GenerationRequest,
    GenerationResult, GenerationStatus, GenerationType, InputImage, OutputImage, Quality, Style,
};
pub use orchestrator::{
    CancelOutcome, CompensationPolicy, CostPreview, Orchestrator, OrchestratorConfig,
};
pub use postprocess::{DescriptorPostProcessor, PostProcessingError, PostProcessor};
pub use retry::{execute_with_retry, RetryError, RetryPolicy, Retryable};
pub use store::{GenerationStore, InMemoryGenerationStore, PgGenerationStore, StoreError};
