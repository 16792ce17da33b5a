use crate::billing::entitlements::{entitlement_for, minimum_tier, Entitlement};
use crate::billing::models::Tier;

use super::error::GenerationError;
use super::models::{GenerationInput, GenerationRequest, InputImage, MAX_PROMPT_LENGTH};

pub const MIN_MULTI_IMAGE_SOURCES: usize = 2;
pub const MAX_MULTI_IMAGE_SOURCES: usize = 4;
pub const MAX_STEPS: u32 = 150;
pub const MAX_GUIDANCE: f32 = 30.0;

/// Checks a request against its shape rules and the tier's entitlement. Runs before any
/// record or quota is touched.
pub fn validate_request(
    request: &GenerationRequest,
    tier: Tier,
) -> Result<Entitlement, GenerationError> {
    let entitlement = entitlement_for(tier);

    let prompt = request.prompt.trim();
    if prompt.is_empty() {
        return Err(invalid("prompt must not be empty"));
    }
    if prompt.chars().count() > MAX_PROMPT_LENGTH {
        return Err(invalid(format!(
            "prompt must be at most {MAX_PROMPT_LENGTH} characters"
        )));
    }

    let parameters = &request.parameters;
    if let Some(negative) = &parameters.negative_prompt {
        if negative.chars().count() > MAX_PROMPT_LENGTH {
            return Err(invalid(format!(
                "negative_prompt must be at most {MAX_PROMPT_LENGTH} characters"
            )));
        }
    }
    if parameters.batch_size == 0 {
        return Err(invalid("batch_size must be at least 1"));
    }
    if let Some(steps) = parameters.steps {
        if steps == 0 || steps > MAX_STEPS {
            return Err(invalid(format!("steps must be between 1 and {MAX_STEPS}")));
        }
    }
    if let Some(guidance) = parameters.guidance {
        if !guidance.is_finite() || !(0.0..=MAX_GUIDANCE).contains(&guidance) {
            return Err(invalid(format!(
                "guidance must be between 0 and {MAX_GUIDANCE}"
            )));
        }
    }

    match &request.input {
        GenerationInput::TextToImage => {}
        GenerationInput::ImageToImage { source, strength } => {
            check_source(source, "source")?;
            if !strength.is_finite() || !(0.0..=1.0).contains(strength) {
                return Err(invalid("strength must be between 0 and 1"));
            }
        }
        GenerationInput::MultiImage { sources } => {
            if !entitlement.allows_multi_image {
                return Err(GenerationError::Subscription {
                    feature: "multi-image generation".to_string(),
                    tier,
                    required: minimum_tier(|candidate| candidate.allows_multi_image),
                });
            }
            if !(MIN_MULTI_IMAGE_SOURCES..=MAX_MULTI_IMAGE_SOURCES).contains(&sources.len()) {
                return Err(invalid(format!(
                    "multi-image generation takes {MIN_MULTI_IMAGE_SOURCES} to {MAX_MULTI_IMAGE_SOURCES} sources, got {}",
                    sources.len()
                )));
            }
            for (index, source) in sources.iter().enumerate() {
                check_source(source, &format!("sources[{index}]"))?;
            }
        }
        GenerationInput::Refine { source, .. } => check_source(source, "source")?,
    }

    if !entitlement.allows_quality(parameters.quality) {
        let quality = parameters.quality;
        return Err(GenerationError::Subscription {
            feature: format!("{} quality", quality.as_str()),
            tier,
            required: minimum_tier(|candidate| candidate.allows_quality(quality)),
        });
    }
    if parameters.batch_size > entitlement.max_batch_size {
        let batch_size = parameters.batch_size;
        return Err(GenerationError::Subscription {
            feature: format!("batch size {batch_size}"),
            tier,
            required: minimum_tier(|candidate| candidate.max_batch_size >= batch_size),
        });
    }
    if parameters.model.is_some() && !entitlement.allows_custom_model {
        return Err(GenerationError::Subscription {
            feature: "custom model selection".to_string(),
            tier,
            required: minimum_tier(|candidate| candidate.allows_custom_model),
        });
    }

    Ok(entitlement)
}

fn check_source(source: &InputImage, field: &str) -> Result<(), GenerationError> {
    if source.url.trim().is_empty() {
        return Err(invalid(format!("{field} must include an image url")));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> GenerationError {
    GenerationError::Validation(message.into())
}
