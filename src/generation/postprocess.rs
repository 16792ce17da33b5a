use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::billing::entitlements::entitlement_for;
use crate::billing::models::Tier;

use super::backend::RawImage;
use super::models::OutputImage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("processing_error: {0}")]
pub struct PostProcessingError(pub String);

/// key: post-processing -> output normalisation seam
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(
        &self,
        raw_images: Vec<RawImage>,
        tier: Tier,
    ) -> Result<Vec<OutputImage>, PostProcessingError>;
}

/// Turns raw backend output into stored descriptors. Images beyond the tier's batch
/// ceiling are dropped.
#[derive(Clone, Debug, Default)]
pub struct DescriptorPostProcessor;

#[async_trait]
impl PostProcessor for DescriptorPostProcessor {
    async fn process(
        &self,
        raw_images: Vec<RawImage>,
        tier: Tier,
    ) -> Result<Vec<OutputImage>, PostProcessingError> {
        if raw_images.is_empty() {
            return Err(PostProcessingError("backend returned no images".to_string()));
        }
        let ceiling = entitlement_for(tier).max_batch_size as usize;
        if raw_images.len() > ceiling {
            tracing::warn!(
                %tier,
                returned = raw_images.len(),
                ceiling,
                "backend returned more images than the tier allows; truncating"
            );
        }
        raw_images
            .into_iter()
            .take(ceiling)
            .enumerate()
            .map(|(index, raw)| describe(index, raw))
            .collect()
    }
}

fn describe(index: usize, raw: RawImage) -> Result<OutputImage, PostProcessingError> {
    let url = Url::parse(&raw.url)
        .map_err(|err| PostProcessingError(format!("image {index} has invalid url: {err}")))?;
    let (width, height) = match (raw.width, raw.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => (width, height),
        _ => {
            return Err(PostProcessingError(format!(
                "image {index} is missing dimensions"
            )))
        }
    };
    let format = raw
        .format
        .map(|format| format.trim().to_ascii_lowercase())
        .filter(|format| !format.is_empty())
        .or_else(|| {
            url.path()
                .rsplit_once('.')
                .map(|(_, extension)| extension.to_ascii_lowercase())
        })
        .unwrap_or_else(|| "png".to_string());

    Ok(OutputImage {
        url: url.to_string(),
        width,
        height,
        format,
        size_bytes: raw.size_bytes.unwrap_or(0),
    })
}
