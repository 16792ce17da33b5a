//! Credit pricing for generation requests.
//!
//! The calculator is pure so the pre-flight preview and the actual reservation
//! always agree on the price of a request.

use serde::Serialize;

use super::models::{AspectRatio, GenerationType, Quality, Style};

const BASE_COST: f64 = 1.0;
const VOLUME_DISCOUNT_STEP: f64 = 0.02;
const VOLUME_DISCOUNT_FLOOR: f64 = 0.9;
// Products of the factor tables land a hair above whole numbers in f64.
const ROUNDING_EPSILON: f64 = 1e-9;

/// key: cost-breakdown -> preview payload
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CostBreakdown {
    pub type_factor: f64,
    pub quality_factor: f64,
    pub aspect_factor: f64,
    pub style_factor: f64,
    pub batch_size: u32,
    pub volume_discount: f64,
    pub raw: f64,
    pub credits: i64,
}

pub fn type_factor(generation_type: GenerationType) -> f64 {
    match generation_type {
        GenerationType::TextToImage => 1.0,
        GenerationType::ImageToImage => 1.2,
        GenerationType::MultiImage => 1.5,
        GenerationType::Refine => 0.8,
    }
}

pub fn quality_factor(quality: Quality) -> f64 {
    match quality {
        Quality::Standard => 1.0,
        Quality::Hd => 1.5,
        Quality::Ultra => 2.0,
    }
}

pub fn aspect_factor(aspect_ratio: AspectRatio) -> f64 {
    match aspect_ratio {
        AspectRatio::Square => 1.0,
        AspectRatio::Portrait | AspectRatio::Landscape => 1.1,
        AspectRatio::Tall | AspectRatio::Wide => 1.2,
    }
}

pub fn style_factor(style: Option<Style>) -> f64 {
    match style {
        None | Some(Style::Natural) => 1.0,
        Some(Style::Sketch) => 0.9,
        Some(Style::Vivid) | Some(Style::Anime) => 1.1,
        Some(Style::Photorealistic) => 1.2,
        Some(Style::Artistic) => 1.3,
    }
}

pub fn volume_discount(batch_size: u32) -> f64 {
    (1.0 - batch_size as f64 * VOLUME_DISCOUNT_STEP).max(VOLUME_DISCOUNT_FLOOR)
}

pub fn breakdown(
    generation_type: GenerationType,
    quality: Quality,
    batch_size: u32,
    aspect_ratio: AspectRatio,
    style: Option<Style>,
) -> CostBreakdown {
    let batch_size = batch_size.max(1);
    let type_factor = type_factor(generation_type);
    let quality_factor = quality_factor(quality);
    let aspect_factor = aspect_factor(aspect_ratio);
    let style_factor = style_factor(style);
    let volume_discount = volume_discount(batch_size);

    let raw = BASE_COST
        * type_factor
        * quality_factor
        * aspect_factor
        * style_factor
        * batch_size as f64
        * volume_discount;
    let snapped = (raw / ROUNDING_EPSILON).round() * ROUNDING_EPSILON;
    let credits = (snapped.ceil() as i64).max(1);

    CostBreakdown {
        type_factor,
        quality_factor,
        aspect_factor,
        style_factor,
        batch_size,
        volume_discount,
        raw,
        credits,
    }
}

/// Credits charged for one request.
pub fn cost(
    generation_type: GenerationType,
    quality: Quality,
    batch_size: u32,
    aspect_ratio: AspectRatio,
    style: Option<Style>,
) -> i64 {
    breakdown(generation_type, quality, batch_size, aspect_ratio, style).credits
}
