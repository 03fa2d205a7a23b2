//! Model construction from a variant selector
//!
//! Combines the architecture preset, the step-cache calibration and optional
//! pretrained weights into a ready-to-sample `(WanDiT, StepCache)` pair.

use std::path::PathBuf;

use burn::prelude::*;
use tracing::info;

use crate::cache::{StepCache, StepCacheConfig};
use crate::config::{CacheReference, ModelVariant, WanConfig};
use crate::error::WanError;
use crate::modules::dit::WanDiT;

/// Builder for a Wan DiT and its step-cache session
///
/// ```rust,ignore
/// let (model, mut cache) = WanBuilder::<Backend>::new(device)
///     .with_variant("14b-t2v")
///     .with_num_inference_steps(40)
///     .with_threshold(0.2)
///     .with_weights("wan2.1_t2v_14b.safetensors")
///     .build()?;
/// ```
pub struct WanBuilder<B: Backend> {
    variant: String,
    num_inference_steps: usize,
    threshold: f64,
    reference: CacheReference,
    config: Option<WanConfig>,
    weights: Option<PathBuf>,
    device: B::Device,
}

impl<B: Backend> WanBuilder<B> {
    /// Create a new builder (1.3b-t2v, 40 steps, threshold 0.2)
    pub fn new(device: B::Device) -> Self {
        Self {
            variant: ModelVariant::T2V1_3B.name().to_string(),
            num_inference_steps: 40,
            threshold: 0.2,
            reference: CacheReference::Modulation,
            config: None,
            weights: None,
            device,
        }
    }

    /// Set the model variant selector (`"1.3b-t2v"`, `"14b-t2v"`, `"14b-i2v"`)
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    /// Sampling steps of one run (the cache horizon)
    pub fn with_num_inference_steps(mut self, steps: usize) -> Self {
        self.num_inference_steps = steps;
        self
    }

    /// Accumulated drift below which the block stack is skipped
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_reference(mut self, reference: CacheReference) -> Self {
        self.reference = reference;
        self
    }

    /// Override the architecture preset of the variant
    ///
    /// The variant still selects the cache calibration.
    pub fn with_config(mut self, config: WanConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set weights path
    pub fn with_weights(mut self, path: impl Into<PathBuf>) -> Self {
        self.weights = Some(path.into());
        self
    }

    /// Build the model and a fresh cache session
    ///
    /// The variant selector and cache settings are checked before any
    /// tensor is allocated.
    pub fn build(self) -> Result<(WanDiT<B>, StepCache<B>), WanError> {
        let variant: ModelVariant = self.variant.parse()?;
        let cache = StepCache::new(
            StepCacheConfig::for_variant(variant, self.num_inference_steps, self.threshold)
                .with_reference(self.reference),
        )?;

        let config = self.config.unwrap_or_else(|| variant.config());
        config.validate()?;
        info!(
            %variant,
            dim = config.dim,
            layers = config.num_layers,
            params_b = config.num_params() as f64 / 1e9,
            steps = self.num_inference_steps,
            threshold = self.threshold,
            "building Wan DiT"
        );

        let mut model = config.init(&self.device)?;
        if let Some(path) = self.weights {
            model.load_weights(path)?;
        }

        Ok((model, cache))
    }
}
