//! Wan DiT (Diffusion Transformer) Model
//!
//! Transformer over patchified video latents with 3D RoPE self-attention,
//! text/image cross-attention and timestep modulation. The block stack runs
//! through a [`StepCache`] that may replace it with a recorded residual.
//! Matches the Wan 2.1 safetensors structure.

use std::collections::BTreeSet;

use burn::module::{Ignored, Module, Param};
use burn::prelude::*;
use tracing::debug;

use super::attention::{CrossAttention, SelfAttention};
use super::embeddings::{Head, ImageEmbedding, PatchEmbedding, TextEmbedding};
use super::feed_forward::FeedForward;
use super::modulation::{modulate, BlockModulation, TimeProjection, TimestepEmbedder};
use super::normalization::CenteredNorm;
use super::patch::PatchCodec;
use super::rope::{RopeFreqs, RopeTables};
use crate::cache::{CacheDecision, StepCache};
use crate::config::{CacheReference, WanConfig, IMAGE_CONTEXT_LEN};
use crate::error::WanError;

/// Single DiT Block
///
/// Contains:
/// 1. Modulated self-attention with 3D RoPE (norm1)
/// 2. Cross-attention to the context (norm3, not modulated)
/// 3. Modulated feed-forward network (norm2)
#[derive(Module, Debug)]
pub struct DiTBlock<B: Backend> {
    self_attn: SelfAttention<B>,
    cross_attn: CrossAttention<B>,
    /// Pre-norm for self-attention (no affine)
    norm1: CenteredNorm<B>,
    /// Pre-norm for the FFN (no affine)
    norm2: CenteredNorm<B>,
    /// Pre-norm for cross-attention (affine)
    norm3: CenteredNorm<B>,
    ffn: FeedForward<B>,
    /// Learned offset added to the shared modulation [1, 6, dim]
    modulation: Param<Tensor<B, 3>>,
}

impl<B: Backend> DiTBlock<B> {
    /// Create a new DiT block
    pub fn new(config: &WanConfig, device: &B::Device) -> Self {
        let dim = config.dim;
        Self {
            self_attn: SelfAttention::new(
                dim,
                config.num_heads,
                config.eps,
                config.attention_slice_size,
                device,
            ),
            cross_attn: CrossAttention::new(
                dim,
                config.num_heads,
                config.eps,
                config.has_image_input,
                config.attention_slice_size,
                device,
            ),
            norm1: CenteredNorm::new(dim, config.eps, false, device),
            norm2: CenteredNorm::new(dim, config.eps, false, device),
            norm3: CenteredNorm::new(dim, config.eps, true, device),
            ffn: FeedForward::new(dim, config.ffn_dim, device),
            modulation: Param::from_tensor(Tensor::zeros([1, 6, dim], device)),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Hidden states [batch, seq_len, dim]
    /// * `context` - Projected context [batch, context_len, dim]
    /// * `t_mod` - Shared modulation [batch, 6, dim]
    /// * `freqs` - Rotary tables for the token grid
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        context: Tensor<B, 3>,
        t_mod: Tensor<B, 3>,
        freqs: &RopeFreqs<B>,
    ) -> Tensor<B, 3> {
        let batch = t_mod.dims()[0];
        let m = BlockModulation::split(self.modulation.val().repeat(&[batch, 1, 1]) + t_mod);

        let input = modulate(self.norm1.forward(x.clone()), m.shift_msa, m.scale_msa);
        let x = x + m.gate_msa * self.self_attn.forward(input, freqs);

        let x = x.clone() + self.cross_attn.forward(self.norm3.forward(x), context);

        let input = modulate(self.norm2.forward(x.clone()), m.shift_mlp, m.scale_mlp);
        x + m.gate_mlp * self.ffn.forward(input)
    }
}

/// Block indices to bypass for one invocation
///
/// Used for skip-layer guidance. Indices past the last block are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSkip {
    indices: BTreeSet<usize>,
}

impl BlockSkip {
    /// Skip nothing
    pub fn none() -> Self {
        Self::default()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Indices that do not name a block of a `num_layers` stack
    pub fn out_of_range(&self, num_layers: usize) -> Vec<usize> {
        self.indices.range(num_layers..).copied().collect()
    }
}

impl FromIterator<usize> for BlockSkip {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            indices: iter.into_iter().collect(),
        }
    }
}

/// Inputs of one DiT invocation
#[derive(Debug, Clone)]
pub struct DiTInput<B: Backend> {
    /// Noisy latents [batch, out_dim, frames, height, width]
    pub latent: Tensor<B, 5>,
    /// Text encoder states [batch, text_len, text_dim]
    pub context: Tensor<B, 3>,
    /// Diffusion timesteps [batch], or [1] shared by the whole batch
    pub timestep: Tensor<B, 1>,
    /// Pixel-space frame count of the video being generated
    pub num_frames: usize,
    /// CLIP image features [batch, 257, image_dim] (image-to-video only)
    pub image_features: Option<Tensor<B, 3>>,
    /// Encoded conditioning image [batch, in_dim - out_dim, frames, height, width]
    /// (image-to-video only)
    pub image_latent: Option<Tensor<B, 5>>,
    /// Blocks bypassed for this invocation
    pub skip_layers: BlockSkip,
}

impl<B: Backend> DiTInput<B> {
    pub fn new(latent: Tensor<B, 5>, context: Tensor<B, 3>, timestep: Tensor<B, 1>, num_frames: usize) -> Self {
        Self {
            latent,
            context,
            timestep,
            num_frames,
            image_features: None,
            image_latent: None,
            skip_layers: BlockSkip::none(),
        }
    }

    /// Attach image-to-video conditioning
    pub fn with_image(mut self, features: Tensor<B, 3>, latent: Tensor<B, 5>) -> Self {
        self.image_features = Some(features);
        self.image_latent = Some(latent);
        self
    }

    pub fn with_skip_layers(mut self, skip_layers: BlockSkip) -> Self {
        self.skip_layers = skip_layers;
        self
    }
}

/// Wan DiT Model
///
/// Matches the Wan 2.1 safetensors structure.
#[derive(Module, Debug)]
pub struct WanDiT<B: Backend> {
    /// Patch embedding (3D conv): patch_embedding
    patch_embedding: PatchEmbedding<B>,
    /// Text embedding MLP: text_embedding.0/2
    text_embedding: TextEmbedding<B>,
    /// Time embedding MLP: time_embedding.0/2
    time_embedding: TimestepEmbedder<B>,
    /// Six-way modulation projection: time_projection.1
    time_projection: TimeProjection<B>,
    /// CLIP feature projection: img_emb.proj (image-to-video only)
    img_emb: Option<ImageEmbedding<B>>,
    /// Transformer blocks: blocks.0..num_layers
    blocks: Vec<DiTBlock<B>>,
    /// Output head: head.head, head.modulation
    head: Head<B>,
    /// Rotary tables, derived from the config (not a module parameter)
    rope: Ignored<RopeTables>,
    /// Model configuration (not a module parameter)
    config: Ignored<WanConfig>,
}

impl<B: Backend> WanDiT<B> {
    /// Initialize the model from config
    pub fn new(config: &WanConfig, device: &B::Device) -> Result<Self, WanError> {
        config.validate()?;
        let rope = RopeTables::new(config.head_dim(), config.rope_max_len, config.rope_theta)?;

        let blocks = (0..config.num_layers)
            .map(|_| DiTBlock::new(config, device))
            .collect();

        Ok(Self {
            patch_embedding: PatchEmbedding::new(config.in_dim, config.dim, config.patch_size, device),
            text_embedding: TextEmbedding::new(config.text_dim, config.dim, device),
            time_embedding: TimestepEmbedder::new(config.freq_dim, config.dim, device),
            time_projection: TimeProjection::new(config.dim, device),
            img_emb: config
                .has_image_input
                .then(|| ImageEmbedding::new(config.image_dim, config.dim, device)),
            blocks,
            head: Head::new(config.dim, config.out_dim, config.patch_size, config.eps, device),
            rope: Ignored(rope),
            config: Ignored(config.clone()),
        })
    }

    /// Get model configuration
    pub fn config(&self) -> &WanConfig {
        &self.config.0
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Forward pass - predict the denoising residual
    ///
    /// The cache session decides whether the block stack runs; on error the
    /// session is left untouched.
    ///
    /// # Returns
    /// Prediction [batch, out_dim, frames, height, width]
    pub fn forward(&self, input: DiTInput<B>, cache: &mut StepCache<B>) -> Result<Tensor<B, 5>, WanError> {
        let config = self.config();
        let DiTInput {
            latent,
            context,
            timestep,
            num_frames,
            image_features,
            image_latent,
            skip_layers,
        } = input;
        let [batch, channels, ..] = latent.dims();
        let device = latent.device();

        if channels != config.out_dim {
            return Err(WanError::shape("latent channels", config.out_dim, channels));
        }
        let [context_batch, _, context_width] = context.dims();
        if context_batch != batch || context_width != config.text_dim {
            return Err(WanError::shape(
                "text context [batch, _, text_dim]",
                [batch, config.text_dim],
                [context_batch, context_width],
            ));
        }
        let timestep = match timestep.dims() {
            [n] if n == batch => timestep,
            [1] => timestep.repeat(&[batch]),
            [n] => return Err(WanError::shape("timestep", batch, n)),
        };

        let context = self.text_embedding.forward(context);
        let (latent, context) = self.condition_on_image(latent, context, image_features, image_latent)?;

        let t = self.time_embedding.forward(timestep);
        let t_mod = self.time_projection.forward(t.clone());

        let (x, grid) = self.patch_embedding.forward(latent)?;
        let freqs = self.rope.0.gather(grid.frames, grid.height, grid.width, &device)?;

        let reference = match cache.config().reference {
            CacheReference::Modulation => t_mod.clone().reshape([batch, 6 * config.dim]),
            CacheReference::TimeEmbedding => t.clone(),
        };

        let ignored = skip_layers.out_of_range(self.num_layers());
        if !ignored.is_empty() {
            debug!(?ignored, num_layers = self.num_layers(), "skip indices past the last block ignored");
        }

        let (x, decision) = cache.step(reference, x, |x| {
            self.run_blocks(x, &context, &t_mod, &freqs, &skip_layers)
        })?;
        if decision == CacheDecision::Skip {
            debug!(num_frames, tokens = grid.num_tokens(), "block stack skipped");
        }

        let x = self.head.forward(x, t);
        PatchCodec::new(config.patch_size).unpatchify(x, grid, config.out_dim)
    }

    /// Run the transformer blocks, bypassing those listed in `skip`
    pub fn run_blocks(
        &self,
        x: Tensor<B, 3>,
        context: &Tensor<B, 3>,
        t_mod: &Tensor<B, 3>,
        freqs: &RopeFreqs<B>,
        skip: &BlockSkip,
    ) -> Tensor<B, 3> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(index, _)| !skip.contains(*index))
            .fold(x, |x, (_, block)| block.forward(x, context.clone(), t_mod.clone(), freqs))
    }

    /// Concatenate the image latent on channels and prefix the projected CLIP
    /// features to the context
    fn condition_on_image(
        &self,
        latent: Tensor<B, 5>,
        context: Tensor<B, 3>,
        image_features: Option<Tensor<B, 3>>,
        image_latent: Option<Tensor<B, 5>>,
    ) -> Result<(Tensor<B, 5>, Tensor<B, 3>), WanError> {
        let config = self.config();
        let img_emb = match &self.img_emb {
            Some(img_emb) => img_emb,
            None if image_features.is_some() || image_latent.is_some() => {
                return Err(WanError::UnexpectedImageInput)
            }
            None => return Ok((latent, context)),
        };
        let (Some(features), Some(image_latent)) = (image_features, image_latent) else {
            return Err(WanError::MissingImageInput);
        };

        let [batch, _, frames, height, width] = latent.dims();
        let expected = [batch, config.in_dim - config.out_dim, frames, height, width];
        if image_latent.dims() != expected {
            return Err(WanError::shape("image latent", expected, image_latent.dims()));
        }
        let expected = [batch, IMAGE_CONTEXT_LEN, config.image_dim];
        if features.dims() != expected {
            return Err(WanError::shape("image features", expected, features.dims()));
        }

        let latent = Tensor::cat(vec![latent, image_latent], 1);
        let context = Tensor::cat(vec![img_emb.forward(features), context], 1);
        Ok((latent, context))
    }
}

impl WanConfig {
    /// Initialize the DiT model
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<WanDiT<B>, WanError> {
        WanDiT::new(self, device)
    }
}
