//! Wan DiT configuration and model variant presets

use std::fmt;
use std::str::FromStr;

use burn::config::Config;

use crate::error::WanError;

/// Number of CLIP image tokens prefixed to the text context for I2V models
pub const IMAGE_CONTEXT_LEN: usize = 257;

/// Configuration for the Wan diffusion transformer
#[derive(Config, Debug)]
pub struct WanConfig {
    /// Hidden dimension (default: 1536)
    #[config(default = 1536)]
    pub dim: usize,

    /// Latent channels entering the patch embedding (doubled-ish for I2V)
    #[config(default = 16)]
    pub in_dim: usize,

    /// Feed-forward hidden size (default: 8960)
    #[config(default = 8960)]
    pub ffn_dim: usize,

    /// Latent channels produced by the head
    #[config(default = 16)]
    pub out_dim: usize,

    /// Text encoder hidden size (UMT5-XXL: 4096)
    #[config(default = 4096)]
    pub text_dim: usize,

    /// Width of the sinusoidal timestep embedding
    #[config(default = 256)]
    pub freq_dim: usize,

    /// CLIP vision feature width used for image conditioning
    #[config(default = 1280)]
    pub image_dim: usize,

    /// Normalization epsilon (default: 1e-6)
    #[config(default = 1e-6)]
    pub eps: f64,

    /// Patch size as (frames, height, width)
    #[config(default = "[1, 2, 2]")]
    pub patch_size: [usize; 3],

    /// Number of attention heads (default: 12)
    #[config(default = 12)]
    pub num_heads: usize,

    /// Number of transformer blocks (default: 30)
    #[config(default = 30)]
    pub num_layers: usize,

    /// Whether cross-attention also attends to CLIP image features
    #[config(default = false)]
    pub has_image_input: bool,

    /// Positions covered by each rotary table axis
    #[config(default = 1024)]
    pub rope_max_len: usize,

    /// RoPE theta base (default: 10000.0)
    #[config(default = 10000.0)]
    pub rope_theta: f64,

    /// Query slice size for attention (0 = full attention)
    #[config(default = 0)]
    pub attention_slice_size: usize,
}

impl Default for WanConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WanConfig {
    /// Attention head dimension
    pub fn head_dim(&self) -> usize {
        self.dim / self.num_heads
    }

    /// Output features per token before unpatchify
    pub fn patch_volume(&self) -> usize {
        self.patch_size.iter().product()
    }

    /// Get the total number of parameters (approximate)
    pub fn num_params(&self) -> usize {
        let dim = self.dim;
        let embed_params = self.in_dim * self.patch_volume() * dim
            + self.text_dim * dim
            + dim * dim
            + self.freq_dim * dim
            + dim * dim
            + dim * 6 * dim;
        let cross_image = if self.has_image_input { 2 * dim * dim } else { 0 };
        let layer_params = self.num_layers
            * (4 * dim * dim + 4 * dim * dim + cross_image + 2 * dim * self.ffn_dim + 6 * dim);
        let head_params = dim * self.out_dim * self.patch_volume();

        embed_params + layer_params + head_params
    }

    /// Check that the configuration describes a buildable model
    pub fn validate(&self) -> Result<(), WanError> {
        if self.num_heads == 0 || self.dim % self.num_heads != 0 {
            return Err(WanError::InvalidConfig(format!(
                "dim {} is not divisible by num_heads {}",
                self.dim, self.num_heads
            )));
        }
        let head_dim = self.head_dim();
        let axis = head_dim / 3;
        if head_dim % 2 != 0 || axis % 2 != 0 {
            return Err(WanError::InvalidConfig(format!(
                "head_dim {} cannot be split into even rotary axes",
                head_dim
            )));
        }
        if self.patch_size.iter().any(|&p| p == 0) {
            return Err(WanError::InvalidConfig("patch sizes must be positive".into()));
        }
        if self.freq_dim % 2 != 0 {
            return Err(WanError::InvalidConfig(format!(
                "freq_dim {} must be even",
                self.freq_dim
            )));
        }
        if self.has_image_input && self.in_dim <= self.out_dim {
            return Err(WanError::InvalidConfig(format!(
                "image conditioning needs in_dim ({}) larger than out_dim ({}) to hold the image latent",
                self.in_dim, self.out_dim
            )));
        }
        if !self.has_image_input && self.in_dim != self.out_dim {
            return Err(WanError::InvalidConfig(format!(
                "in_dim ({}) differs from out_dim ({}) but image conditioning is disabled",
                self.in_dim, self.out_dim
            )));
        }
        Ok(())
    }
}

/// What the step cache compares between consecutive steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheReference {
    /// The full 6 x dim modulation tensor fed to the blocks
    Modulation,
    /// The time embedding before projection
    TimeEmbedding,
}

/// Released Wan 2.1 checkpoints this crate knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    /// 1.3B text-to-video
    T2V1_3B,
    /// 14B text-to-video
    T2V14B,
    /// 14B image-to-video (480P)
    I2V14B,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 3] = [Self::T2V1_3B, Self::T2V14B, Self::I2V14B];

    /// Selector string used on the command line and in configs
    pub fn name(&self) -> &'static str {
        match self {
            Self::T2V1_3B => "1.3b-t2v",
            Self::T2V14B => "14b-t2v",
            Self::I2V14B => "14b-i2v",
        }
    }

    /// Architecture preset for this checkpoint
    pub fn config(&self) -> WanConfig {
        match self {
            Self::T2V1_3B => WanConfig::new(),
            Self::T2V14B => WanConfig::new()
                .with_dim(5120)
                .with_ffn_dim(13824)
                .with_num_heads(40)
                .with_num_layers(40),
            Self::I2V14B => WanConfig::new()
                .with_dim(5120)
                .with_ffn_dim(13824)
                .with_num_heads(40)
                .with_num_layers(40)
                .with_in_dim(36)
                .with_has_image_input(true),
        }
    }

    /// Rescaling polynomial, highest power first, calibrated at 480P
    pub fn rescale_coefficients(&self, reference: CacheReference) -> [f64; 5] {
        match (self, reference) {
            (Self::T2V1_3B, CacheReference::Modulation) => {
                [-5.21862437e+04, 9.23041404e+03, -5.28275948e+02, 1.36987616e+01, -4.99875664e-02]
            }
            (Self::T2V14B, CacheReference::Modulation) => {
                [-3.03318725e+05, 4.90537029e+04, -2.65530556e+03, 5.87365115e+01, -3.15583525e-01]
            }
            (Self::I2V14B, CacheReference::Modulation) => {
                [2.57151496e+05, -3.54229917e+04, 1.40286849e+03, -1.35890334e+01, 1.32517977e-01]
            }
            (Self::T2V1_3B, CacheReference::TimeEmbedding) => {
                [2.39676752e+03, -1.31110545e+03, 2.01331979e+02, -8.29855975e+00, 1.37887774e-01]
            }
            (Self::T2V14B, CacheReference::TimeEmbedding) => {
                [-5784.54975374, 5449.50911966, -1811.16591783, 256.27178429, -13.02252404]
            }
            (Self::I2V14B, CacheReference::TimeEmbedding) => {
                [-3.02331670e+02, 2.23948934e+02, -5.25463970e+01, 5.87348440e+00, -2.01973289e-01]
            }
        }
    }

    /// Warm-up invocations (both branches) that always run in full
    pub fn ret_steps(&self, reference: CacheReference) -> usize {
        match reference {
            CacheReference::Modulation => 5 * 2,
            CacheReference::TimeEmbedding => 2,
        }
    }

    /// First invocation index at which caching stops again
    pub fn cutoff_steps(&self, reference: CacheReference, num_inference_steps: usize) -> usize {
        let total = num_inference_steps * 2;
        match reference {
            CacheReference::Modulation => total,
            CacheReference::TimeEmbedding => total.saturating_sub(2),
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelVariant {
    type Err = WanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.name() == s)
            .ok_or_else(|| WanError::UnknownVariant(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_parsing() {
        for variant in ModelVariant::ALL {
            assert_eq!(variant.name().parse::<ModelVariant>().unwrap(), variant);
        }
        let err = "2b-t2v".parse::<ModelVariant>().unwrap_err();
        assert!(matches!(err, WanError::UnknownVariant(ref s) if s == "2b-t2v"));
    }

    #[test]
    fn test_presets_are_valid() {
        for variant in ModelVariant::ALL {
            let config = variant.config();
            config.validate().unwrap();
            assert_eq!(config.head_dim(), 128);
        }
        assert!(ModelVariant::I2V14B.config().has_image_input);
        assert_eq!(ModelVariant::T2V14B.config().num_layers, 40);
    }

    #[test]
    fn test_validate_rejects_bad_heads() {
        let config = WanConfig::new().with_dim(100).with_num_heads(3);
        assert!(matches!(config.validate(), Err(WanError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_image_without_room() {
        let config = WanConfig::new().with_has_image_input(true);
        assert!(matches!(config.validate(), Err(WanError::InvalidConfig(_))));
    }

    #[test]
    fn test_cache_windows() {
        let v = ModelVariant::T2V14B;
        assert_eq!(v.ret_steps(CacheReference::Modulation), 10);
        assert_eq!(v.cutoff_steps(CacheReference::Modulation, 40), 80);
        assert_eq!(v.ret_steps(CacheReference::TimeEmbedding), 2);
        assert_eq!(v.cutoff_steps(CacheReference::TimeEmbedding, 40), 78);
    }

    #[test]
    fn test_num_params_scale() {
        let params = ModelVariant::T2V14B.config().num_params() as f64 / 1e9;
        assert!(params > 12.0 && params < 16.0, "got {params}B");
    }
}
