//! Input embeddings and output head for Wan
//!
//! Matches the Wan 2.1 safetensors structure: `patch_embedding`,
//! `text_embedding.{0,2}`, `img_emb.proj.{0,1,3,4}` and `head.{head,modulation}`.

use burn::module::{Ignored, Module, Param};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::gelu;

use super::feed_forward::gelu_tanh;
use super::modulation::modulate;
use super::normalization::CenteredNorm;
use super::patch::{PatchCodec, PatchGrid};
use crate::error::WanError;

/// Epsilon of the CLIP feature projection norms (PyTorch LayerNorm default)
const IMAGE_NORM_EPS: f64 = 1e-5;

/// 3D Patch Embedding Layer
///
/// Strided 3D convolution: patch_embedding.weight [dim, in_dim, pt, ph, pw].
/// Kernel and stride are equal, so the convolution is a matmul over
/// patchified tokens.
#[derive(Module, Debug)]
pub struct PatchEmbedding<B: Backend> {
    /// Convolution kernel [dim, in_dim, pt, ph, pw]
    weight: Param<Tensor<B, 5>>,
    /// Bias [dim]
    bias: Param<Tensor<B, 1>>,
    patch_size: Ignored<[usize; 3]>,
}

impl<B: Backend> PatchEmbedding<B> {
    pub fn new(in_dim: usize, dim: usize, patch_size: [usize; 3], device: &B::Device) -> Self {
        let [pt, ph, pw] = patch_size;
        Self {
            weight: Param::from_tensor(Tensor::zeros([dim, in_dim, pt, ph, pw], device)),
            bias: Param::from_tensor(Tensor::zeros([dim], device)),
            patch_size: Ignored(patch_size),
        }
    }

    /// Latent channels expected at the input
    pub fn in_channels(&self) -> usize {
        self.weight.val().dims()[1]
    }

    /// Convert latents to patch embeddings
    ///
    /// # Arguments
    /// * `x` - Input latents [batch, in_dim, frames, height, width]
    ///
    /// # Returns
    /// Patch embeddings [batch, num_patches, dim] and the patch grid
    pub fn forward(&self, x: Tensor<B, 5>) -> Result<(Tensor<B, 3>, PatchGrid), WanError> {
        let [dim, in_dim, pt, ph, pw] = self.weight.val().dims();
        let channels = x.dims()[1];
        if channels != in_dim {
            return Err(WanError::shape("latent channels", in_dim, channels));
        }

        let (tokens, grid) = PatchCodec::new(self.patch_size.0).patchify(x)?;
        let batch = tokens.dims()[0];
        let patch_dim = pt * ph * pw * in_dim;

        // Kernel in token feature order (pt, ph, pw, C): [patch_dim, dim]
        let weight = self
            .weight
            .val()
            .permute([0, 2, 3, 4, 1])
            .reshape([dim, patch_dim])
            .transpose();

        let out = tokens.matmul(weight.unsqueeze_dim(0).repeat(&[batch, 1, 1]));
        Ok((out + self.bias.val().unsqueeze_dims(&[0, 1]), grid))
    }
}

/// Text Embedding MLP
///
/// Projects encoder states: text_embedding.0/2
/// Sequential(Linear, GELU(tanh), Linear)
#[derive(Module, Debug)]
pub struct TextEmbedding<B: Backend> {
    /// text_embedding.0 [text_dim -> dim]
    linear1: Linear<B>,
    /// text_embedding.2 [dim -> dim]
    linear2: Linear<B>,
}

impl<B: Backend> TextEmbedding<B> {
    pub fn new(text_dim: usize, dim: usize, device: &B::Device) -> Self {
        Self {
            linear1: LinearConfig::new(text_dim, dim).with_bias(true).init(device),
            linear2: LinearConfig::new(dim, dim).with_bias(true).init(device),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.linear1.weight.val().dims()[0]
    }

    /// Forward pass: [batch, text_len, text_dim] -> [batch, text_len, dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.linear2.forward(gelu_tanh(self.linear1.forward(x)))
    }
}

/// CLIP image feature projection for image-to-video models
///
/// img_emb.proj: Sequential(LayerNorm, Linear, GELU, Linear, LayerNorm)
#[derive(Module, Debug)]
pub struct ImageEmbedding<B: Backend> {
    /// img_emb.proj.0
    norm_in: CenteredNorm<B>,
    /// img_emb.proj.1 [image_dim -> image_dim]
    linear1: Linear<B>,
    /// img_emb.proj.3 [image_dim -> dim]
    linear2: Linear<B>,
    /// img_emb.proj.4
    norm_out: CenteredNorm<B>,
}

impl<B: Backend> ImageEmbedding<B> {
    pub fn new(image_dim: usize, dim: usize, device: &B::Device) -> Self {
        Self {
            norm_in: CenteredNorm::new(image_dim, IMAGE_NORM_EPS, true, device),
            linear1: LinearConfig::new(image_dim, image_dim).with_bias(true).init(device),
            linear2: LinearConfig::new(image_dim, dim).with_bias(true).init(device),
            norm_out: CenteredNorm::new(dim, IMAGE_NORM_EPS, true, device),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.linear1.weight.val().dims()[0]
    }

    /// Forward pass: [batch, 257, image_dim] -> [batch, 257, dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.linear1.forward(self.norm_in.forward(x));
        let x = self.linear2.forward(gelu(x));
        self.norm_out.forward(x)
    }
}

/// Output head: modulated norm and projection back to patch features
///
/// Matches model: head.head, head.modulation
#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    norm: CenteredNorm<B>,
    /// head.head [dim -> out_dim * pt * ph * pw]
    head: Linear<B>,
    /// head.modulation [1, 2, dim], offset added to the time embedding
    modulation: Param<Tensor<B, 3>>,
}

impl<B: Backend> Head<B> {
    pub fn new(dim: usize, out_dim: usize, patch_size: [usize; 3], eps: f64, device: &B::Device) -> Self {
        let patch_volume: usize = patch_size.iter().product();
        Self {
            norm: CenteredNorm::new(dim, eps, false, device),
            head: LinearConfig::new(dim, out_dim * patch_volume)
                .with_bias(true)
                .init(device),
            modulation: Param::from_tensor(Tensor::zeros([1, 2, dim], device)),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Hidden states [batch, num_patches, dim]
    /// * `t` - Time embedding [batch, dim] (not the six-way modulation)
    ///
    /// # Returns
    /// Patch features [batch, num_patches, out_dim * pt * ph * pw]
    pub fn forward(&self, x: Tensor<B, 3>, t: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, dim] = t.dims();
        let modulation = self.modulation.val().repeat(&[batch, 1, 1]) + t.unsqueeze_dim(1);
        let shift = modulation.clone().slice([0..batch, 0..1, 0..dim]);
        let scale = modulation.slice([0..batch, 1..2, 0..dim]);

        self.head.forward(modulate(self.norm.forward(x), shift, scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_patch_embedding_matches_direct_convolution() {
        let device = Default::default();
        let (dim, channels) = (3, 2);
        let embed = PatchEmbedding::<TestBackend>::new(channels, dim, [1, 2, 2], &device);
        let weight = Tensor::<TestBackend, 5>::random([dim, channels, 1, 2, 2], Distribution::Default, &device);
        let embed = PatchEmbedding {
            weight: Param::from_tensor(weight.clone()),
            ..embed
        };

        // Exactly one patch: the convolution is a full contraction
        let x = Tensor::<TestBackend, 5>::random([1, channels, 1, 2, 2], Distribution::Default, &device);
        let (out, grid) = embed.forward(x.clone()).unwrap();
        assert_eq!(grid.num_tokens(), 1);

        let expected = (weight * x).sum_dim(1).sum_dim(2).sum_dim(3).sum_dim(4).reshape([1, 1, dim]);
        let diff: f32 = (out - expected).abs().max().into_scalar();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_patch_embedding_rejects_wrong_channels() {
        let device = Default::default();
        let embed = PatchEmbedding::<TestBackend>::new(4, 8, [1, 2, 2], &device);
        let x = Tensor::<TestBackend, 5>::zeros([1, 3, 1, 2, 2], &device);
        assert!(matches!(embed.forward(x), Err(WanError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_head_output_width() {
        let device = Default::default();
        let head = Head::<TestBackend>::new(8, 4, [1, 2, 2], 1e-6, &device);
        let x = Tensor::<TestBackend, 3>::random([2, 5, 8], Distribution::Default, &device);
        let t = Tensor::<TestBackend, 2>::zeros([2, 8], &device);
        assert_eq!(head.forward(x, t).dims(), [2, 5, 16]);
    }

    #[test]
    fn test_image_embedding_shape() {
        let device = Default::default();
        let emb = ImageEmbedding::<TestBackend>::new(10, 6, &device);
        assert_eq!(emb.in_dim(), 10);
        let x = Tensor::<TestBackend, 3>::random([1, 7, 10], Distribution::Default, &device);
        assert_eq!(emb.forward(x).dims(), [1, 7, 6]);
    }
}
