//! Normalization layers for Wan
//!
//! Blocks use layer normalization (affine only for the cross-attention norm)
//! and the attention projections use RMSNorm over the full model width.

use burn::module::{Ignored, Module, Param};
use burn::prelude::*;

/// RMS Layer Normalization
///
/// Normalizes by the root mean square over the last dimension, without
/// subtracting the mean. Wan applies it to the whole projected query/key
/// (all heads at once) rather than per head.
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    /// Scale parameter (gamma)
    weight: Param<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    eps: Ignored<f64>,
}

impl<B: Backend> RmsNorm<B> {
    /// Create a new RMS normalization layer
    pub fn new(size: usize, eps: f64, device: &B::Device) -> Self {
        let weight = Param::from_tensor(Tensor::ones([size], device));
        Self { weight, eps: Ignored(eps) }
    }

    /// Forward pass for 3D tensor [batch, seq, hidden]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let variance = x.clone().powf_scalar(2.0).mean_dim(2);
        let x_norm = x / (variance + self.eps.0).sqrt();
        x_norm * self.weight.val().unsqueeze_dims(&[0, 1])
    }
}

/// Layer Normalization with optional elementwise affine
///
/// Checkpoints omit `weight`/`bias` for the non-affine norms, so both are
/// optional parameters. Parameters keep their PyTorch names, so this type
/// must not be named like burn's own norm layers (the PyTorch adapter would
/// rename them to `gamma`/`beta`).
#[derive(Module, Debug)]
pub struct CenteredNorm<B: Backend> {
    weight: Option<Param<Tensor<B, 1>>>,
    bias: Option<Param<Tensor<B, 1>>>,
    eps: Ignored<f64>,
}

impl<B: Backend> CenteredNorm<B> {
    /// Create a new layer normalization
    ///
    /// # Arguments
    /// * `size` - Normalized (last) dimension
    /// * `eps` - Variance epsilon
    /// * `affine` - Whether to learn a scale and shift
    pub fn new(size: usize, eps: f64, affine: bool, device: &B::Device) -> Self {
        let (weight, bias) = if affine {
            (
                Some(Param::from_tensor(Tensor::ones([size], device))),
                Some(Param::from_tensor(Tensor::zeros([size], device))),
            )
        } else {
            (None, None)
        };
        Self { weight, bias, eps: Ignored(eps) }
    }

    pub fn is_affine(&self) -> bool {
        self.weight.is_some()
    }

    /// Forward pass for 3D tensor [batch, seq, hidden]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let mean = x.clone().mean_dim(2);
        let centered = x - mean;
        let variance = centered.clone().powf_scalar(2.0).mean_dim(2);
        let mut x = centered / (variance + self.eps.0).sqrt();

        if let Some(weight) = &self.weight {
            x = x * weight.val().unsqueeze_dims(&[0, 1]);
        }
        if let Some(bias) = &self.bias {
            x = x + bias.val().unsqueeze_dims(&[0, 1]);
        }
        x
    }
}
