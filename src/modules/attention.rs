//! Attention modules for Wan
//!
//! Self-attention over spatial-temporal tokens with 3D RoPE, and
//! cross-attention to the text context (plus the CLIP image prefix for
//! image-to-video models).
//!
//! Supports memory-efficient sliced attention for large sequences.

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;

use super::normalization::RmsNorm;
use super::rope::{apply_rotary, RopeFreqs};
use crate::config::IMAGE_CONTEXT_LEN;

/// Multi-head scaled dot-product attention
///
/// # Arguments
/// * `q` - Queries [batch, q_len, num_heads * head_dim]
/// * `k` - Keys [batch, kv_len, num_heads * head_dim]
/// * `v` - Values [batch, kv_len, num_heads * head_dim]
/// * `num_heads` - Number of attention heads
/// * `slice_size` - Query chunk size (0 = full attention)
///
/// # Returns
/// Head-merged output [batch, q_len, num_heads * head_dim]
pub fn attention<B: Backend>(
    q: Tensor<B, 3>,
    k: Tensor<B, 3>,
    v: Tensor<B, 3>,
    num_heads: usize,
    slice_size: usize,
) -> Tensor<B, 3> {
    let [batch, q_len, width] = q.dims();
    let [_, kv_len, _] = k.dims();
    let head_dim = width / num_heads;
    let scale = 1.0 / (head_dim as f64).sqrt();

    // [batch, num_heads, seq, head_dim]
    let q = q.reshape([batch, q_len, num_heads, head_dim]).swap_dims(1, 2);
    let k = k.reshape([batch, kv_len, num_heads, head_dim]).swap_dims(1, 2);
    let v = v.reshape([batch, kv_len, num_heads, head_dim]).swap_dims(1, 2);

    let out = if slice_size > 0 && q_len > slice_size {
        sliced_attention(q, k, v, scale, slice_size)
    } else {
        full_attention(q, k, v, scale)
    };

    out.swap_dims(1, 2).reshape([batch, q_len, width])
}

fn full_attention<B: Backend>(q: Tensor<B, 4>, k: Tensor<B, 4>, v: Tensor<B, 4>, scale: f64) -> Tensor<B, 4> {
    let attn = q.matmul(k.transpose()) * scale;
    softmax(attn, 3).matmul(v)
}

/// Attention in query chunks to bound the size of the score matrix
fn sliced_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    scale: f64,
    slice_size: usize,
) -> Tensor<B, 4> {
    let [batch, num_heads, seq_len, head_dim] = q.dims();
    let k_t = k.transpose();

    let outputs: Vec<Tensor<B, 4>> = (0..seq_len)
        .step_by(slice_size)
        .map(|start| {
            let end = (start + slice_size).min(seq_len);
            let q_slice = q
                .clone()
                .slice([0..batch, 0..num_heads, start..end, 0..head_dim]);
            let attn = q_slice.matmul(k_t.clone()) * scale;
            softmax(attn, 3).matmul(v.clone())
        })
        .collect();

    Tensor::cat(outputs, 2)
}

/// 3D Self-Attention
///
/// Matches model: blocks.N.self_attn.{q,k,v,o,norm_q,norm_k}
#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    q: Linear<B>,
    k: Linear<B>,
    v: Linear<B>,
    o: Linear<B>,
    /// RMSNorm over the full query width
    norm_q: RmsNorm<B>,
    /// RMSNorm over the full key width
    norm_k: RmsNorm<B>,
    num_heads: usize,
    slice_size: usize,
}

impl<B: Backend> SelfAttention<B> {
    pub fn new(dim: usize, num_heads: usize, eps: f64, slice_size: usize, device: &B::Device) -> Self {
        Self {
            q: LinearConfig::new(dim, dim).with_bias(true).init(device),
            k: LinearConfig::new(dim, dim).with_bias(true).init(device),
            v: LinearConfig::new(dim, dim).with_bias(true).init(device),
            o: LinearConfig::new(dim, dim).with_bias(true).init(device),
            norm_q: RmsNorm::new(dim, eps, device),
            norm_k: RmsNorm::new(dim, eps, device),
            num_heads,
            slice_size,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tokens [batch, seq_len, dim]
    /// * `freqs` - Rotary tables gathered for the token grid
    pub fn forward(&self, x: Tensor<B, 3>, freqs: &RopeFreqs<B>) -> Tensor<B, 3> {
        let q = self.norm_q.forward(self.q.forward(x.clone()));
        let k = self.norm_k.forward(self.k.forward(x.clone()));
        let v = self.v.forward(x);

        let q = apply_rotary(q, freqs, self.num_heads);
        let k = apply_rotary(k, freqs, self.num_heads);

        let out = attention(q, k, v, self.num_heads, self.slice_size);
        self.o.forward(out)
    }
}

/// Key/value projections for the CLIP image prefix
///
/// Matches model: blocks.N.cross_attn.{k_img,v_img,norm_k_img}
#[derive(Module, Debug)]
pub struct ImageKeyValue<B: Backend> {
    k_img: Linear<B>,
    v_img: Linear<B>,
    norm_k_img: RmsNorm<B>,
}

/// Cross-Attention for text (and image) conditioning
///
/// Queries come from video tokens, keys/values from the projected context.
#[derive(Module, Debug)]
pub struct CrossAttention<B: Backend> {
    q: Linear<B>,
    k: Linear<B>,
    v: Linear<B>,
    o: Linear<B>,
    norm_q: RmsNorm<B>,
    norm_k: RmsNorm<B>,
    /// Present only for image-conditioned models
    image: Option<ImageKeyValue<B>>,
    num_heads: usize,
    slice_size: usize,
}

impl<B: Backend> CrossAttention<B> {
    pub fn new(
        dim: usize,
        num_heads: usize,
        eps: f64,
        has_image_input: bool,
        slice_size: usize,
        device: &B::Device,
    ) -> Self {
        let image = has_image_input.then(|| ImageKeyValue {
            k_img: LinearConfig::new(dim, dim).with_bias(true).init(device),
            v_img: LinearConfig::new(dim, dim).with_bias(true).init(device),
            norm_k_img: RmsNorm::new(dim, eps, device),
        });

        Self {
            q: LinearConfig::new(dim, dim).with_bias(true).init(device),
            k: LinearConfig::new(dim, dim).with_bias(true).init(device),
            v: LinearConfig::new(dim, dim).with_bias(true).init(device),
            o: LinearConfig::new(dim, dim).with_bias(true).init(device),
            norm_q: RmsNorm::new(dim, eps, device),
            norm_k: RmsNorm::new(dim, eps, device),
            image,
            num_heads,
            slice_size,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Video tokens [batch, video_seq_len, dim]
    /// * `context` - Projected context [batch, context_len, dim]; for image
    ///   models the first 257 tokens are the image prefix
    pub fn forward(&self, x: Tensor<B, 3>, context: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, context_len, dim] = context.dims();
        let (image_context, text_context) = match &self.image {
            Some(_) => (
                Some(context.clone().slice([0..batch, 0..IMAGE_CONTEXT_LEN, 0..dim])),
                context.slice([0..batch, IMAGE_CONTEXT_LEN..context_len, 0..dim]),
            ),
            None => (None, context),
        };

        let q = self.norm_q.forward(self.q.forward(x));
        let k = self.norm_k.forward(self.k.forward(text_context.clone()));
        let v = self.v.forward(text_context);
        let mut out = attention(q.clone(), k, v, self.num_heads, self.slice_size);

        if let (Some(image), Some(image_context)) = (&self.image, image_context) {
            let k_img = image.norm_k_img.forward(image.k_img.forward(image_context.clone()));
            let v_img = image.v_img.forward(image_context);
            out = out + attention(q, k_img, v_img, self.num_heads, self.slice_size);
        }

        self.o.forward(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::rope::RopeTables;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn random(shape: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn test_sliced_matches_full() {
        let q = random([2, 13, 8]);
        let k = random([2, 13, 8]);
        let v = random([2, 13, 8]);

        let full = attention(q.clone(), k.clone(), v.clone(), 2, 0);
        for slice_size in [1, 4, 5, 13] {
            let sliced = attention(q.clone(), k.clone(), v.clone(), 2, slice_size);
            let diff: f32 = (sliced - full.clone()).abs().max().into_scalar();
            assert!(diff < 1e-5, "slice {slice_size}: {diff}");
        }
    }

    #[test]
    fn test_uniform_keys_average_values() {
        let device = Default::default();
        let q = random([1, 3, 4]);
        let k = Tensor::<TestBackend, 3>::zeros([1, 5, 4], &device);
        let v = random([1, 5, 4]);

        let out = attention(q, k, v.clone(), 1, 0);
        let mean = v.mean_dim(1).repeat(&[1, 3, 1]);
        let diff: f32 = (out - mean).abs().max().into_scalar();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_self_attention_shape() {
        let device = Default::default();
        let attn = SelfAttention::<TestBackend>::new(48, 2, 1e-6, 0, &device);
        let freqs = RopeTables::new(24, 16, 10000.0)
            .unwrap()
            .gather(1, 2, 3, &device)
            .unwrap();
        assert_eq!(attn.forward(random([1, 6, 48]), &freqs).dims(), [1, 6, 48]);
    }

    #[test]
    fn test_cross_attention_with_image_prefix() {
        let device = Default::default();
        let attn = CrossAttention::<TestBackend>::new(16, 2, 1e-6, true, 0, &device);
        let context = random([1, IMAGE_CONTEXT_LEN + 4, 16]);
        assert_eq!(attn.forward(random([1, 6, 16]), context).dims(), [1, 6, 16]);
    }
}
