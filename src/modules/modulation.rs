//! Timestep conditioning for Wan
//!
//! A scalar timestep becomes a sinusoidal embedding, an MLP turns that into
//! `t` [batch, dim], and a projection expands `t` into the six per-block
//! modulation vectors `t_mod` [batch, 6, dim].

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

/// Sinusoidal timestep embedding: `cat[cos(t * f_i), sin(t * f_i)]` with
/// `f_i = 10000^(-i / half)`
///
/// # Arguments
/// * `t` - Timesteps [batch] (raw diffusion timesteps, e.g. 0..1000)
/// * `dim` - Embedding width, must be even
pub fn sinusoidal_embedding<B: Backend>(t: Tensor<B, 1>, dim: usize) -> Tensor<B, 2> {
    let device = t.device();
    let half = dim / 2;

    let freqs: Vec<f32> = (0..half)
        .map(|i| 10000f64.powf(-(i as f64) / half as f64) as f32)
        .collect();
    let freqs = Tensor::<B, 1>::from_floats(freqs.as_slice(), &device);

    // [batch, half]
    let args = t.unsqueeze_dim::<2>(1) * freqs.unsqueeze_dim(0);
    Tensor::cat(vec![args.clone().cos(), args.sin()], 1)
}

/// Timestep embedder
///
/// Matches model: time_embedding.0 / time_embedding.2
/// (Linear, SiLU, Linear)
#[derive(Module, Debug)]
pub struct TimestepEmbedder<B: Backend> {
    /// time_embedding.0 [freq_dim -> dim]
    linear1: Linear<B>,
    /// time_embedding.2 [dim -> dim]
    linear2: Linear<B>,
    freq_dim: usize,
}

impl<B: Backend> TimestepEmbedder<B> {
    pub fn new(freq_dim: usize, dim: usize, device: &B::Device) -> Self {
        Self {
            linear1: LinearConfig::new(freq_dim, dim).with_bias(true).init(device),
            linear2: LinearConfig::new(dim, dim).with_bias(true).init(device),
            freq_dim,
        }
    }

    /// Convert timesteps to the embedding `t` [batch, dim]
    pub fn forward(&self, timestep: Tensor<B, 1>) -> Tensor<B, 2> {
        let x = sinusoidal_embedding(timestep, self.freq_dim);
        let x = silu(self.linear1.forward(x));
        self.linear2.forward(x)
    }
}

/// Projection of `t` into the per-block modulation tensor
///
/// Matches model: time_projection.1 (after SiLU)
#[derive(Module, Debug)]
pub struct TimeProjection<B: Backend> {
    linear: Linear<B>,
    dim: usize,
}

impl<B: Backend> TimeProjection<B> {
    pub fn new(dim: usize, device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(dim, 6 * dim).with_bias(true).init(device),
            dim,
        }
    }

    /// # Returns
    /// `t_mod` [batch, 6, dim]
    pub fn forward(&self, t: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, _] = t.dims();
        self.linear.forward(silu(t)).reshape([batch, 6, self.dim])
    }
}

/// The six modulation vectors of one block, each [batch, 1, dim]
#[derive(Debug, Clone)]
pub struct BlockModulation<B: Backend> {
    pub shift_msa: Tensor<B, 3>,
    pub scale_msa: Tensor<B, 3>,
    pub gate_msa: Tensor<B, 3>,
    pub shift_mlp: Tensor<B, 3>,
    pub scale_mlp: Tensor<B, 3>,
    pub gate_mlp: Tensor<B, 3>,
}

impl<B: Backend> BlockModulation<B> {
    /// Split a [batch, 6, dim] modulation tensor in checkpoint order
    pub fn split(modulation: Tensor<B, 3>) -> Self {
        let [batch, _, dim] = modulation.dims();
        let part = |i: usize| modulation.clone().slice([0..batch, i..i + 1, 0..dim]);

        Self {
            shift_msa: part(0),
            scale_msa: part(1),
            gate_msa: part(2),
            shift_mlp: part(3),
            scale_mlp: part(4),
            gate_mlp: part(5),
        }
    }
}

/// `x * (1 + scale) + shift`
pub fn modulate<B: Backend>(x: Tensor<B, 3>, shift: Tensor<B, 3>, scale: Tensor<B, 3>) -> Tensor<B, 3> {
    x * (scale + 1.0) + shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_sinusoidal_embedding_at_zero() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([0.0], &device);
        let emb = sinusoidal_embedding(t, 8).into_data().to_vec::<f32>().unwrap();
        // cos half first, then sin half
        assert_eq!(emb, vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_sinusoidal_embedding_first_frequency() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([2.0, 500.0], &device);
        let emb = sinusoidal_embedding(t, 16).into_data().to_vec::<f32>().unwrap();
        assert!((emb[0] - 2f32.cos()).abs() < 1e-5);
        assert!((emb[8] - 2f32.sin()).abs() < 1e-5);
        assert!((emb[16] - 500f32.cos()).abs() < 1e-4);
    }

    #[test]
    fn test_time_projection_shape() {
        let device = Default::default();
        let embedder = TimestepEmbedder::<TestBackend>::new(16, 12, &device);
        let projection = TimeProjection::<TestBackend>::new(12, &device);
        let t = embedder.forward(Tensor::from_floats([999.0, 10.0], &device));
        assert_eq!(t.dims(), [2, 12]);
        assert_eq!(projection.forward(t).dims(), [2, 6, 12]);
    }

    #[test]
    fn test_block_modulation_split_order() {
        let device = Default::default();
        let values: Vec<f32> = (0..6).flat_map(|i| [i as f32; 4]).collect();
        let modulation = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([1, 6, 4]);

        let parts = BlockModulation::split(modulation);
        let first = |t: Tensor<TestBackend, 3>| t.into_data().to_vec::<f32>().unwrap()[0];
        assert_eq!(parts.shift_msa.dims(), [1, 1, 4]);
        assert_eq!(first(parts.shift_msa), 0.0);
        assert_eq!(first(parts.gate_msa), 2.0);
        assert_eq!(first(parts.gate_mlp), 5.0);
    }
}
