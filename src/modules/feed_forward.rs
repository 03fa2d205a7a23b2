//! Feed-forward network for Wan blocks

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// GELU with the tanh approximation
///
/// gelu(x) = 0.5 x (1 + tanh(sqrt(2/pi) (x + 0.044715 x^3)))
pub fn gelu_tanh<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let sqrt_2_over_pi = (2.0 / std::f64::consts::PI).sqrt();
    let cube = x.clone() * x.clone() * x.clone();
    let inner = (x.clone() + cube * 0.044715) * sqrt_2_over_pi;
    x * (inner.tanh() + 1.0) * 0.5
}

/// Two-layer MLP: fc2(gelu_tanh(fc1(x)))
///
/// Checkpoint names: blocks.N.ffn.0 / blocks.N.ffn.2
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    /// Up projection [dim -> ffn_dim]
    fc1: Linear<B>,
    /// Down projection [ffn_dim -> dim]
    fc2: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(dim: usize, ffn_dim: usize, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(dim, ffn_dim).with_bias(true).init(device),
            fc2: LinearConfig::new(ffn_dim, dim).with_bias(true).init(device),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.fc2.forward(gelu_tanh(self.fc1.forward(x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_gelu_tanh_reference_values() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-3.0, -1.0, 0.0, 1.0, 3.0], &device);
        let y = gelu_tanh(x).into_data().to_vec::<f32>().unwrap();
        let expected = [-0.003637, -0.158808, 0.0, 0.841192, 2.996363];
        for (got, want) in y.iter().zip(expected) {
            assert!((got - want).abs() < 1e-4, "{got} vs {want}");
        }
    }

    #[test]
    fn test_feed_forward_shape() {
        let device = Default::default();
        let ffn = FeedForward::<TestBackend>::new(8, 20, &device);
        let x = Tensor::<TestBackend, 3>::zeros([2, 3, 8], &device);
        assert_eq!(ffn.forward(x).dims(), [2, 3, 8]);
    }
}
