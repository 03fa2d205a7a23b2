//! 3D Rotary Position Embedding (RoPE) for Wan
//!
//! The head dimension is split across the time, height and width axes. Each
//! axis owns a table of rotation angles indexed by position; a token at grid
//! coordinate (f, h, w) concatenates the three rows. Channels are rotated in
//! adjacent pairs `(x[2i], x[2i + 1])`.

use burn::prelude::*;

use crate::error::WanError;

/// Channel split of a head across (time, height, width)
///
/// Height and width get `d / 3` channels each, time gets the remainder.
pub fn axis_dims(head_dim: usize) -> [usize; 3] {
    let spatial = head_dim / 3;
    [head_dim - 2 * spatial, spatial, spatial]
}

/// Rotation angles of one axis, host-side: [max_len * axis_dim / 2]
#[derive(Debug, Clone)]
struct AxisTable {
    cos: Vec<f32>,
    sin: Vec<f32>,
    half: usize,
}

impl AxisTable {
    fn new(dim: usize, max_len: usize, theta: f64) -> Self {
        let half = dim / 2;
        let inv_freq: Vec<f64> = (0..half)
            .map(|i| 1.0 / theta.powf((2 * i) as f64 / dim as f64))
            .collect();

        let mut cos = Vec::with_capacity(max_len * half);
        let mut sin = Vec::with_capacity(max_len * half);
        for pos in 0..max_len {
            for freq in &inv_freq {
                let angle = pos as f64 * freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }

        Self { cos, sin, half }
    }

    fn row(&self, pos: usize) -> std::ops::Range<usize> {
        pos * self.half..(pos + 1) * self.half
    }
}

/// Precomputed per-axis rotary tables, built once per model
///
/// Note: This is not a Module as it has no learnable parameters. Tables stay
/// on the host and are uploaded per grid in [`RopeTables::gather`], so the
/// model can move between devices without them.
#[derive(Debug, Clone)]
pub struct RopeTables {
    axes: [AxisTable; 3],
    axis_dims: [usize; 3],
    max_len: usize,
}

impl RopeTables {
    /// Build the three axis tables
    ///
    /// # Arguments
    /// * `head_dim` - Attention head dimension (e.g., 128)
    /// * `max_len` - Positions covered per axis
    /// * `theta` - Base frequency (default: 10000.0)
    pub fn new(head_dim: usize, max_len: usize, theta: f64) -> Result<Self, WanError> {
        let axis_dims = axis_dims(head_dim);
        if axis_dims.iter().any(|d| d % 2 != 0) {
            return Err(WanError::InvalidConfig(format!(
                "head_dim {} splits into odd rotary axes {:?}",
                head_dim, axis_dims
            )));
        }

        let axes = axis_dims.map(|dim| AxisTable::new(dim, max_len, theta));
        Ok(Self {
            axes,
            axis_dims,
            max_len,
        })
    }

    pub fn axis_dims(&self) -> [usize; 3] {
        self.axis_dims
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Per-token tables for a (frames, height, width) patch grid, in
    /// frame-major token order
    pub fn gather<B: Backend>(
        &self,
        frames: usize,
        height: usize,
        width: usize,
        device: &B::Device,
    ) -> Result<RopeFreqs<B>, WanError> {
        let extent = [frames, height, width];
        if extent.iter().any(|&n| n > self.max_len) {
            return Err(WanError::shape("rope grid", [self.max_len; 3], extent));
        }

        let seq_len = frames * height * width;
        let half: usize = self.axis_dims.iter().sum::<usize>() / 2;
        let mut cos = Vec::with_capacity(seq_len * half);
        let mut sin = Vec::with_capacity(seq_len * half);

        for f in 0..frames {
            for h in 0..height {
                for w in 0..width {
                    for (table, pos) in self.axes.iter().zip([f, h, w]) {
                        cos.extend_from_slice(&table.cos[table.row(pos)]);
                        sin.extend_from_slice(&table.sin[table.row(pos)]);
                    }
                }
            }
        }

        Ok(RopeFreqs {
            cos: Tensor::<B, 1>::from_floats(cos.as_slice(), device).reshape([seq_len, half]),
            sin: Tensor::<B, 1>::from_floats(sin.as_slice(), device).reshape([seq_len, half]),
        })
    }
}

/// Rotation tables for one token sequence
#[derive(Debug, Clone)]
pub struct RopeFreqs<B: Backend> {
    /// Cosines [seq_len, head_dim/2]
    pub cos: Tensor<B, 2>,
    /// Sines [seq_len, head_dim/2]
    pub sin: Tensor<B, 2>,
}

impl<B: Backend> RopeFreqs<B> {
    /// The inverse rotation
    pub fn conjugate(&self) -> Self {
        Self {
            cos: self.cos.clone(),
            sin: self.sin.clone().neg(),
        }
    }

    pub fn seq_len(&self) -> usize {
        self.cos.dims()[0]
    }
}

/// Rotate adjacent channel pairs of every head
///
/// # Arguments
/// * `x` - Projected queries or keys [batch, seq_len, num_heads * head_dim]
/// * `freqs` - Tables for the same sequence
/// * `num_heads` - Number of attention heads
pub fn apply_rotary<B: Backend>(x: Tensor<B, 3>, freqs: &RopeFreqs<B>, num_heads: usize) -> Tensor<B, 3> {
    let [batch, seq, width] = x.dims();
    let half = width / num_heads / 2;

    let x = x.reshape([batch, seq, num_heads, half, 2]);
    let re = x
        .clone()
        .slice([0..batch, 0..seq, 0..num_heads, 0..half, 0..1])
        .reshape([batch, seq, num_heads, half]);
    let im = x
        .slice([0..batch, 0..seq, 0..num_heads, 0..half, 1..2])
        .reshape([batch, seq, num_heads, half]);

    let cos = freqs.cos.clone().reshape([1, seq, 1, half]);
    let sin = freqs.sin.clone().reshape([1, seq, 1, half]);

    // (a + ib)(cos + i sin)
    let out_re = re.clone() * cos.clone() - im.clone() * sin.clone();
    let out_im = re * sin + im * cos;

    Tensor::stack::<5>(vec![out_re, out_im], 4).reshape([batch, seq, width])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn values(t: Tensor<TestBackend, 2>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_axis_split() {
        assert_eq!(axis_dims(128), [44, 42, 42]);
        assert_eq!(axis_dims(24), [8, 8, 8]);
        assert_eq!(axis_dims(128).iter().sum::<usize>(), 128);
    }

    #[test]
    fn test_odd_axis_rejected() {
        assert!(RopeTables::new(10, 8, 10000.0).is_err());
    }

    #[test]
    fn test_position_zero_is_identity() {
        let device = Default::default();
        let tables = RopeTables::new(24, 16, 10000.0).unwrap();
        let freqs = tables.gather::<TestBackend>(1, 1, 1, &device).unwrap();
        assert!(values(freqs.cos).iter().all(|c| (c - 1.0).abs() < 1e-6));
        assert!(values(freqs.sin).iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn test_rotations_have_unit_magnitude() {
        let device = Default::default();
        let tables = RopeTables::new(24, 32, 10000.0).unwrap();
        let freqs = tables.gather::<TestBackend>(3, 5, 7, &device).unwrap();
        let magnitude = freqs.cos.clone().powf_scalar(2.0) + freqs.sin.clone().powf_scalar(2.0);
        assert!(values(magnitude).iter().all(|m| (m - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_gather_layout() {
        let device = Default::default();
        let tables = RopeTables::new(24, 16, 10000.0).unwrap();
        let (f, h, w) = (2, 3, 4);
        let freqs = tables.gather::<TestBackend>(f, h, w, &device).unwrap();
        assert_eq!(freqs.cos.dims(), [f * h * w, 12]);

        // First channel of each axis turns one radian per position
        let sin = values(freqs.sin);
        for fi in 0..f {
            for hi in 0..h {
                for wi in 0..w {
                    let row = &sin[((fi * h + hi) * w + wi) * 12..][..12];
                    assert!((row[0] - (fi as f32).sin()).abs() < 1e-5);
                    assert!((row[4] - (hi as f32).sin()).abs() < 1e-5);
                    assert!((row[8] - (wi as f32).sin()).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_gather_out_of_range() {
        let device = Default::default();
        let tables = RopeTables::new(24, 8, 10000.0).unwrap();
        assert!(matches!(
            tables.gather::<TestBackend>(9, 1, 1, &device),
            Err(WanError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_conjugate_rotation_restores_input() {
        let device = Default::default();
        let tables = RopeTables::new(24, 64, 10000.0).unwrap();
        let freqs = tables.gather::<TestBackend>(4, 6, 5, &device).unwrap();
        let seq = freqs.seq_len();

        let x = Tensor::<TestBackend, 3>::random([2, seq, 2 * 24], Distribution::Normal(0.0, 1.0), &device);
        let rotated = apply_rotary(x.clone(), &freqs, 2);
        let restored = apply_rotary(rotated.clone(), &freqs.conjugate(), 2);

        let max_err: f32 = (restored - x.clone()).abs().max().into_scalar();
        assert!(max_err < 1e-4, "max error {max_err}");

        // Rotation is not the identity away from the origin
        let moved: f32 = (rotated - x).abs().max().into_scalar();
        assert!(moved > 1e-3);
    }

    #[test]
    fn test_rotary_pairs_adjacent_channels() {
        let device = Default::default();
        let freqs = RopeFreqs::<TestBackend> {
            cos: Tensor::from_floats([[0.0, 1.0]], &device),
            sin: Tensor::from_floats([[1.0, 0.0]], &device),
        };
        // One head of width 4: pair (1, 2) rotated by 90 degrees, pair (3, 4) untouched
        let x = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0, 3.0, 4.0]]], &device);
        let out = apply_rotary(x, &freqs, 1).into_data().to_vec::<f32>().unwrap();
        assert_eq!(out, vec![-2.0, 1.0, 3.0, 4.0]);
    }
}
