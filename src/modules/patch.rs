//! Patch codec: video latents <-> token sequences
//!
//! Pure rearrangement, no learned weights. Tokens are ordered frame-major
//! (f, h, w) and each token carries its patch as `(pt, ph, pw, channels)`.
//! Intermediate tensors never exceed five dimensions so every backend can run
//! the codec.

use burn::prelude::*;

use crate::error::WanError;

/// Patch grid of a tokenized latent: (frames, height, width) in patches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    pub frames: usize,
    pub height: usize,
    pub width: usize,
}

impl PatchGrid {
    pub fn num_tokens(&self) -> usize {
        self.frames * self.height * self.width
    }
}

/// Non-overlapping 3D patch rearrangement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchCodec {
    patch_size: [usize; 3],
}

impl PatchCodec {
    /// Create a codec for a (frames, height, width) patch size
    pub fn new(patch_size: [usize; 3]) -> Self {
        Self { patch_size }
    }

    pub fn patch_size(&self) -> [usize; 3] {
        self.patch_size
    }

    /// Features per token for `channels` latent channels
    pub fn patch_dim(&self, channels: usize) -> usize {
        self.patch_size.iter().product::<usize>() * channels
    }

    /// Grid obtained by patchifying a (frames, height, width) volume
    pub fn grid(&self, frames: usize, height: usize, width: usize) -> Result<PatchGrid, WanError> {
        let [pt, ph, pw] = self.patch_size;
        if frames % pt != 0 || height % ph != 0 || width % pw != 0 {
            return Err(WanError::shape(
                "latent extent (multiple of patch size)",
                self.patch_size,
                [frames, height, width],
            ));
        }
        Ok(PatchGrid {
            frames: frames / pt,
            height: height / ph,
            width: width / pw,
        })
    }

    /// Split a latent into patch tokens
    ///
    /// # Arguments
    /// * `x` - Latents [batch, channels, frames, height, width]
    ///
    /// # Returns
    /// Tokens [batch, num_patches, pt * ph * pw * channels] and the patch grid
    pub fn patchify<B: Backend>(&self, x: Tensor<B, 5>) -> Result<(Tensor<B, 3>, PatchGrid), WanError> {
        let [batch, channels, frames, height, width] = x.dims();
        let grid = self.grid(frames, height, width)?;
        let [pt, ph, pw] = self.patch_size;
        let PatchGrid { frames: nf, height: nh, width: nw } = grid;

        // [B, F, H, W, C]
        let x = x.permute([0, 2, 3, 4, 1]);
        // [B*nf, pt, nh, ph, W*C] -> [B*nf, nh, pt, ph, W*C]
        let x = x
            .reshape([batch * nf, pt, nh, ph, width * channels])
            .permute([0, 2, 1, 3, 4]);
        // [B*nf*nh, pt*ph, nw, pw, C] -> [B*nf*nh, nw, pt*ph, pw, C]
        let x = x
            .reshape([batch * nf * nh, pt * ph, nw, pw, channels])
            .permute([0, 2, 1, 3, 4]);

        let tokens = x.reshape([batch, grid.num_tokens(), self.patch_dim(channels)]);
        Ok((tokens, grid))
    }

    /// Reassemble patch tokens into a latent
    ///
    /// # Arguments
    /// * `x` - Tokens [batch, num_patches, pt * ph * pw * channels]
    /// * `grid` - Grid returned by [`PatchCodec::patchify`]
    /// * `channels` - Latent channels per patch element
    pub fn unpatchify<B: Backend>(
        &self,
        x: Tensor<B, 3>,
        grid: PatchGrid,
        channels: usize,
    ) -> Result<Tensor<B, 5>, WanError> {
        let [batch, num_tokens, features] = x.dims();
        if num_tokens != grid.num_tokens() || features != self.patch_dim(channels) {
            return Err(WanError::shape(
                "patch tokens",
                [grid.num_tokens(), self.patch_dim(channels)],
                [num_tokens, features],
            ));
        }
        let [pt, ph, pw] = self.patch_size;
        let PatchGrid { frames: nf, height: nh, width: nw } = grid;
        let (frames, height, width) = (nf * pt, nh * ph, nw * pw);

        // [B*nf*nh, nw, pt*ph, pw, C] -> [B*nf*nh, pt*ph, nw, pw, C]
        let x = x
            .reshape([batch * nf * nh, nw, pt * ph, pw, channels])
            .permute([0, 2, 1, 3, 4]);
        // [B*nf, nh, pt, ph, W*C] -> [B*nf, pt, nh, ph, W*C]
        let x = x
            .reshape([batch * nf, nh, pt, ph, width * channels])
            .permute([0, 2, 1, 3, 4]);

        Ok(x
            .reshape([batch, frames, height, width, channels])
            .permute([0, 4, 1, 2, 3]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn roundtrip(patch_size: [usize; 3], shape: [usize; 5]) {
        let device = Default::default();
        let codec = PatchCodec::new(patch_size);
        let x = Tensor::<TestBackend, 5>::random(shape, Distribution::Normal(0.0, 1.0), &device);

        let (tokens, grid) = codec.patchify(x.clone()).unwrap();
        assert_eq!(tokens.dims()[1], grid.num_tokens());
        let restored = codec.unpatchify(tokens, grid, shape[1]).unwrap();

        assert_eq!(restored.dims(), shape);
        assert_eq!(
            restored.into_data().to_vec::<f32>().unwrap(),
            x.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_roundtrip_patch_sizes() {
        roundtrip([1, 2, 2], [2, 4, 3, 4, 6]);
        roundtrip([2, 2, 2], [1, 3, 4, 4, 2]);
        roundtrip([1, 1, 1], [1, 2, 2, 3, 3]);
        roundtrip([2, 1, 3], [2, 2, 4, 2, 6]);
    }

    #[test]
    fn test_token_layout() {
        let device = Default::default();
        let codec = PatchCodec::new([1, 2, 2]);
        // Single channel, one frame, 2x4 image with values 0..8
        let x = Tensor::<TestBackend, 1>::from_floats(
            [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
            &device,
        )
        .reshape([1, 1, 1, 2, 4]);

        let (tokens, grid) = codec.patchify(x).unwrap();
        assert_eq!(grid, PatchGrid { frames: 1, height: 1, width: 2 });
        let values = tokens.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0]);
    }

    #[test]
    fn test_indivisible_extent_rejected() {
        let device = Default::default();
        let codec = PatchCodec::new([1, 2, 2]);
        let x = Tensor::<TestBackend, 5>::zeros([1, 4, 2, 3, 4], &device);
        assert!(matches!(codec.patchify(x), Err(WanError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_grid_mismatch_rejected() {
        let device = Default::default();
        let codec = PatchCodec::new([1, 2, 2]);
        let tokens = Tensor::<TestBackend, 3>::zeros([1, 6, 16], &device);
        let grid = PatchGrid { frames: 1, height: 2, width: 2 };
        assert!(codec.unpatchify(tokens, grid, 4).is_err());
    }
}
