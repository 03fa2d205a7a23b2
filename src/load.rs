//! Weight loading utilities for Wan DiT models.

use std::path::PathBuf;

use burn::{
    prelude::Backend,
    store::{BurnpackStore, ModuleStore, PyTorchToBurnAdapter, SafetensorsStore},
};
use thiserror::Error;
use tracing::info;

use crate::modules::dit::WanDiT;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("Error while loading weights: {0}")]
    LoadError(String),
    #[error("Unrecognised file extension: {0}")]
    UnknownExtension(String),
}

/// Checkpoint key patterns and their place in this crate's module tree
///
/// Sequential indices of the PyTorch model become named fields:
/// - time_embedding.0/2 -> time_embedding.linear1/linear2
/// - time_projection.1 -> time_projection.linear
/// - text_embedding.0/2 -> text_embedding.linear1/linear2
/// - img_emb.proj.0/1/3/4 -> img_emb.norm_in/linear1/linear2/norm_out
/// - blocks.X.ffn.0/2 -> blocks.X.ffn.fc1/fc2
/// - blocks.X.cross_attn.{k_img,v_img,norm_k_img} -> blocks.X.cross_attn.image.*
///
/// Everything else (attention projections, norms, modulation offsets, head,
/// patch embedding) already matches.
const KEY_REMAPPING: [(&str, &str); 12] = [
    (r"^time_embedding\.0\.", "time_embedding.linear1."),
    (r"^time_embedding\.2\.", "time_embedding.linear2."),
    (r"^time_projection\.1\.", "time_projection.linear."),
    (r"^text_embedding\.0\.", "text_embedding.linear1."),
    (r"^text_embedding\.2\.", "text_embedding.linear2."),
    (r"^img_emb\.proj\.0\.", "img_emb.norm_in."),
    (r"^img_emb\.proj\.1\.", "img_emb.linear1."),
    (r"^img_emb\.proj\.3\.", "img_emb.linear2."),
    (r"^img_emb\.proj\.4\.", "img_emb.norm_out."),
    (r"^blocks\.(\d+)\.ffn\.0\.", "blocks.$1.ffn.fc1."),
    (r"^blocks\.(\d+)\.ffn\.2\.", "blocks.$1.ffn.fc2."),
    (
        r"^blocks\.(\d+)\.cross_attn\.(k_img|v_img|norm_k_img)\.",
        "blocks.$1.cross_attn.image.$2.",
    ),
];

/// Create a SafetensorsStore with Wan checkpoint key remapping
fn create_safetensors_store(path: PathBuf) -> SafetensorsStore {
    KEY_REMAPPING.iter().fold(
        SafetensorsStore::from_file(path).with_from_adapter(PyTorchToBurnAdapter::default()),
        |store, &(from, to)| store.with_key_remapping(from, to),
    )
}

impl<B: Backend> WanDiT<B> {
    /// Load weights and return self (builder pattern)
    pub fn with_weights(mut self, path: impl Into<PathBuf>) -> Result<Self, ModelLoadError> {
        self.load_weights(path)?;
        Ok(self)
    }

    /// Load weights from a file
    ///
    /// Supports:
    /// - `.safetensors` - Wan 2.1 release format
    /// - `.bpk` - Burn native format
    pub fn load_weights(&mut self, path: impl Into<PathBuf>) -> Result<(), ModelLoadError> {
        let path = path.into();
        let extension = path.extension().map(|s| s.to_string_lossy().to_lowercase());

        match extension.as_deref() {
            Some("safetensors") => {
                info!(path = %path.display(), "loading Wan DiT weights from safetensors");
                let mut weights = create_safetensors_store(path);
                weights
                    .apply_to(self)
                    .map_err(|e| ModelLoadError::LoadError(e.to_string()))?;
            }
            Some("bpk") | None => {
                info!(path = %path.display(), "loading Wan DiT weights from bpk");
                let mut weights = BurnpackStore::from_file(path).auto_extension(false);
                weights
                    .apply_to(self)
                    .map_err(|e| ModelLoadError::LoadError(e.to_string()))?;
            }
            Some(other) => {
                return Err(ModelLoadError::UnknownExtension(other.to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WanConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn tiny_model() -> WanDiT<TestBackend> {
        WanConfig::new()
            .with_dim(24)
            .with_ffn_dim(16)
            .with_num_heads(1)
            .with_num_layers(1)
            .with_text_dim(8)
            .with_freq_dim(8)
            .with_in_dim(4)
            .with_out_dim(4)
            .with_rope_max_len(4)
            .init(&Default::default())
            .unwrap()
    }

    #[test]
    fn test_unknown_extension() {
        let mut model = tiny_model();
        let err = model.load_weights("model.pt").unwrap_err();
        assert!(matches!(err, ModelLoadError::UnknownExtension(ref ext) if ext == "pt"));
    }

    #[test]
    fn test_missing_burnpack_file_is_a_load_error() {
        let mut model = tiny_model();
        let path = std::env::temp_dir().join("wan-burn-missing-weights.bpk");
        let err = model.load_weights(path).unwrap_err();
        assert!(matches!(err, ModelLoadError::LoadError(_)));
    }
}
