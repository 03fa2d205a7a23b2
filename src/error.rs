//! Error types for the Wan DiT

use thiserror::Error;

use crate::cache::Branch;
use crate::load::ModelLoadError;

#[derive(Error, Debug)]
pub enum WanError {
    #[error("Unsupported model variant: {0}")]
    UnknownVariant(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error("Image conditioning is enabled but image features or image latent are missing")]
    MissingImageInput,
    #[error("Image inputs were given to a model built without image conditioning")]
    UnexpectedImageInput,
    #[error("Step cache asked to skip on the {branch} branch before any residual was recorded")]
    MissingResidual { branch: Branch },
    #[error(transparent)]
    Load(#[from] ModelLoadError),
}

impl WanError {
    pub(crate) fn shape(
        what: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            what,
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}
