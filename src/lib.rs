//! Wan 2.1 Video Diffusion Transformer in Burn
//!
//! The denoising transformer of the Wan video generator, with an adaptive
//! step cache that skips the block stack when the time conditioning barely
//! changes between sampling steps.
//!
//! ## Architecture
//!
//! - **DiT**: 30 (1.3B) or 40 (14B) transformer blocks over 1x2x2 latent patches
//! - **Attention**: 3D RoPE self-attention, cross-attention to UMT5 text states
//!   and, for image-to-video, to projected CLIP image features
//! - **Conditioning**: sinusoidal timestep embedding expanded into six
//!   per-block shift/scale/gate vectors
//! - **Step cache**: separate conditional/unconditional tracks, calibrated
//!   polynomial drift estimate, threshold skip decision
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wan_burn::{DiTInput, WanBuilder};
//!
//! let (model, mut cache) = WanBuilder::<Backend>::new(device)
//!     .with_variant("14b-t2v")
//!     .with_num_inference_steps(40)
//!     .with_threshold(0.2)
//!     .with_weights("wan2.1_t2v_14b.safetensors")
//!     .build()?;
//!
//! for timestep in timesteps {
//!     let cond = model.forward(DiTInput::new(latent.clone(), prompt.clone(), timestep.clone(), 81), &mut cache)?;
//!     let uncond = model.forward(DiTInput::new(latent.clone(), negative.clone(), timestep, 81), &mut cache)?;
//!     // guidance and scheduler update happen in the sampler
//! }
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod load;
pub mod modules;

// Re-export main types
pub use builder::WanBuilder;
pub use cache::{Branch, CacheDecision, CacheTrack, RescalePolynomial, StepCache, StepCacheConfig};
pub use config::{CacheReference, ModelVariant, WanConfig, IMAGE_CONTEXT_LEN};
pub use error::WanError;
pub use load::ModelLoadError;
pub use modules::dit::{BlockSkip, DiTInput, WanDiT};
pub use modules::patch::{PatchCodec, PatchGrid};
