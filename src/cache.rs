//! Adaptive step cache for the DiT block stack
//!
//! Consecutive diffusion steps produce highly correlated block-stack outputs
//! when the time conditioning barely moves. The cache tracks how far the
//! conditioning has drifted since the last full computation and, while the
//! calibrated drift stays under a threshold, replaces the whole block stack
//! with the residual (`output - input`) recorded at that computation.
//!
//! Classifier-free guidance calls the model twice per step, so two tracks are
//! kept: even invocations belong to the conditional branch and odd ones to the
//! unconditional branch. The parity comes from the invocation count alone; the
//! sampler must strictly alternate conditional and unconditional calls.
//!
//! A [`StepCache`] is a session for exactly one sampling run. Call
//! [`StepCache::reset`] (or build a new one) before starting another run,
//! otherwise residuals from the previous video leak into the next.

use std::fmt;

use burn::prelude::*;
use burn::tensor::ElementConversion;
use tracing::{debug, warn};

use crate::config::{CacheReference, ModelVariant};
use crate::error::WanError;

/// Guidance branch owning a cache track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    /// Even invocations
    Conditional,
    /// Odd invocations
    Unconditional,
}

impl Branch {
    /// Branch for an invocation index
    pub fn from_step(step: usize) -> Self {
        if step % 2 == 0 {
            Self::Conditional
        } else {
            Self::Unconditional
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Conditional => 0,
            Self::Unconditional => 1,
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conditional => f.write_str("conditional"),
            Self::Unconditional => f.write_str("unconditional"),
        }
    }
}

/// Outcome of one cache step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    /// The block stack was executed and its residual recorded
    Run,
    /// The recorded residual was added instead of running the blocks
    Skip,
}

/// Degree-4 polynomial mapping raw relative distance to calibrated drift
///
/// Coefficients are ordered highest power first:
/// `c0*x^4 + c1*x^3 + c2*x^2 + c3*x + c4`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RescalePolynomial {
    coefficients: [f64; 5],
}

impl RescalePolynomial {
    pub fn new(coefficients: [f64; 5]) -> Self {
        Self { coefficients }
    }

    pub fn coefficients(&self) -> &[f64; 5] {
        &self.coefficients
    }

    /// Evaluate with Horner's scheme
    pub fn eval(&self, x: f64) -> f64 {
        self.coefficients.iter().fold(0.0, |acc, &c| acc * x + c)
    }
}

/// Configuration of a [`StepCache`] session
#[derive(Debug, Clone)]
pub struct StepCacheConfig {
    /// Sampling steps of the run; the cache sees twice as many invocations
    pub num_inference_steps: usize,
    /// Accumulated drift below which a step is skipped
    pub threshold: f64,
    /// Quantity compared between steps
    pub reference: CacheReference,
    /// Invocations at the start that always run in full
    pub ret_steps: usize,
    /// Invocation index from which every step runs in full
    pub cutoff_steps: usize,
    /// Rescaling polynomial coefficients, highest power first
    pub coefficients: [f64; 5],
    variant: ModelVariant,
}

impl StepCacheConfig {
    /// Calibrated settings for a released checkpoint, comparing modulation tensors
    pub fn for_variant(variant: ModelVariant, num_inference_steps: usize, threshold: f64) -> Self {
        let reference = CacheReference::Modulation;
        Self {
            num_inference_steps,
            threshold,
            reference,
            ret_steps: variant.ret_steps(reference),
            cutoff_steps: variant.cutoff_steps(reference, num_inference_steps),
            coefficients: variant.rescale_coefficients(reference),
            variant,
        }
    }

    /// Switch the compared quantity, reloading the matching calibration
    pub fn with_reference(mut self, reference: CacheReference) -> Self {
        self.reference = reference;
        self.ret_steps = self.variant.ret_steps(reference);
        self.cutoff_steps = self.variant.cutoff_steps(reference, self.num_inference_steps);
        self.coefficients = self.variant.rescale_coefficients(reference);
        self
    }

    pub fn with_ret_steps(mut self, ret_steps: usize) -> Self {
        self.ret_steps = ret_steps;
        self
    }

    pub fn with_cutoff_steps(mut self, cutoff_steps: usize) -> Self {
        self.cutoff_steps = cutoff_steps;
        self
    }

    pub fn with_coefficients(mut self, coefficients: [f64; 5]) -> Self {
        self.coefficients = coefficients;
        self
    }

    /// Checkpoint the calibration came from
    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    /// Invocations in one run (both branches)
    pub fn total_steps(&self) -> usize {
        self.num_inference_steps * 2
    }

    pub fn validate(&self) -> Result<(), WanError> {
        if self.num_inference_steps == 0 {
            return Err(WanError::InvalidConfig(
                "num_inference_steps must be at least 1".into(),
            ));
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(WanError::InvalidConfig(format!(
                "cache threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }
        if self.cutoff_steps > self.total_steps() {
            return Err(WanError::InvalidConfig(format!(
                "cutoff_steps {} exceeds the {} invocations of a run",
                self.cutoff_steps,
                self.total_steps()
            )));
        }
        if self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(WanError::InvalidConfig(
                "rescale coefficients must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// Per-branch cache state
#[derive(Debug, Clone)]
pub struct CacheTrack<B: Backend> {
    accumulated_distance: f64,
    previous_reference: Option<Tensor<B, 2>>,
    previous_residual: Option<Tensor<B, 3>>,
}

impl<B: Backend> Default for CacheTrack<B> {
    fn default() -> Self {
        Self {
            accumulated_distance: 0.0,
            previous_reference: None,
            previous_residual: None,
        }
    }
}

impl<B: Backend> CacheTrack<B> {
    /// Calibrated drift accumulated since the last full computation
    pub fn accumulated_distance(&self) -> f64 {
        self.accumulated_distance
    }

    /// Reference observed on the previous invocation of this branch
    pub fn previous_reference(&self) -> Option<&Tensor<B, 2>> {
        self.previous_reference.as_ref()
    }

    /// Residual recorded at the last full computation of this branch
    pub fn previous_residual(&self) -> Option<&Tensor<B, 3>> {
        self.previous_residual.as_ref()
    }

    /// `mean|reference - previous| / mean|previous|`, or `None` without a
    /// comparable previous reference
    fn relative_distance(&self, reference: &Tensor<B, 2>) -> Option<f64> {
        let previous = self.previous_reference.as_ref()?;
        if previous.dims() != reference.dims() {
            debug!(
                previous = ?previous.dims(),
                current = ?reference.dims(),
                "reference shape changed, discarding cache history"
            );
            return None;
        }

        let diff: f64 = (reference.clone() - previous.clone())
            .abs()
            .mean()
            .into_scalar()
            .elem();
        let magnitude: f64 = previous.clone().abs().mean().into_scalar().elem();
        let raw = diff / magnitude;
        if !raw.is_finite() {
            warn!(
                diff,
                magnitude, "degenerate step-cache distance, previous reference has no magnitude"
            );
        }
        Some(raw)
    }
}

/// Step cache session for one sampling run
#[derive(Debug, Clone)]
pub struct StepCache<B: Backend> {
    config: StepCacheConfig,
    polynomial: RescalePolynomial,
    step_counter: usize,
    tracks: [CacheTrack<B>; 2],
}

impl<B: Backend> StepCache<B> {
    /// Create a fresh session
    pub fn new(config: StepCacheConfig) -> Result<Self, WanError> {
        config.validate()?;
        Ok(Self {
            polynomial: RescalePolynomial::new(config.coefficients),
            config,
            step_counter: 0,
            tracks: [CacheTrack::default(), CacheTrack::default()],
        })
    }

    /// Forget all history so the session can serve a new sampling run
    pub fn reset(&mut self) {
        self.step_counter = 0;
        self.tracks = [CacheTrack::default(), CacheTrack::default()];
    }

    pub fn config(&self) -> &StepCacheConfig {
        &self.config
    }

    /// Invocation index within the run, in `0..2 * num_inference_steps`
    pub fn step_counter(&self) -> usize {
        self.step_counter
    }

    /// Branch the next invocation will be attributed to
    pub fn branch(&self) -> Branch {
        Branch::from_step(self.step_counter)
    }

    pub fn track(&self, branch: Branch) -> &CacheTrack<B> {
        &self.tracks[branch.index()]
    }

    /// Whether the next invocation falls in a warm-up or tail window
    pub fn in_forced_window(&self) -> bool {
        self.step_counter < self.config.ret_steps || self.step_counter >= self.config.cutoff_steps
    }

    /// Run or skip the block stack for one invocation
    ///
    /// # Arguments
    /// * `reference` - Conditioning signal compared across steps, flattened per batch
    /// * `x` - Token stream entering the block stack
    /// * `run` - Full block stack computation
    ///
    /// # Returns
    /// The block stack output (or its cached approximation) and the decision taken.
    /// On error nothing in the session is modified.
    pub fn step<F>(
        &mut self,
        reference: Tensor<B, 2>,
        x: Tensor<B, 3>,
        run: F,
    ) -> Result<(Tensor<B, 3>, CacheDecision), WanError>
    where
        F: FnOnce(Tensor<B, 3>) -> Tensor<B, 3>,
    {
        let branch = self.branch();
        let idx = branch.index();

        let raw_distance = if self.in_forced_window() {
            None
        } else {
            self.tracks[idx].relative_distance(&reference)
        };
        let (decision, accumulated) = self.evaluate(branch, raw_distance);

        let output = match decision {
            CacheDecision::Skip => {
                let residual = self.tracks[idx]
                    .previous_residual
                    .clone()
                    .ok_or(WanError::MissingResidual { branch })?;
                if residual.dims() != x.dims() {
                    return Err(WanError::shape("cached residual", residual.dims(), x.dims()));
                }
                x + residual
            }
            CacheDecision::Run => {
                let output = run(x.clone());
                self.tracks[idx].previous_residual = Some(output.clone() - x);
                output
            }
        };

        debug!(
            step = self.step_counter,
            %branch,
            raw_distance,
            accumulated,
            ?decision,
            "step cache"
        );

        let track = &mut self.tracks[idx];
        track.accumulated_distance = accumulated;
        track.previous_reference = Some(reference);
        self.advance();

        Ok((output, decision))
    }

    /// Decide for the active branch without mutating anything
    fn evaluate(&self, branch: Branch, raw_distance: Option<f64>) -> (CacheDecision, f64) {
        if self.in_forced_window() {
            return (CacheDecision::Run, 0.0);
        }
        let raw = match raw_distance {
            Some(raw) if raw.is_finite() => raw,
            // No usable history on this branch: compute and start over
            _ => return (CacheDecision::Run, 0.0),
        };

        let accumulated = self.tracks[branch.index()].accumulated_distance + self.polynomial.eval(raw);
        if accumulated < self.config.threshold {
            (CacheDecision::Skip, accumulated)
        } else {
            (CacheDecision::Run, 0.0)
        }
    }

    fn advance(&mut self) {
        self.step_counter += 1;
        if self.step_counter >= self.config.total_steps() {
            self.step_counter = 0;
        }
    }
}
