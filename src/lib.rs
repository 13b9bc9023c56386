//! # ume
//!
//! Kernel three-sample tests for model comparison.
//!
//! Given samples from two candidate models P and Q and from a reference
//! distribution R, decide whether one of the models is significantly closer
//! to R. Closeness is measured by the **UME** (Unnormalized Mean Embedding)
//! distance: the squared difference of kernel mean embeddings evaluated at a
//! small set of test locations.
//!
//! ## Intuition
//!
//! MMD compares mean embeddings everywhere in the RKHS. UME only looks at J
//! "probe" points, which makes it linear time and, more interestingly,
//! *interpretable*: the locations that make the test most powerful are the
//! places where one model is visibly worse than the other.
//!
//! The three-sample statistic is
//!
//! ```text
//! √n (UME²(P, R) − UME²(Q, R)) / ζ̂
//! ```
//!
//! which is asymptotically N(0, 1) when P and Q are equally far from R.
//! A large positive value means Q is closer to R.
//!
//! ## Key Items
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`GaussianKernel`] | k(x, y) = exp(−‖x−y‖²/σ²) |
//! | [`UmeFeatures`] | Paired feature matrix, unbiased UME², its variance |
//! | [`ScUme`] | The three-sample test |
//! | [`power_criterion`] | Mean over sqrt(variance + reg) objective |
//! | [`optimize_locations`] | Tune locations and bandwidth in data space |
//! | [`optimize_latent_locations`] | Tune latent codes pushed through two generators |
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::array;
//! use ume::*;
//!
//! let p = IsotropicNormal::new(array![0.4], 1.0).unwrap().sample(400, 1).unwrap();
//! let q = IsotropicNormal::new(array![0.2], 1.0).unwrap().sample(400, 2).unwrap();
//! let r = IsotropicNormal::new(array![0.0], 1.0).unwrap().sample(400, 3).unwrap();
//!
//! let k = GaussianKernel::new(1.0).unwrap();
//! let v = array![[1.5]];
//! let test = ScUme::shared(p, q, k, v, 0.05).unwrap();
//! let result = test.perform_test(&r).unwrap();
//! assert!(result.p_value >= 0.0 && result.p_value <= 1.0);
//! ```
//!
//! ## What Can Go Wrong
//!
//! 1. **Two location sets under P = Q**: with V ≠ W (or two different
//!    kernels) the two UME terms measure different things, so the test is
//!    not calibrated even when the models coincide. Use shared locations when
//!    size matters.
//! 2. **Locations drawn from the test data**: invalidates the null
//!    distribution. [`reserve_locations`] removes them first.
//! 3. **Degenerate variance**: identical P and Q features give ζ̂ = 0. That is
//!    reported as "no evidence" only when the mean difference is exactly zero;
//!    otherwise it is an error.
//!
//! ## References
//!
//! - Jitkrittum et al. (2018). "Informative Features for Model Comparison" (NeurIPS)
//! - Bounliphone et al. (2016). "A Test of Relative Similarity for Model Selection"
//! - Chwialkowski et al. (2015). "Fast Two-Sample Testing with Analytic Representations"

use thiserror::Error;

pub mod criterion;
pub mod data;
pub mod embedding;
pub mod generator;
pub mod kernel;
pub mod locations;
pub mod optim;
pub mod tape;
pub mod three_sample;
pub mod trial;

pub use criterion::{power_criterion, power_criterion_grad, CriterionGradient};
pub use data::{ComposedModel, DataSource, GeneratorSource, IsotropicNormal, Model, Sample};
pub use embedding::{UmeEmbedding, UmeFeatures};
pub use generator::{Generator, GeneratorContext, MlpGenerator};
pub use kernel::{bandwidth_bounds, gaussian, median_distance, GaussianKernel};
pub use locations::{reserve_locations, subsample_rows, LocationMode, LocationSplit};
pub use optim::{
    optimize_latent_locations, optimize_locations, LatentOptimum, LocationOptimum,
    OptimizationReport, OptimizerOptions,
};
pub use three_sample::{Candidate, Inapplicable, Moments, Outcome, ScUme, TestResult};
pub use trial::{
    sample_pqr, sc_ume_optimized_locations, sc_ume_random_locations, OptimizedLocationsConfig,
    RandomLocationsConfig, ResultCache, TrialKey, TrialResult,
};

/// Errors for testing and optimization.
#[derive(Debug, Error)]
pub enum Error {
    #[error("empty input")]
    EmptyInput,

    #[error("dimension mismatch: {0} vs {1}")]
    DimensionMismatch(usize, usize),

    #[error("invalid bandwidth: {0}")]
    InvalidBandwidth(f64),

    #[error("sample size mismatch: {what} has {got} points, expected {expected}")]
    SampleSizeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("need at least 2 points, got {0}")]
    TooFewPoints(usize),

    #[error("invalid test locations: {0}")]
    InvalidLocations(&'static str),

    #[error("significance level must be in (0, 1), got {0}")]
    InvalidAlpha(f64),

    #[error("regularization must be positive, got {0}")]
    InvalidRegularization(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("numeric degeneracy: {0}")]
    NumericDegeneracy(String),

    #[error("optimizer failed: {0}")]
    Optimizer(String),

    #[error("distribution error: {0}")]
    Distribution(String),
}

pub type Result<T> = std::result::Result<T, Error>;
