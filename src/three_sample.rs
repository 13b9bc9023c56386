//! The UME three-sample test (SC-UME).
//!
//! H₀: UME²(P, R) ≤ UME²(Q, R)  vs  H₁: UME²(P, R) > UME²(Q, R)
//!
//! i.e. rejecting H₀ asserts that Q is significantly closer to R than P.
//!
//! P and Q samples and the test parameters are fixed at construction; only
//! the R sample is supplied per call, so one instance can be reused against
//! many draws from R.
//!
//! ## Null distribution
//!
//! Let F and G be the paired feature matrices of (P, R) and (Q, R). The
//! statistic is the difference of two unbiased UME² estimates,
//! D̂ = ÛME²(P, R) − ÛME²(Q, R). Both are U-statistics in the same R sample,
//! so their first-order projections aᵢ = Fᵢ·μ̂_F and bᵢ = Gᵢ·μ̂_G are
//! correlated, and by the delta method
//!
//! ```text
//! √n (D̂ − D) → N(0, ζ²),   ζ² = 4 Var(aᵢ − bᵢ)
//!                             = 4 (μ_Fᵀ Σ_FF μ_F − 2 μ_Fᵀ Σ_FG μ_G + μ_Gᵀ Σ_GG μ_G)
//! ```
//!
//! The test rejects when √n D̂ / ζ̂ exceeds the standard normal (1 − α)
//! quantile. The statistic is a scalar for every J, so the same law applies
//! to J = 1 and J > 1.

use std::fmt;
use std::time::Instant;

use ndarray::{Array2, ArrayView2};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use crate::data::{Model, Sample};
use crate::kernel::GaussianKernel;
use crate::embedding::{variance, UmeFeatures};
use crate::{Error, Result};

/// Which of the two candidate models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Candidate {
    P,
    Q,
}

/// Why a test could not be run. Expected in batch experiments; not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Inapplicable {
    /// The model cannot be sampled from.
    MissingDataSource { candidate: Candidate, model: String },
    /// Not enough points to reserve the requested test locations.
    InsufficientPool { requested: usize, available: usize },
}

impl fmt::Display for Inapplicable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inapplicable::MissingDataSource { candidate, model } => {
                write!(f, "model {candidate:?} ({model}) has no data source")
            }
            Inapplicable::InsufficientPool { requested, available } => {
                write!(f, "requested {requested} locations, only {available} available")
            }
        }
    }
}

/// A result that may legitimately be absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Outcome<T> {
    Applicable(T),
    NotApplicable(Inapplicable),
}

impl<T> Outcome<T> {
    pub fn is_applicable(&self) -> bool {
        matches!(self, Outcome::Applicable(_))
    }

    pub fn applicable(self) -> Option<T> {
        match self {
            Outcome::Applicable(t) => Some(t),
            Outcome::NotApplicable(_) => None,
        }
    }

    pub fn as_ref(&self) -> Outcome<&T> {
        match self {
            Outcome::Applicable(t) => Outcome::Applicable(t),
            Outcome::NotApplicable(why) => Outcome::NotApplicable(why.clone()),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Applicable(t) => Outcome::Applicable(f(t)),
            Outcome::NotApplicable(why) => Outcome::NotApplicable(why),
        }
    }
}

/// Mean and asymptotic variance of √n·D̂ under H₁ (not yet scaled by n).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Moments {
    pub mean: f64,
    pub variance: f64,
}

/// Outcome of one call to [`ScUme::perform_test`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    /// Standardized statistic √n D̂ / ζ̂.
    pub statistic: f64,
    pub p_value: f64,
    /// Standard normal (1 − α) quantile.
    pub threshold: f64,
    pub h0_rejected: bool,
    pub alpha: f64,
    pub time_secs: f64,
}

/// Joint moments of two paired feature sets sharing one reference sample.
pub(crate) fn difference_moments(fp: &UmeFeatures, fq: &UmeFeatures) -> Result<Moments> {
    let mean = fp.ume_squared() - fq.ume_squared();
    let diff = fp.projections() - fq.projections();
    let variance = 4.0 * variance(&diff)?;
    Ok(Moments { mean, variance })
}

/// SC-UME three-sample test.
#[derive(Debug, Clone)]
pub struct ScUme {
    p: Sample,
    q: Sample,
    k: GaussianKernel,
    l: GaussianKernel,
    v: Array2<f64>,
    w: Array2<f64>,
    alpha: f64,
}

impl ScUme {
    /// Two kernels and two location sets: `k` and `v` for (P, R), `l` and `w`
    /// for (Q, R). `v` and `w` must have the same number of rows.
    pub fn new(
        p: Sample,
        q: Sample,
        k: GaussianKernel,
        l: GaussianKernel,
        v: Array2<f64>,
        w: Array2<f64>,
        alpha: f64,
    ) -> Result<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(Error::InvalidAlpha(alpha));
        }
        if p.len() != q.len() {
            return Err(Error::SampleSizeMismatch {
                what: "Q sample",
                expected: p.len(),
                got: q.len(),
            });
        }
        if p.len() < 2 {
            return Err(Error::TooFewPoints(p.len()));
        }
        if p.dim() != q.dim() {
            return Err(Error::DimensionMismatch(p.dim(), q.dim()));
        }
        if v.nrows() == 0 || w.nrows() == 0 {
            return Err(Error::InvalidLocations("need at least one test location"));
        }
        if v.nrows() != w.nrows() {
            return Err(Error::InvalidLocations("V and W must have the same number of locations"));
        }
        for locs in [&v, &w] {
            if locs.ncols() != p.dim() {
                return Err(Error::DimensionMismatch(p.dim(), locs.ncols()));
            }
        }
        Ok(Self { p, q, k, l, v, w, alpha })
    }

    /// One kernel and one location set for both comparisons.
    pub fn shared(p: Sample, q: Sample, kernel: GaussianKernel, v: Array2<f64>, alpha: f64) -> Result<Self> {
        let w = v.clone();
        Self::new(p, q, kernel, kernel, v, w, alpha)
    }

    /// Build the test from two models, drawing `n` points from each with the
    /// given seeds. Models without a data source are not applicable.
    #[allow(clippy::too_many_arguments)]
    pub fn for_models(
        p: &dyn Model,
        q: &dyn Model,
        n: usize,
        seeds: (u64, u64),
        k: GaussianKernel,
        l: GaussianKernel,
        v: Array2<f64>,
        w: Array2<f64>,
        alpha: f64,
    ) -> Result<Outcome<Self>> {
        let (ds_p, ds_q) = match (p.data_source(), q.data_source()) {
            (Some(a), Some(b)) => (a, b),
            (None, _) => {
                return Ok(Outcome::NotApplicable(Inapplicable::MissingDataSource {
                    candidate: Candidate::P,
                    model: p.label().to_string(),
                }))
            }
            (_, None) => {
                return Ok(Outcome::NotApplicable(Inapplicable::MissingDataSource {
                    candidate: Candidate::Q,
                    model: q.label().to_string(),
                }))
            }
        };
        let xs = ds_p.sample(n, seeds.0)?;
        let ys = ds_q.sample(n, seeds.1)?;
        Self::new(xs, ys, k, l, v, w, alpha).map(Outcome::Applicable)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn locations(&self) -> (ArrayView2<'_, f64>, ArrayView2<'_, f64>) {
        (self.v.view(), self.w.view())
    }

    pub fn sample_size(&self) -> usize {
        self.p.len()
    }

    fn check_reference(&self, r: &Sample) -> Result<()> {
        if r.len() != self.p.len() {
            return Err(Error::SampleSizeMismatch {
                what: "R sample",
                expected: self.p.len(),
                got: r.len(),
            });
        }
        if r.dim() != self.p.dim() {
            return Err(Error::DimensionMismatch(self.p.dim(), r.dim()));
        }
        Ok(())
    }

    /// Mean D̂ and variance ζ̂² (neither scaled by n).
    pub fn h1_mean_variance(&self, r: &Sample) -> Result<Moments> {
        self.check_reference(r)?;
        let fp = UmeFeatures::new(&self.p, r, self.v.view(), &self.k)?;
        let fq = UmeFeatures::new(&self.q, r, self.w.view(), &self.l)?;
        difference_moments(&fp, &fq)
    }

    /// Standardized statistic √n D̂ / ζ̂.
    pub fn compute_stat(&self, r: &Sample) -> Result<f64> {
        let moments = self.h1_mean_variance(r)?;
        standardize(moments, r.len())
    }

    pub fn perform_test(&self, r: &Sample) -> Result<TestResult> {
        let start = Instant::now();
        let moments = self.h1_mean_variance(r)?;
        let statistic = standardize(moments, r.len())?;

        let normal = Normal::new(0.0, 1.0).map_err(|e| Error::Distribution(e.to_string()))?;
        let threshold = normal.inverse_cdf(1.0 - self.alpha);
        // Identical P and Q features carry no evidence either way.
        let p_value = if moments.variance.is_finite() && moments.variance > 0.0 {
            normal.sf(statistic)
        } else {
            1.0
        };
        let h0_rejected = p_value < self.alpha;

        debug!(
            statistic,
            p_value,
            mean = moments.mean,
            variance = moments.variance,
            h0_rejected,
            "sc-ume test"
        );

        Ok(TestResult {
            statistic,
            p_value,
            threshold,
            h0_rejected,
            alpha: self.alpha,
            time_secs: start.elapsed().as_secs_f64(),
        })
    }
}

/// √n·mean/√variance. A finite non-positive variance is only acceptable
/// together with an exactly zero mean; anything else cannot be standardized.
fn standardize(moments: Moments, n: usize) -> Result<f64> {
    let Moments { mean, variance } = moments;
    if !mean.is_finite() {
        return Err(Error::NumericDegeneracy(format!("non-finite mean difference {mean}")));
    }
    if !variance.is_finite() {
        return Err(Error::NumericDegeneracy(format!("non-finite variance {variance}")));
    }
    if variance > 0.0 {
        Ok((n as f64).sqrt() * mean / variance.sqrt())
    } else if mean == 0.0 {
        Ok(0.0)
    } else {
        Err(Error::NumericDegeneracy(format!(
            "variance collapsed to {variance} with mean {mean}"
        )))
    }
}
