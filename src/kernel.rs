//! Gaussian kernel and bandwidth heuristics.
//!
//! The kernel is parameterized by σ² directly (the "Gaussian width"):
//!
//! ```text
//! k(x, y) = exp(−‖x − y‖² / σ²)
//! ```
//!
//! Note there is no factor 2 in the denominator. The median heuristic
//! therefore sets σ² = median(‖xᵢ − xⱼ‖)².

use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result};

/// Seed of the row subsample used by [`median_distance`].
const MEDIAN_SEED: u64 = 9827;

/// Multiplicative factors applied to the squared median distance when
/// deriving bandwidth bounds.
const GWIDTH_LOWER_FACTOR: f64 = 1e-2;
const GWIDTH_UPPER_FACTOR: f64 = 1e2;

/// Absolute floor and ceiling for automatically derived bounds.
const GWIDTH_FLOOR: f64 = 1e-3;
const GWIDTH_CEILING: f64 = 1e5;

/// Gaussian kernel: k(x, y) = exp(−‖x−y‖² / σ²)
///
/// # Example
///
/// ```rust
/// use ume::gaussian;
///
/// let k = gaussian(&[0.0, 0.0], &[1.0, 0.0], 1.0);
/// // exp(-1) ≈ 0.368
/// assert!((k - 0.3679).abs() < 1e-3);
/// ```
pub fn gaussian(x: &[f64], y: &[f64], sigma2: f64) -> f64 {
    let sq_dist: f64 = x
        .iter()
        .zip(y.iter())
        .map(|(xi, yi)| (xi - yi).powi(2))
        .sum();
    (-sq_dist / sigma2).exp()
}

/// Gaussian kernel with a fixed, strictly positive width σ².
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct GaussianKernel {
    sigma2: f64,
}

impl GaussianKernel {
    /// Create a kernel. Fails unless `sigma2` is finite and positive.
    pub fn new(sigma2: f64) -> Result<Self> {
        if !(sigma2.is_finite() && sigma2 > 0.0) {
            return Err(Error::InvalidBandwidth(sigma2));
        }
        Ok(Self { sigma2 })
    }

    /// Squared bandwidth σ².
    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    /// Cross-kernel matrix between the rows of `x` (n×d) and `y` (m×d).
    pub fn eval(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != y.ncols() {
            return Err(Error::DimensionMismatch(x.ncols(), y.ncols()));
        }
        let mut k = Array2::zeros((x.nrows(), y.nrows()));
        for (i, xi) in x.outer_iter().enumerate() {
            for (j, yj) in y.outer_iter().enumerate() {
                let sq_dist: f64 = xi
                    .iter()
                    .zip(yj.iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum();
                k[[i, j]] = (-sq_dist / self.sigma2).exp();
            }
        }
        Ok(k)
    }
}

/// Median heuristic: median pairwise Euclidean distance.
///
/// At most `subsample` rows are used, chosen with a fixed seed so the result
/// is a deterministic function of `data`. If the median is zero (many tied
/// points) the mean distance is returned instead.
///
/// # Example
///
/// ```rust
/// use ndarray::array;
/// use ume::median_distance;
///
/// let data = array![[0.0], [1.0], [3.0]];
/// // distances: 1, 3, 2
/// assert!((median_distance(data.view(), 1000).unwrap() - 2.0).abs() < 1e-12);
/// ```
pub fn median_distance(data: ArrayView2<f64>, subsample: usize) -> Result<f64> {
    let n = data.nrows();
    if n < 2 || subsample < 2 {
        return Err(Error::TooFewPoints(n.min(subsample)));
    }

    let rows = if n > subsample {
        let mut rng = ChaCha8Rng::seed_from_u64(MEDIAN_SEED);
        let mut picked = index::sample(&mut rng, n, subsample).into_vec();
        picked.sort_unstable();
        data.select(Axis(0), &picked)
    } else {
        data.to_owned()
    };

    let m = rows.nrows();
    let mut distances = Vec::with_capacity(m * (m - 1) / 2);
    for i in 0..m {
        for j in 0..i {
            let sq_dist: f64 = rows
                .row(i)
                .iter()
                .zip(rows.row(j).iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            distances.push(sq_dist.sqrt());
        }
    }

    let median = median_of(&mut distances);
    if median > 0.0 {
        Ok(median)
    } else {
        Ok(distances.iter().sum::<f64>() / distances.len() as f64)
    }
}

fn median_of(values: &mut [f64]) -> f64 {
    let len = values.len();
    let mid = len / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if len % 2 == 1 {
        upper
    } else {
        let lower_max = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        0.5 * (lower_max + upper)
    }
}

/// Bounds on the Gaussian width σ² used during optimization.
///
/// Explicit bounds win; missing ones are derived from the squared median
/// distance `med2` as `max(0.01·med2, 1e-3)` and `min(100·med2, 1e5)`.
pub fn bandwidth_bounds(med2: f64, lower: Option<f64>, upper: Option<f64>) -> Result<(f64, f64)> {
    let lb = lower.unwrap_or((GWIDTH_LOWER_FACTOR * med2).max(GWIDTH_FLOOR));
    let ub = upper.unwrap_or((GWIDTH_UPPER_FACTOR * med2).min(GWIDTH_CEILING));
    if !(lb.is_finite() && lb > 0.0) {
        return Err(Error::InvalidBandwidth(lb));
    }
    if !(ub.is_finite() && ub >= lb) {
        return Err(Error::InvalidBandwidth(ub));
    }
    Ok((lb, ub))
}
