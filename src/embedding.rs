//! UME statistic engine.
//!
//! The UME distance between P and R at test locations V = {v₁ … v_J}:
//!
//! ```text
//! UME²(P, R) = (1/J) Σⱼ (μ_P(vⱼ) − μ_R(vⱼ))²,   μ_P(v) = E_{x~P} k(x, v)
//! ```
//!
//! With paired samples x₁…xₙ ~ P, z₁…zₙ ~ R, each pair contributes a feature
//! vector Fᵢ = (k(xᵢ, V) − k(zᵢ, V)) / √J and UME² is estimated without
//! bias by the U-statistic
//!
//! ```text
//! (‖Σᵢ Fᵢ‖² − Σᵢ ‖Fᵢ‖²) / (n(n − 1))
//! ```
//!
//! Under the alternative, √n (ÛME² − UME²) → N(0, 4 μᵀ Σ μ) where μ and Σ
//! are the mean and covariance of Fᵢ.

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::data::Sample;
use crate::kernel::GaussianKernel;
use crate::{Error, Result};

fn check_locations(sample: &Sample, locations: ArrayView2<f64>) -> Result<()> {
    if locations.nrows() == 0 {
        return Err(Error::InvalidLocations("need at least one test location"));
    }
    if locations.ncols() != sample.dim() {
        return Err(Error::DimensionMismatch(sample.dim(), locations.ncols()));
    }
    Ok(())
}

/// Sample covariance of the rows of `f` with (n − 1) normalization.
pub(crate) fn row_covariance(f: ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = f.nrows();
    if n < 2 {
        return Err(Error::TooFewPoints(n));
    }
    let mean = f.mean_axis(Axis(0)).ok_or(Error::EmptyInput)?;
    let centered = &f - &mean;
    Ok(centered.t().dot(&centered) / (n - 1) as f64)
}

/// Unbiased sample variance.
pub(crate) fn variance(x: &Array1<f64>) -> Result<f64> {
    let n = x.len();
    if n < 2 {
        return Err(Error::TooFewPoints(n));
    }
    Ok(x.var(1.0))
}

/// Empirical mean embedding of a single sample at the test locations.
#[derive(Debug, Clone)]
pub struct UmeEmbedding {
    features: Array1<f64>,
    covariance: Array2<f64>,
}

impl UmeEmbedding {
    /// uⱼ = (1/m) Σᵢ k(xᵢ, vⱼ), plus the J×J covariance of k(xᵢ, ·) over i.
    pub fn fit(sample: &Sample, locations: ArrayView2<f64>, kernel: &GaussianKernel) -> Result<Self> {
        check_locations(sample, locations)?;
        if sample.len() < 2 {
            return Err(Error::TooFewPoints(sample.len()));
        }
        let k = kernel.eval(sample.data(), locations)?;
        let features = k.mean_axis(Axis(0)).ok_or(Error::EmptyInput)?;
        let covariance = row_covariance(k.view())?;
        Ok(Self { features, covariance })
    }

    /// Length-J feature vector.
    pub fn features(&self) -> &Array1<f64> {
        &self.features
    }

    /// J×J covariance estimate.
    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }
}

/// Paired UME features of (x, z) at locations V: Fᵢ = (k(xᵢ, V) − k(zᵢ, V)) / √J.
#[derive(Debug, Clone)]
pub struct UmeFeatures {
    matrix: Array2<f64>,
    mean: Array1<f64>,
}

impl UmeFeatures {
    pub fn new(
        x: &Sample,
        z: &Sample,
        locations: ArrayView2<f64>,
        kernel: &GaussianKernel,
    ) -> Result<Self> {
        if x.len() != z.len() {
            return Err(Error::SampleSizeMismatch {
                what: "reference sample",
                expected: x.len(),
                got: z.len(),
            });
        }
        if x.dim() != z.dim() {
            return Err(Error::DimensionMismatch(x.dim(), z.dim()));
        }
        check_locations(x, locations)?;
        if x.len() < 2 {
            return Err(Error::TooFewPoints(x.len()));
        }
        let scale = 1.0 / (locations.nrows() as f64).sqrt();
        let matrix = (kernel.eval(x.data(), locations)? - kernel.eval(z.data(), locations)?) * scale;
        let mean = matrix.mean_axis(Axis(0)).ok_or(Error::EmptyInput)?;
        Ok(Self { matrix, mean })
    }

    /// n×J feature matrix.
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Mean feature μ̂ (length J).
    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn sample_size(&self) -> usize {
        self.matrix.nrows()
    }

    /// J×J covariance of the features.
    pub fn covariance(&self) -> Result<Array2<f64>> {
        row_covariance(self.matrix.view())
    }

    /// Unbiased estimate of UME².
    pub fn ume_squared(&self) -> f64 {
        let n = self.sample_size() as f64;
        let t1 = self.mean.dot(&self.mean) * n / (n - 1.0);
        let t2 = self.matrix.iter().map(|v| v * v).sum::<f64>() / (n * (n - 1.0));
        t1 - t2
    }

    /// Fᵢ · μ̂ for every i; the first-order terms of the U-statistic.
    pub fn projections(&self) -> Array1<f64> {
        self.matrix.dot(&self.mean)
    }

    /// Asymptotic variance of √n·ÛME²: 4 Var̂(Fᵢ · μ̂) = 4 μ̂ᵀ Σ̂ μ̂.
    pub fn h1_variance(&self) -> Result<f64> {
        Ok(4.0 * variance(&self.projections())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataSource, IsotropicNormal};
    use approx::assert_relative_eq;
    use ndarray::array;
    use proptest::prelude::*;

    fn normal(mean: f64, n: usize, seed: u64) -> Sample {
        IsotropicNormal::new(array![mean, 0.0], 1.0)
            .unwrap()
            .sample(n, seed)
            .unwrap()
    }

    #[test]
    fn test_embedding_matches_direct_mean() {
        let x = Sample::new(array![[0.0], [1.0], [2.0]]).unwrap();
        let v = array![[0.5]];
        let k = GaussianKernel::new(2.0).unwrap();
        let emb = UmeEmbedding::fit(&x, v.view(), &k).unwrap();
        let vals: Vec<f64> = [0.0f64, 1.0, 2.0]
            .iter()
            .map(|xi| (-(xi - 0.5).powi(2) / 2.0).exp())
            .collect();
        let mean = vals.iter().sum::<f64>() / 3.0;
        let var = vals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 2.0;
        assert_relative_eq!(emb.features()[0], mean, epsilon = 1e-15);
        assert_relative_eq!(emb.covariance()[[0, 0]], var, epsilon = 1e-15);
    }

    #[test]
    fn test_embedding_needs_two_points() {
        let x = Sample::new(array![[0.0, 1.0]]).unwrap();
        let k = GaussianKernel::new(1.0).unwrap();
        assert!(matches!(
            UmeEmbedding::fit(&x, array![[0.0, 0.0]].view(), &k),
            Err(Error::TooFewPoints(1))
        ));
    }

    #[test]
    fn test_features_reject_empty_locations() {
        let x = normal(0.0, 10, 1);
        let z = normal(0.0, 10, 2);
        let k = GaussianKernel::new(1.0).unwrap();
        let v = Array2::<f64>::zeros((0, 2));
        assert!(matches!(
            UmeFeatures::new(&x, &z, v.view(), &k),
            Err(Error::InvalidLocations(_))
        ));
    }

    #[test]
    fn test_features_reject_unpaired_samples() {
        let x = normal(0.0, 10, 1);
        let z = normal(0.0, 11, 2);
        let k = GaussianKernel::new(1.0).unwrap();
        assert!(matches!(
            UmeFeatures::new(&x, &z, array![[0.0, 0.0]].view(), &k),
            Err(Error::SampleSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_ustat_matches_pairwise_definition() {
        let x = normal(0.5, 30, 3);
        let z = normal(0.0, 30, 4);
        let v = array![[0.0, 0.0], [1.0, 0.5]];
        let k = GaussianKernel::new(1.5).unwrap();
        let fea = UmeFeatures::new(&x, &z, v.view(), &k).unwrap();
        let f = fea.matrix();
        let n = f.nrows();
        let mut acc = 0.0;
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    acc += f.row(i).dot(&f.row(j));
                }
            }
        }
        assert_relative_eq!(fea.ume_squared(), acc / (n * (n - 1)) as f64, epsilon = 1e-14);
    }

    #[test]
    fn test_variance_is_quadratic_form() {
        let x = normal(0.5, 40, 5);
        let z = normal(0.0, 40, 6);
        let v = array![[0.0, 0.0], [1.0, 0.5], [-1.0, 1.0]];
        let k = GaussianKernel::new(1.0).unwrap();
        let fea = UmeFeatures::new(&x, &z, v.view(), &k).unwrap();
        let mu = fea.mean();
        let quad = 4.0 * mu.dot(&fea.covariance().unwrap().dot(mu));
        assert_relative_eq!(fea.h1_variance().unwrap(), quad, epsilon = 1e-14);
    }

    #[test]
    fn test_ume_detects_shift() {
        let k = GaussianKernel::new(2.0).unwrap();
        let v = array![[2.0, 0.0]];
        let z = normal(0.0, 500, 10);
        let near = UmeFeatures::new(&normal(0.0, 500, 11), &z, v.view(), &k).unwrap();
        let far = UmeFeatures::new(&normal(2.0, 500, 12), &z, v.view(), &k).unwrap();
        assert!(far.ume_squared() > near.ume_squared() + 0.01);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_covariance_symmetric_psd(
            seed in any::<u64>(),
            n in 2usize..40,
            j in 1usize..5,
            sigma2 in 0.05f64..20.0,
            probe in prop::collection::vec(-3.0f64..3.0, 5),
        ) {
            let x = normal(0.3, n, seed);
            let locs = Array2::from_shape_fn((j, 2), |(a, b)| probe[(a + 2 * b) % 5]);
            let k = GaussianKernel::new(sigma2).unwrap();
            let emb = UmeEmbedding::fit(&x, locs.view(), &k).unwrap();
            let c = emb.covariance();
            for a in 0..j {
                for b in 0..j {
                    prop_assert!((c[[a, b]] - c[[b, a]]).abs() < 1e-14);
                }
            }
            // uᵀ C u ≥ 0 for a handful of directions.
            for shift in 0..5 {
                let u = Array1::from_shape_fn(j, |a| probe[(a + shift) % 5]);
                prop_assert!(u.dot(&c.dot(&u)) >= -1e-12);
            }
        }
    }
}
