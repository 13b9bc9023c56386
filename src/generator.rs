//! Differentiable generator maps from latent codes to data space.
//!
//! The optimizer in [`crate::optim`] only needs two things from a generator:
//! the (clipped) output for a batch of latent codes, and the full Jacobian of
//! that output with respect to one latent code. Both go through a
//! [`GeneratorContext`] that is passed explicitly, so nothing about where or
//! how a generator is evaluated lives in global state.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Evaluation settings shared by every generator call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneratorContext {
    /// Valid data range; generated coordinates are clipped into it.
    pub output_range: (f64, f64),
}

impl Default for GeneratorContext {
    fn default() -> Self {
        Self { output_range: (0.0, 1.0) }
    }
}

impl GeneratorContext {
    fn validate(&self) -> Result<()> {
        let (lo, hi) = self.output_range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(Error::InvalidConfig("output range must satisfy lo < hi"));
        }
        Ok(())
    }
}

/// A differentiable map R^latent_dim → R^output_dim.
pub trait Generator {
    fn latent_dim(&self) -> usize;

    fn output_dim(&self) -> usize;

    /// Unclipped output for one latent code.
    fn forward_raw(&self, z: ArrayView1<f64>) -> Array1<f64>;

    /// Jacobian of [`forward_raw`](Generator::forward_raw) at `z`,
    /// shape output_dim × latent_dim.
    fn jacobian_raw(&self, z: ArrayView1<f64>) -> Array2<f64>;

    /// Clipped outputs for a batch of latent codes (batch × latent_dim).
    fn generate(&self, zs: ArrayView2<f64>, ctx: &GeneratorContext) -> Result<Array2<f64>> {
        ctx.validate()?;
        if zs.ncols() != self.latent_dim() {
            return Err(Error::DimensionMismatch(self.latent_dim(), zs.ncols()));
        }
        let (lo, hi) = ctx.output_range;
        let mut out = Array2::zeros((zs.nrows(), self.output_dim()));
        for (z, mut row) in zs.outer_iter().zip(out.outer_iter_mut()) {
            let x = self.forward_raw(z);
            row.assign(&x.mapv(|v| v.clamp(lo, hi)));
        }
        Ok(out)
    }

    /// Jacobian of the clipped map. Coordinates clipped at the range
    /// boundary are locally constant and get a zero row.
    fn jacobian(&self, z: ArrayView1<f64>, ctx: &GeneratorContext) -> Result<Array2<f64>> {
        ctx.validate()?;
        if z.len() != self.latent_dim() {
            return Err(Error::DimensionMismatch(self.latent_dim(), z.len()));
        }
        let (lo, hi) = ctx.output_range;
        let x = self.forward_raw(z);
        let mut jac = self.jacobian_raw(z);
        if jac.dim() != (self.output_dim(), self.latent_dim()) {
            return Err(Error::DimensionMismatch(self.output_dim(), jac.nrows()));
        }
        for (xi, mut row) in x.iter().zip(jac.axis_iter_mut(Axis(0))) {
            if *xi < lo || *xi > hi {
                row.fill(0.0);
            }
        }
        if jac.iter().any(|v| !v.is_finite()) {
            return Err(Error::NumericDegeneracy("generator Jacobian is not finite".into()));
        }
        Ok(jac)
    }
}

impl<G: Generator + ?Sized> Generator for &G {
    fn latent_dim(&self) -> usize {
        (**self).latent_dim()
    }

    fn output_dim(&self) -> usize {
        (**self).output_dim()
    }

    fn forward_raw(&self, z: ArrayView1<f64>) -> Array1<f64> {
        (**self).forward_raw(z)
    }

    fn jacobian_raw(&self, z: ArrayView1<f64>) -> Array2<f64> {
        (**self).jacobian_raw(z)
    }
}

/// Two-layer perceptron: x = sigmoid(W₂ tanh(W₁ z + b₁) + b₂).
///
/// The sigmoid keeps outputs in (0, 1), matching image-like data.
#[derive(Debug, Clone)]
pub struct MlpGenerator {
    w1: Array2<f64>,
    b1: Array1<f64>,
    w2: Array2<f64>,
    b2: Array1<f64>,
}

impl MlpGenerator {
    /// `w1`: hidden × latent, `w2`: output × hidden.
    pub fn new(w1: Array2<f64>, b1: Array1<f64>, w2: Array2<f64>, b2: Array1<f64>) -> Result<Self> {
        if w1.nrows() == 0 || w1.ncols() == 0 || w2.nrows() == 0 {
            return Err(Error::EmptyInput);
        }
        if b1.len() != w1.nrows() {
            return Err(Error::DimensionMismatch(w1.nrows(), b1.len()));
        }
        if w2.ncols() != w1.nrows() {
            return Err(Error::DimensionMismatch(w1.nrows(), w2.ncols()));
        }
        if b2.len() != w2.nrows() {
            return Err(Error::DimensionMismatch(w2.nrows(), b2.len()));
        }
        Ok(Self { w1, b1, w2, b2 })
    }

    /// Random weights with N(0, 1/fan_in) entries; deterministic in `seed`.
    pub fn random(latent_dim: usize, hidden: usize, output_dim: usize, seed: u64) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut draw = |rows: usize, cols: usize, fan_in: usize| -> Result<Array2<f64>> {
            let normal = Normal::new(0.0, 1.0 / (fan_in.max(1) as f64).sqrt())
                .map_err(|e| Error::Distribution(e.to_string()))?;
            Ok(Array2::from_shape_fn((rows, cols), |_| normal.sample(&mut rng)))
        };
        let w1 = draw(hidden, latent_dim, latent_dim)?;
        let b1 = draw(hidden, 1, 1)?.column(0).mapv(|v| 0.1 * v);
        let w2 = draw(output_dim, hidden, hidden)?;
        let b2 = draw(output_dim, 1, 1)?.column(0).mapv(|v| 0.1 * v);
        Self::new(w1, b1, w2, b2)
    }

    fn hidden(&self, z: ArrayView1<f64>) -> Array1<f64> {
        (self.w1.dot(&z) + &self.b1).mapv(f64::tanh)
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl Generator for MlpGenerator {
    fn latent_dim(&self) -> usize {
        self.w1.ncols()
    }

    fn output_dim(&self) -> usize {
        self.w2.nrows()
    }

    fn forward_raw(&self, z: ArrayView1<f64>) -> Array1<f64> {
        let h = self.hidden(z);
        (self.w2.dot(&h) + &self.b2).mapv(sigmoid)
    }

    // J = diag(x ⊙ (1 − x)) W₂ diag(1 − h²) W₁
    fn jacobian_raw(&self, z: ArrayView1<f64>) -> Array2<f64> {
        let h = self.hidden(z);
        let x = (self.w2.dot(&h) + &self.b2).mapv(sigmoid);
        let dh = h.mapv(|v| 1.0 - v * v);
        let mut inner = self.w1.clone();
        for (mut row, d) in inner.outer_iter_mut().zip(dh.iter()) {
            row *= *d;
        }
        let mut jac = self.w2.dot(&inner);
        for (mut row, xi) in jac.outer_iter_mut().zip(x.iter()) {
            row *= xi * (1.0 - xi);
        }
        jac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    /// Identity map, handy for checking the clipping rules.
    struct Identity(usize);

    impl Generator for Identity {
        fn latent_dim(&self) -> usize {
            self.0
        }
        fn output_dim(&self) -> usize {
            self.0
        }
        fn forward_raw(&self, z: ArrayView1<f64>) -> Array1<f64> {
            z.to_owned()
        }
        fn jacobian_raw(&self, _z: ArrayView1<f64>) -> Array2<f64> {
            Array2::eye(self.0)
        }
    }

    #[test]
    fn test_generate_clips_to_range() {
        let g = Identity(2);
        let zs = array![[-0.5, 0.3], [1.5, 0.9]];
        let out = g.generate(zs.view(), &GeneratorContext::default()).unwrap();
        assert_eq!(out, array![[0.0, 0.3], [1.0, 0.9]]);
    }

    #[test]
    fn test_jacobian_zeroes_clipped_rows() {
        let g = Identity(2);
        let jac = g.jacobian(array![-0.5, 0.3].view(), &GeneratorContext::default()).unwrap();
        assert_eq!(jac, array![[0.0, 0.0], [0.0, 1.0]]);
    }

    #[test]
    fn test_bad_context_rejected() {
        let g = Identity(1);
        let ctx = GeneratorContext { output_range: (1.0, 0.0) };
        assert!(g.generate(array![[0.1]].view(), &ctx).is_err());
    }

    #[test]
    fn test_latent_dim_checked() {
        let g = MlpGenerator::random(2, 4, 3, 0).unwrap();
        let ctx = GeneratorContext::default();
        assert!(matches!(
            g.generate(array![[0.1, 0.2, 0.3]].view(), &ctx),
            Err(Error::DimensionMismatch(2, 3))
        ));
    }

    #[test]
    fn test_mlp_shape_validation() {
        let w1 = Array2::zeros((4, 2));
        let w2 = Array2::zeros((3, 5));
        assert!(MlpGenerator::new(w1, Array1::zeros(4), w2, Array1::zeros(3)).is_err());
    }

    #[test]
    fn test_mlp_jacobian_matches_finite_differences() {
        let g = MlpGenerator::random(3, 6, 4, 42).unwrap();
        let z = array![0.2, -0.4, 0.7];
        let jac = g.jacobian_raw(z.view());
        let h = 1e-6;
        for k in 0..3 {
            let mut zp = z.clone();
            let mut zm = z.clone();
            zp[k] += h;
            zm[k] -= h;
            let fd = (g.forward_raw(zp.view()) - g.forward_raw(zm.view())) / (2.0 * h);
            for i in 0..4 {
                assert_relative_eq!(jac[[i, k]], fd[i], epsilon = 1e-8, max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn test_random_is_deterministic() {
        let a = MlpGenerator::random(2, 5, 3, 9).unwrap();
        let b = MlpGenerator::random(2, 5, 3, 9).unwrap();
        let z = array![0.3, -0.8];
        assert_eq!(a.forward_raw(z.view()), b.forward_raw(z.view()));
    }
}
