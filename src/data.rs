//! Samples, data sources and candidate models.
//!
//! A [`DataSource`] must be a deterministic function of `(n, seed)`: every
//! trial of an experiment reseeds explicitly, and two calls with the same
//! arguments return bit-identical samples.

use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::generator::{Generator, GeneratorContext};
use crate::{Error, Result};

/// An immutable n×d collection of points.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    data: Array2<f64>,
}

impl Sample {
    /// Wrap an n×d matrix. Fails on zero rows or zero columns.
    pub fn new(data: Array2<f64>) -> Result<Self> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(Error::EmptyInput);
        }
        Ok(Self { data })
    }

    /// The points as an n×d view.
    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Number of points n.
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    /// Always false; samples are non-empty by construction.
    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    /// Dimension d of each point.
    pub fn dim(&self) -> usize {
        self.data.ncols()
    }

    /// First `k` points.
    pub fn head(&self, k: usize) -> Result<Sample> {
        if k > self.len() {
            return Err(Error::SampleSizeMismatch {
                what: "head",
                expected: self.len(),
                got: k,
            });
        }
        Sample::new(self.data.slice(s![..k, ..]).to_owned())
    }

    /// The sample with its first `k` points removed.
    pub fn without_first(&self, k: usize) -> Result<Sample> {
        if k >= self.len() {
            return Err(Error::EmptyInput);
        }
        Sample::new(self.data.slice(s![k.., ..]).to_owned())
    }

    /// Row-wise concatenation of several samples of equal dimension.
    pub fn stack(samples: &[&Sample]) -> Result<Sample> {
        let first = samples.first().ok_or(Error::EmptyInput)?;
        for s in samples {
            if s.dim() != first.dim() {
                return Err(Error::DimensionMismatch(first.dim(), s.dim()));
            }
        }
        let views: Vec<ArrayView2<f64>> = samples.iter().map(|s| s.data()).collect();
        let stacked = concatenate(Axis(0), &views).map_err(|_| Error::DimensionMismatch(0, 0))?;
        Sample::new(stacked)
    }

    /// Seeded random split into `(train, test)`.
    ///
    /// The training part receives `round(train_proportion · n)` points. Both
    /// parts must be non-empty.
    pub fn split(&self, train_proportion: f64, seed: u64) -> Result<(Sample, Sample)> {
        if !(train_proportion > 0.0 && train_proportion < 1.0) {
            return Err(Error::InvalidConfig("train proportion must be in (0, 1)"));
        }
        let n = self.len();
        let n_train = (train_proportion * n as f64).round() as usize;
        if n_train == 0 || n_train == n {
            return Err(Error::TooFewPoints(n));
        }
        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        let (tr, te) = order.split_at(n_train);
        Ok((
            Sample::new(self.data.select(Axis(0), tr))?,
            Sample::new(self.data.select(Axis(0), te))?,
        ))
    }
}

/// Anything that can draw a [`Sample`] deterministically from a seed.
pub trait DataSource {
    /// Draw `n` points. Same `(n, seed)` ⇒ same sample.
    fn sample(&self, n: usize, seed: u64) -> Result<Sample>;

    /// Dimension of the points produced.
    fn dim(&self) -> usize;
}

/// N(mean, variance · I).
#[derive(Debug, Clone)]
pub struct IsotropicNormal {
    mean: Array1<f64>,
    variance: f64,
}

impl IsotropicNormal {
    pub fn new(mean: Array1<f64>, variance: f64) -> Result<Self> {
        if mean.is_empty() {
            return Err(Error::EmptyInput);
        }
        if !(variance.is_finite() && variance > 0.0) {
            return Err(Error::Distribution(format!("variance must be positive, got {variance}")));
        }
        Ok(Self { mean, variance })
    }
}

impl DataSource for IsotropicNormal {
    fn sample(&self, n: usize, seed: u64) -> Result<Sample> {
        let normal =
            Normal::new(0.0, self.variance.sqrt()).map_err(|e| Error::Distribution(e.to_string()))?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let d = self.mean.len();
        let data = Array2::from_shape_fn((n, d), |(_, j)| self.mean[j] + normal.sample(&mut rng));
        Sample::new(data)
    }

    fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// Samples from a generator: latent codes uniform on [-1, 1]^d_noise,
/// pushed through the (clipped) generator map.
pub struct GeneratorSource<G> {
    generator: G,
    context: GeneratorContext,
}

impl<G: Generator> GeneratorSource<G> {
    pub fn new(generator: G, context: GeneratorContext) -> Self {
        Self { generator, context }
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }
}

impl<G: Generator> DataSource for GeneratorSource<G> {
    fn sample(&self, n: usize, seed: u64) -> Result<Sample> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let dn = self.generator.latent_dim();
        let z = Array2::from_shape_fn((n, dn), |_| rng.gen_range(-1.0..=1.0));
        Sample::new(self.generator.generate(z.view(), &self.context)?)
    }

    fn dim(&self) -> usize {
        self.generator.output_dim()
    }
}

/// A candidate model in a comparison. Only models that can be sampled from
/// are testable with the UME three-sample test.
pub trait Model {
    /// Short human-readable name, used in logs.
    fn label(&self) -> &str;

    /// The model's sampler, if it has one.
    fn data_source(&self) -> Option<&dyn DataSource>;

    fn has_data_source(&self) -> bool {
        self.data_source().is_some()
    }
}

/// A model assembled from optional parts. Today the only part is a sampler;
/// a model known only through, say, its density has none.
pub struct ComposedModel {
    label: String,
    source: Option<Box<dyn DataSource>>,
}

impl ComposedModel {
    pub fn from_source(label: impl Into<String>, source: impl DataSource + 'static) -> Self {
        Self { label: label.into(), source: Some(Box::new(source)) }
    }

    /// A model without a sampler.
    pub fn without_source(label: impl Into<String>) -> Self {
        Self { label: label.into(), source: None }
    }
}

impl Model for ComposedModel {
    fn label(&self) -> &str {
        &self.label
    }

    fn data_source(&self) -> Option<&dyn DataSource> {
        self.source.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::MlpGenerator;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn test_sample_rejects_empty() {
        assert!(matches!(Sample::new(Array2::zeros((0, 2))), Err(Error::EmptyInput)));
        assert!(matches!(Sample::new(Array2::zeros((3, 0))), Err(Error::EmptyInput)));
    }

    #[test]
    fn test_head_and_without_first() {
        let s = Sample::new(array![[0.0], [1.0], [2.0], [3.0]]).unwrap();
        assert_eq!(s.head(1).unwrap().data(), array![[0.0]]);
        assert_eq!(s.without_first(1).unwrap().data(), array![[1.0], [2.0], [3.0]]);
        assert!(s.without_first(4).is_err());
    }

    #[test]
    fn test_stack_checks_dimension() {
        let a = Sample::new(array![[0.0, 1.0]]).unwrap();
        let b = Sample::new(array![[2.0, 3.0], [4.0, 5.0]]).unwrap();
        let c = Sample::new(array![[1.0]]).unwrap();
        assert_eq!(Sample::stack(&[&a, &b]).unwrap().len(), 3);
        assert!(matches!(Sample::stack(&[&a, &c]), Err(Error::DimensionMismatch(2, 1))));
    }

    #[test]
    fn test_split_partitions_rows() {
        let s = Sample::new(Array2::from_shape_fn((10, 1), |(i, _)| i as f64)).unwrap();
        let (tr, te) = s.split(0.5, 7).unwrap();
        assert_eq!(tr.len(), 5);
        assert_eq!(te.len(), 5);
        let mut all: Vec<f64> = tr.data().iter().chain(te.data().iter()).copied().collect();
        all.sort_by(f64::total_cmp);
        assert_eq!(all, (0..10).map(|i| i as f64).collect::<Vec<_>>());
        assert!(s.split(0.0, 1).is_err());
    }

    #[test]
    fn test_isotropic_normal_moments() {
        let ds = IsotropicNormal::new(array![1.0, -2.0], 4.0).unwrap();
        let s = ds.sample(20_000, 3).unwrap();
        let mean = s.data().mean_axis(Axis(0)).unwrap();
        assert!((mean[0] - 1.0).abs() < 0.05);
        assert!((mean[1] + 2.0).abs() < 0.05);
        let var = s.data().var_axis(Axis(0), 1.0);
        assert!((var[0] - 4.0).abs() < 0.2);
    }

    #[test]
    fn test_isotropic_normal_rejects_bad_variance() {
        assert!(IsotropicNormal::new(array![0.0], 0.0).is_err());
        assert!(IsotropicNormal::new(Array1::zeros(0), 1.0).is_err());
    }

    #[test]
    fn test_generator_source_in_range() {
        let g = MlpGenerator::random(2, 8, 3, 11).unwrap();
        let ds = GeneratorSource::new(g, GeneratorContext::default());
        let s = ds.sample(50, 1).unwrap();
        assert_eq!(s.dim(), 3);
        assert!(s.data().iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(s, ds.sample(50, 1).unwrap());
    }

    #[test]
    fn test_model_without_source() {
        let m = ComposedModel::without_source("density-only");
        assert!(!m.has_data_source());
        let m = ComposedModel::from_source("p", IsotropicNormal::new(array![0.0], 1.0).unwrap());
        assert!(m.has_data_source());
        assert_eq!(m.label(), "p");
    }

    proptest! {
        #[test]
        fn prop_sampling_is_deterministic(n in 1usize..64, seed in any::<u64>()) {
            let ds = IsotropicNormal::new(array![0.3, -0.1, 2.0], 1.5).unwrap();
            let a = ds.sample(n, seed).unwrap();
            let b = ds.sample(n, seed).unwrap();
            for (x, y) in a.data().iter().zip(b.data().iter()) {
                prop_assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }
}
