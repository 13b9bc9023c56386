//! One trial of a model-comparison experiment.
//!
//! A trial draws fresh P, Q and R samples from a trial index, chooses test
//! locations and a bandwidth, and runs [`ScUme`]. The two methods differ in
//! how the locations are chosen:
//!
//! - [`sc_ume_random_locations`]: random points reserved from the samples,
//!   median-heuristic bandwidth.
//! - [`sc_ume_optimized_locations`]: locations and bandwidth tuned on a
//!   training split, test on the held-out split.
//!
//! Trials are deterministic in `(n, trial)` and can be memoized in a
//! [`ResultCache`] keyed by [`TrialKey`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{DataSource, Model, Sample};
use crate::kernel::{median_distance, GaussianKernel};
use crate::locations::{reserve_locations, subsample_rows, LocationMode};
use crate::optim::{optimize_locations, OptimizerOptions};
use crate::three_sample::{Candidate, Inapplicable, Outcome, ScUme, TestResult};
use crate::{Error, Result};

/// Draw P, Q, R samples of size `n` for trial `trial`.
///
/// The seeds are `trial + 1`, `trial + 2` and `trial + 3`.
pub fn sample_pqr(
    ds_p: &dyn DataSource,
    ds_q: &dyn DataSource,
    ds_r: &dyn DataSource,
    n: usize,
    trial: u64,
) -> Result<(Sample, Sample, Sample)> {
    Ok((
        ds_p.sample(n, trial.wrapping_add(1))?,
        ds_q.sample(n, trial.wrapping_add(2))?,
        ds_r.sample(n, trial.wrapping_add(3))?,
    ))
}

/// Settings for [`sc_ume_random_locations`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomLocationsConfig {
    /// Locations per set.
    pub j: usize,
    pub mode: LocationMode,
    pub alpha: f64,
    /// Rows used by the median heuristic.
    pub median_subsample: usize,
}

impl Default for RandomLocationsConfig {
    fn default() -> Self {
        Self { j: 1, mode: LocationMode::Shared, alpha: 0.05, median_subsample: 1000 }
    }
}

/// Settings for [`sc_ume_optimized_locations`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizedLocationsConfig {
    pub j: usize,
    pub alpha: f64,
    /// Fraction of each sample used to tune the locations.
    pub train_proportion: f64,
    pub optimizer: OptimizerOptions,
}

impl Default for OptimizedLocationsConfig {
    fn default() -> Self {
        Self { j: 1, alpha: 0.05, train_proportion: 0.5, optimizer: OptimizerOptions::default() }
    }
}

/// Test outcome plus the wall time of the trial, excluding sampling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialResult {
    pub test: TestResult,
    pub time_secs: f64,
}

fn sources<'m>(p: &'m dyn Model, q: &'m dyn Model) -> Outcome<(&'m dyn DataSource, &'m dyn DataSource)> {
    let missing = |candidate: Candidate, model: &dyn Model| {
        debug!(?candidate, model = model.label(), "model has no data source");
        Outcome::NotApplicable(Inapplicable::MissingDataSource {
            candidate,
            model: model.label().to_string(),
        })
    };
    match (p.data_source(), q.data_source()) {
        (Some(a), Some(b)) => Outcome::Applicable((a, b)),
        (None, _) => missing(Candidate::P, p),
        (_, None) => missing(Candidate::Q, q),
    }
}

fn median_kernel(samples: &[&Sample], subsample: usize) -> Result<GaussianKernel> {
    let pooled = Sample::stack(samples)?;
    let med = median_distance(pooled.data(), subsample)?;
    GaussianKernel::new(med * med)
}

/// SC-UME with J random locations reserved from the samples and
/// median-heuristic bandwidths.
///
/// In two-set mode (P, R) and (Q, R) get their own location sets and their
/// own kernels, from the median distance of X ∪ Z and Y ∪ Z. In shared mode
/// one set and one kernel from X ∪ Y ∪ Z serve both.
pub fn sc_ume_random_locations(
    p: &dyn Model,
    q: &dyn Model,
    ds_r: &dyn DataSource,
    n: usize,
    trial: u64,
    cfg: &RandomLocationsConfig,
) -> Result<Outcome<TrialResult>> {
    let (ds_p, ds_q) = match sources(p, q) {
        Outcome::Applicable(pair) => pair,
        Outcome::NotApplicable(why) => return Ok(Outcome::NotApplicable(why)),
    };
    let (x, y, z) = sample_pqr(ds_p, ds_q, ds_r, n, trial)?;
    let start = Instant::now();

    let split = match reserve_locations(&x, &y, &z, cfg.j, cfg.mode, trial)? {
        Outcome::Applicable(split) => split,
        Outcome::NotApplicable(why) => return Ok(Outcome::NotApplicable(why)),
    };
    let (k, l) = match cfg.mode {
        LocationMode::Shared => {
            let k = median_kernel(&[&split.x, &split.y, &split.z], cfg.median_subsample)?;
            (k, k)
        }
        LocationMode::TwoSets => (
            median_kernel(&[&split.x, &split.z], cfg.median_subsample)?,
            median_kernel(&[&split.y, &split.z], cfg.median_subsample)?,
        ),
    };

    let test = ScUme::new(split.x, split.y, k, l, split.v, split.w, cfg.alpha)?;
    let result = test.perform_test(&split.z)?;
    Ok(Outcome::Applicable(TrialResult { test: result, time_secs: start.elapsed().as_secs_f64() }))
}

/// SC-UME with locations and bandwidth optimized on a training split.
///
/// Each sample is split with `train_proportion`; the initial J locations are
/// random training points and the initial bandwidth is the squared median
/// distance of the pooled training data. The test runs on the held-out parts
/// with the optimized locations shared by both comparisons.
pub fn sc_ume_optimized_locations(
    p: &dyn Model,
    q: &dyn Model,
    ds_r: &dyn DataSource,
    n: usize,
    trial: u64,
    cfg: &OptimizedLocationsConfig,
) -> Result<Outcome<TrialResult>> {
    if cfg.j == 0 {
        return Err(Error::InvalidLocations("need at least one test location"));
    }
    let (ds_p, ds_q) = match sources(p, q) {
        Outcome::Applicable(pair) => pair,
        Outcome::NotApplicable(why) => return Ok(Outcome::NotApplicable(why)),
    };
    let (x, y, z) = sample_pqr(ds_p, ds_q, ds_r, n, trial)?;
    let start = Instant::now();

    // One seed for all three keeps the pairs aligned.
    let (x_tr, x_te) = x.split(cfg.train_proportion, trial)?;
    let (y_tr, y_te) = y.split(cfg.train_proportion, trial)?;
    let (z_tr, z_te) = z.split(cfg.train_proportion, trial)?;

    let pooled = Sample::stack(&[&x_tr, &y_tr, &z_tr])?;
    let v0 = match subsample_rows(pooled.data(), cfg.j, trial.wrapping_add(4)) {
        Outcome::Applicable(v0) => v0,
        Outcome::NotApplicable(why) => return Ok(Outcome::NotApplicable(why)),
    };
    let med = median_distance(pooled.data(), cfg.optimizer.median_subsample)?;

    let opt = optimize_locations(&x_tr, &y_tr, &z_tr, v0.view(), med * med, &cfg.optimizer)?;
    let kernel = GaussianKernel::new(opt.gwidth)?;
    let test = ScUme::shared(x_te, y_te, kernel, opt.locations, cfg.alpha)?;
    let result = test.perform_test(&z_te)?;
    Ok(Outcome::Applicable(TrialResult { test: result, time_secs: start.elapsed().as_secs_f64() }))
}

/// Identifies one trial of one method on one problem.
///
/// Floating-point settings are keyed by their bit patterns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TrialKey {
    pub problem: String,
    pub method: String,
    pub n: usize,
    pub trial: u64,
    alpha_bits: u64,
    split_bits: u64,
}

impl TrialKey {
    /// `train_proportion` is `None` for methods that do not split the data.
    pub fn new(
        problem: impl Into<String>,
        method: impl Into<String>,
        n: usize,
        trial: u64,
        alpha: f64,
        train_proportion: Option<f64>,
    ) -> Self {
        Self {
            problem: problem.into(),
            method: method.into(),
            n,
            trial,
            alpha_bits: alpha.to_bits(),
            split_bits: train_proportion.map_or(u64::MAX, f64::to_bits),
        }
    }

    pub fn alpha(&self) -> f64 {
        f64::from_bits(self.alpha_bits)
    }

    pub fn train_proportion(&self) -> Option<f64> {
        (self.split_bits != u64::MAX).then(|| f64::from_bits(self.split_bits))
    }
}

/// In-memory memo of trial outcomes. Not-applicable outcomes are cached
/// too, so a trial that cannot run is not retried.
#[derive(Debug, Clone)]
pub struct ResultCache<T> {
    entries: HashMap<TrialKey, Outcome<T>>,
}

impl<T> Default for ResultCache<T> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<T> ResultCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &TrialKey) -> Option<&Outcome<T>> {
        self.entries.get(key)
    }

    /// Returns the previous outcome for `key`, if any.
    pub fn insert(&mut self, key: TrialKey, outcome: Outcome<T>) -> Option<Outcome<T>> {
        self.entries.insert(key, outcome)
    }

    /// Cached outcome for `key`, running `f` on a miss. Errors from `f` are
    /// returned and nothing is cached.
    pub fn get_or_try_insert_with<F>(&mut self, key: TrialKey, f: F) -> Result<&Outcome<T>>
    where
        F: FnOnce() -> Result<Outcome<T>>,
    {
        match self.entries.entry(key) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let outcome = f()?;
                Ok(e.insert(outcome))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ComposedModel, IsotropicNormal};
    use ndarray::array;

    fn normal_model(label: &str, mean: f64) -> ComposedModel {
        ComposedModel::from_source(label, IsotropicNormal::new(array![mean, 0.0], 1.0).unwrap())
    }

    #[test]
    fn test_sample_pqr_seeds() {
        let ds = IsotropicNormal::new(array![0.0], 1.0).unwrap();
        let (x, y, z) = sample_pqr(&ds, &ds, &ds, 10, 4).unwrap();
        assert_eq!(x, ds.sample(10, 5).unwrap());
        assert_eq!(y, ds.sample(10, 6).unwrap());
        assert_eq!(z, ds.sample(10, 7).unwrap());
    }

    #[test]
    fn test_random_locations_trial_runs() {
        let p = normal_model("p", 1.0);
        let q = normal_model("q", 0.1);
        let r = IsotropicNormal::new(array![0.0, 0.0], 1.0).unwrap();
        for mode in [LocationMode::Shared, LocationMode::TwoSets] {
            let cfg = RandomLocationsConfig { j: 3, mode, ..Default::default() };
            let res = sc_ume_random_locations(&p, &q, &r, 300, 0, &cfg).unwrap().applicable().unwrap();
            assert!((0.0..=1.0).contains(&res.test.p_value));
            assert_eq!(res.test.alpha, 0.05);
        }
    }

    #[test]
    fn test_random_locations_deterministic() {
        let p = normal_model("p", 0.5);
        let q = normal_model("q", 0.3);
        let r = IsotropicNormal::new(array![0.0, 0.0], 1.0).unwrap();
        let cfg = RandomLocationsConfig::default();
        let a = sc_ume_random_locations(&p, &q, &r, 100, 7, &cfg).unwrap().applicable().unwrap();
        let b = sc_ume_random_locations(&p, &q, &r, 100, 7, &cfg).unwrap().applicable().unwrap();
        assert_eq!(a.test.statistic.to_bits(), b.test.statistic.to_bits());
    }

    #[test]
    fn test_large_j_not_applicable() {
        let p = normal_model("p", 0.5);
        let q = normal_model("q", 0.3);
        let r = IsotropicNormal::new(array![0.0, 0.0], 1.0).unwrap();
        let cfg = RandomLocationsConfig { j: 20, ..Default::default() };
        let out = sc_ume_random_locations(&p, &q, &r, 20, 0, &cfg).unwrap();
        assert!(matches!(out, Outcome::NotApplicable(Inapplicable::InsufficientPool { .. })));
    }

    #[test]
    fn test_missing_source_not_applicable() {
        let p = normal_model("p", 0.5);
        let q = ComposedModel::without_source("density only");
        let r = IsotropicNormal::new(array![0.0, 0.0], 1.0).unwrap();
        let out = sc_ume_random_locations(&p, &q, &r, 50, 0, &RandomLocationsConfig::default()).unwrap();
        assert!(matches!(
            out,
            Outcome::NotApplicable(Inapplicable::MissingDataSource { candidate: Candidate::Q, .. })
        ));
        let out = sc_ume_optimized_locations(&q, &p, &r, 50, 0, &OptimizedLocationsConfig::default())
            .unwrap();
        assert!(matches!(
            out,
            Outcome::NotApplicable(Inapplicable::MissingDataSource { candidate: Candidate::P, .. })
        ));
    }

    #[test]
    fn test_optimized_locations_trial_runs() {
        let p = normal_model("p", 1.0);
        let q = normal_model("q", 0.1);
        let r = IsotropicNormal::new(array![0.0, 0.0], 1.0).unwrap();
        let cfg = OptimizedLocationsConfig {
            j: 2,
            optimizer: OptimizerOptions { max_iter: 20, median_subsample: 200, ..Default::default() },
            ..Default::default()
        };
        let res = sc_ume_optimized_locations(&p, &q, &r, 400, 1, &cfg).unwrap().applicable().unwrap();
        assert!(res.test.statistic.is_finite());
        assert!(res.time_secs >= res.test.time_secs);
    }

    #[test]
    fn test_config_from_json() {
        let cfg: OptimizedLocationsConfig =
            serde_json::from_str(r#"{"j": 3, "optimizer": {"max_iter": 5}}"#).unwrap();
        assert_eq!(cfg.j, 3);
        assert_eq!(cfg.train_proportion, 0.5);
        assert_eq!(cfg.optimizer.max_iter, 5);
        assert_eq!(cfg.optimizer.reg, 1e-3);

        let cfg: RandomLocationsConfig = serde_json::from_str(r#"{"mode": "TwoSets"}"#).unwrap();
        assert_eq!(cfg.mode, LocationMode::TwoSets);
        assert_eq!(cfg.j, 1);
    }

    #[test]
    fn test_trial_key_distinguishes_settings() {
        let a = TrialKey::new("gmm", "sc_ume_rand", 500, 3, 0.05, None);
        let b = TrialKey::new("gmm", "sc_ume_rand", 500, 3, 0.01, None);
        let c = TrialKey::new("gmm", "sc_ume_opt", 500, 3, 0.05, Some(0.5));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, TrialKey::new("gmm", "sc_ume_rand", 500, 3, 0.05, None));
        assert_eq!(c.train_proportion(), Some(0.5));
        assert_eq!(a.train_proportion(), None);
        assert_eq!(b.alpha(), 0.01);
    }

    #[test]
    fn test_cache_hits_skip_work() {
        let mut cache: ResultCache<u32> = ResultCache::new();
        let key = TrialKey::new("p", "m", 10, 0, 0.05, None);
        let mut calls = 0;
        for _ in 0..3 {
            let out = cache
                .get_or_try_insert_with(key.clone(), || {
                    calls += 1;
                    Ok(Outcome::Applicable(7))
                })
                .unwrap();
            assert_eq!(out, &Outcome::Applicable(7));
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.len(), 1);

        let other = TrialKey::new("p", "m", 10, 1, 0.05, None);
        assert!(cache
            .get_or_try_insert_with(other.clone(), || Err(Error::EmptyInput))
            .is_err());
        assert!(cache.get(&other).is_none());

        let why = Inapplicable::InsufficientPool { requested: 5, available: 2 };
        cache.insert(other.clone(), Outcome::NotApplicable(why.clone()));
        assert_eq!(cache.get(&other), Some(&Outcome::NotApplicable(why)));
    }
}
