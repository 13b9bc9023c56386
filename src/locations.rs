//! Choosing test locations without touching the test data.
//!
//! A location that is also one of the sample points biases the statistic, so
//! random locations are drawn from a pool of points that is removed from the
//! samples first.

use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::Sample;
use crate::three_sample::{Inapplicable, Outcome};
use crate::{Error, Result};

/// Points each sample must keep after reservation.
const MIN_REMAINING: usize = 2;

/// Whether (P, R) and (Q, R) are compared at the same locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LocationMode {
    /// One set, V = W.
    #[default]
    Shared,
    /// Two independent sets V and W of equal size.
    TwoSets,
}

/// Samples with the location pool removed, plus the chosen locations.
#[derive(Debug, Clone)]
pub struct LocationSplit {
    pub x: Sample,
    pub y: Sample,
    pub z: Sample,
    pub v: Array2<f64>,
    pub w: Array2<f64>,
}

/// Move the first `j` points of each of `x`, `y`, `z` into a pool and pick the
/// locations from it at random.
///
/// In shared mode `j` pool points become V = W; with two sets, `2j` distinct
/// pool points are split into V and W. The remaining samples keep n − j points
/// each and stay paired.
pub fn reserve_locations(
    x: &Sample,
    y: &Sample,
    z: &Sample,
    j: usize,
    mode: LocationMode,
    seed: u64,
) -> Result<Outcome<LocationSplit>> {
    if j == 0 {
        return Err(Error::InvalidLocations("need at least one test location"));
    }
    for (what, s) in [("Y sample", y), ("Z sample", z)] {
        if s.len() != x.len() {
            return Err(Error::SampleSizeMismatch { what, expected: x.len(), got: s.len() });
        }
        if s.dim() != x.dim() {
            return Err(Error::DimensionMismatch(x.dim(), s.dim()));
        }
    }
    let available = x.len().saturating_sub(MIN_REMAINING);
    if j > available {
        debug!(j, n = x.len(), "not enough points to reserve test locations");
        return Ok(Outcome::NotApplicable(Inapplicable::InsufficientPool {
            requested: j,
            available,
        }));
    }

    let pool = Sample::stack(&[&x.head(j)?, &y.head(j)?, &z.head(j)?])?;
    let wanted = match mode {
        LocationMode::Shared => j,
        LocationMode::TwoSets => 2 * j,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let picked = index::sample(&mut rng, pool.len(), wanted).into_vec();
    let chosen = pool.data().select(Axis(0), &picked);
    let (v, w) = match mode {
        LocationMode::Shared => (chosen.clone(), chosen),
        LocationMode::TwoSets => {
            let (a, b) = chosen.view().split_at(Axis(0), j);
            (a.to_owned(), b.to_owned())
        }
    };

    Ok(Outcome::Applicable(LocationSplit {
        x: x.without_first(j)?,
        y: y.without_first(j)?,
        z: z.without_first(j)?,
        v,
        w,
    }))
}

/// `k` distinct rows of `data`, chosen uniformly with a seeded generator.
pub fn subsample_rows(data: ArrayView2<f64>, k: usize, seed: u64) -> Outcome<Array2<f64>> {
    let n = data.nrows();
    if k > n {
        debug!(k, n, "cannot subsample more rows than available");
        return Outcome::NotApplicable(Inapplicable::InsufficientPool { requested: k, available: n });
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let picked = index::sample(&mut rng, n, k).into_vec();
    Outcome::Applicable(data.select(Axis(0), &picked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ramp(n: usize, offset: f64) -> Sample {
        Sample::new(Array2::from_shape_fn((n, 1), |(i, _)| offset + i as f64)).unwrap()
    }

    #[test]
    fn test_shared_locations_come_from_pool() {
        let (x, y, z) = (ramp(10, 0.0), ramp(10, 100.0), ramp(10, 200.0));
        let split = reserve_locations(&x, &y, &z, 2, LocationMode::Shared, 3)
            .unwrap()
            .applicable()
            .unwrap();
        assert_eq!(split.v, split.w);
        assert_eq!(split.v.nrows(), 2);
        let pool = [0.0, 1.0, 100.0, 101.0, 200.0, 201.0];
        assert!(split.v.iter().all(|v| pool.contains(v)));
        assert_eq!(split.x.len(), 8);
        assert_eq!(split.x.data()[[0, 0]], 2.0);
        assert_eq!(split.z.data()[[0, 0]], 202.0);
    }

    #[test]
    fn test_two_sets_are_disjoint() {
        let (x, y, z) = (ramp(10, 0.0), ramp(10, 100.0), ramp(10, 200.0));
        let split = reserve_locations(&x, &y, &z, 3, LocationMode::TwoSets, 5)
            .unwrap()
            .applicable()
            .unwrap();
        assert_eq!(split.v.nrows(), 3);
        assert_eq!(split.w.nrows(), 3);
        for v in split.v.iter() {
            assert!(!split.w.iter().any(|w| w == v));
        }
    }

    #[test]
    fn test_reservation_is_seeded() {
        let (x, y, z) = (ramp(20, 0.0), ramp(20, 50.0), ramp(20, 90.0));
        let a = reserve_locations(&x, &y, &z, 4, LocationMode::TwoSets, 11).unwrap().applicable().unwrap();
        let b = reserve_locations(&x, &y, &z, 4, LocationMode::TwoSets, 11).unwrap().applicable().unwrap();
        assert_eq!(a.v, b.v);
        assert_eq!(a.w, b.w);
    }

    #[test]
    fn test_too_many_locations_not_applicable() {
        let (x, y, z) = (ramp(5, 0.0), ramp(5, 0.0), ramp(5, 0.0));
        assert!(reserve_locations(&x, &y, &z, 3, LocationMode::Shared, 0).unwrap().is_applicable());
        match reserve_locations(&x, &y, &z, 4, LocationMode::Shared, 0).unwrap() {
            Outcome::NotApplicable(Inapplicable::InsufficientPool { requested, available }) => {
                assert_eq!((requested, available), (4, 3));
            }
            other => panic!("expected InsufficientPool, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_locations_is_error() {
        let x = ramp(5, 0.0);
        assert!(matches!(
            reserve_locations(&x, &x, &x, 0, LocationMode::Shared, 0),
            Err(Error::InvalidLocations(_))
        ));
    }

    #[test]
    fn test_subsample_rows() {
        let data = array![[0.0], [1.0], [2.0], [3.0]];
        let rows = subsample_rows(data.view(), 3, 1).applicable().unwrap();
        assert_eq!(rows.nrows(), 3);
        let mut vals: Vec<f64> = rows.iter().copied().collect();
        vals.sort_by(f64::total_cmp);
        vals.dedup();
        assert_eq!(vals.len(), 3);
        assert!(!subsample_rows(data.view(), 5, 1).is_applicable());
    }
}
