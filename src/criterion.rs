//! Power criterion for choosing test locations and the bandwidth.
//!
//! For large n the SC-UME test power is increasing in
//!
//! ```text
//! D / √(ζ² + reg)
//! ```
//!
//! where D = UME²(P, R) − UME²(Q, R) and ζ² is the asymptotic variance from
//! [`crate::three_sample`]. The √n factor is dropped; it does not change the
//! maximizer. `reg > 0` keeps the ratio finite when the variance collapses,
//! e.g. when the bandwidth is tiny and every feature is zero.
//!
//! [`power_criterion_grad`] records the same computation on a [`Tape`] with
//! one shared kernel and one shared location set, giving the exact gradient
//! with respect to √σ² and every location coordinate in a single backward
//! pass.

use ndarray::{Array2, ArrayView2};

use crate::data::Sample;
use crate::kernel::GaussianKernel;
use crate::tape::{ConstSlice, Tape, Var, VarSlice};
use crate::three_sample::difference_moments;
use crate::embedding::UmeFeatures;
use crate::{Error, Result};

/// Criterion value and its gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct CriterionGradient {
    pub value: f64,
    /// ∂/∂√σ².
    pub d_sqrt_gwidth: f64,
    /// ∂/∂V, same shape as the locations.
    pub d_locations: Array2<f64>,
}

fn check_reg(reg: f64) -> Result<()> {
    if !(reg.is_finite() && reg > 0.0) {
        return Err(Error::InvalidRegularization(reg));
    }
    Ok(())
}

fn check_triplet(p: &Sample, q: &Sample, r: &Sample) -> Result<()> {
    for (what, s) in [("Q sample", q), ("R sample", r)] {
        if s.len() != p.len() {
            return Err(Error::SampleSizeMismatch { what, expected: p.len(), got: s.len() });
        }
        if s.dim() != p.dim() {
            return Err(Error::DimensionMismatch(p.dim(), s.dim()));
        }
    }
    if p.len() < 2 {
        return Err(Error::TooFewPoints(p.len()));
    }
    Ok(())
}

/// Power criterion with kernel `k` and locations `v` for (P, R), and `l`,
/// `w` for (Q, R).
#[allow(clippy::too_many_arguments)]
pub fn power_criterion(
    p: &Sample,
    q: &Sample,
    r: &Sample,
    k: &GaussianKernel,
    l: &GaussianKernel,
    v: ArrayView2<f64>,
    w: ArrayView2<f64>,
    reg: f64,
) -> Result<f64> {
    check_reg(reg)?;
    check_triplet(p, q, r)?;
    if v.nrows() != w.nrows() {
        return Err(Error::InvalidLocations("V and W must have the same number of locations"));
    }
    let fp = UmeFeatures::new(p, r, v, k)?;
    let fq = UmeFeatures::new(q, r, w, l)?;
    let m = difference_moments(&fp, &fq)?;
    let value = m.mean / (m.variance + reg).sqrt();
    if !value.is_finite() {
        return Err(Error::NumericDegeneracy(format!("power criterion is {value}")));
    }
    Ok(value)
}

/// Kernel values k(x, vⱼ) for one stored point against every location.
fn kernel_row(tape: &mut Tape, point: ConstSlice, locs: &[VarSlice], neg_inv_s2: Var) -> Vec<Var> {
    locs.iter()
        .map(|&v| {
            let d = tape.sq_dist(point, v);
            let a = tape.mul(d, neg_inv_s2);
            tape.exp(a)
        })
        .collect()
}

fn store_rows(tape: &mut Tape, data: ArrayView2<f64>) -> Vec<ConstSlice> {
    data.outer_iter().map(|row| tape.store(row.iter().copied())).collect()
}

/// Unbiased UME² and the first-order projections Fᵢ·μ̂, recorded on the tape.
fn ume_terms(tape: &mut Tape, features: &[Vec<Var>], n: f64) -> (Var, Vec<Var>) {
    let j = features.first().map_or(0, Vec::len);
    let means: Vec<Var> = (0..j)
        .map(|c| {
            let col: Vec<Var> = features.iter().map(|f| f[c]).collect();
            let s = tape.sum(&col);
            tape.mul_const(s, 1.0 / n)
        })
        .collect();

    let sq_means: Vec<Var> = means.iter().map(|&m| tape.square(m)).collect();
    let t1 = tape.sum(&sq_means);
    let t1 = tape.mul_const(t1, n / (n - 1.0));

    let sq_all: Vec<Var> = features.iter().flatten().map(|&f| tape.square(f)).collect();
    let t2 = tape.sum(&sq_all);
    let t2 = tape.mul_const(t2, 1.0 / (n * (n - 1.0)));
    let ume2 = tape.sub(t1, t2);

    let projections = features
        .iter()
        .map(|f| {
            let terms: Vec<Var> = f.iter().zip(&means).map(|(&a, &m)| tape.mul(a, m)).collect();
            tape.sum(&terms)
        })
        .collect();
    (ume2, projections)
}

/// Power criterion with one Gaussian kernel of width `sqrt_gwidth²` and one
/// location set used for both comparisons, plus its exact gradient.
pub fn power_criterion_grad(
    p: &Sample,
    q: &Sample,
    r: &Sample,
    sqrt_gwidth: f64,
    locations: ArrayView2<f64>,
    reg: f64,
) -> Result<CriterionGradient> {
    check_reg(reg)?;
    check_triplet(p, q, r)?;
    if locations.nrows() == 0 {
        return Err(Error::InvalidLocations("need at least one test location"));
    }
    if locations.ncols() != p.dim() {
        return Err(Error::DimensionMismatch(p.dim(), locations.ncols()));
    }
    let sigma2 = sqrt_gwidth * sqrt_gwidth;
    if !(sigma2.is_finite() && sigma2 > 0.0) {
        return Err(Error::InvalidBandwidth(sigma2));
    }

    let n = p.len();
    let nf = n as f64;
    let j = locations.nrows();
    let scale = 1.0 / (j as f64).sqrt();

    let mut tape = Tape::with_capacity(3 * n * j * 8);
    let s = tape.var(sqrt_gwidth);
    let locs: Vec<VarSlice> = locations.outer_iter().map(|row| tape.vars(&row.to_vec())).collect();
    let s2 = tape.square(s);
    let one = tape.constant(1.0);
    let inv_s2 = tape.div(one, s2);
    let neg_inv_s2 = tape.neg(inv_s2);

    let p_pts = store_rows(&mut tape, p.data());
    let q_pts = store_rows(&mut tape, q.data());
    let r_pts = store_rows(&mut tape, r.data());

    // k(zᵢ, V) is shared by both feature sets.
    let kr: Vec<Vec<Var>> =
        r_pts.iter().map(|&pt| kernel_row(&mut tape, pt, &locs, neg_inv_s2)).collect();

    let features = |tape: &mut Tape, pts: &[ConstSlice]| -> Vec<Vec<Var>> {
        pts.iter()
            .zip(&kr)
            .map(|(&pt, kz)| {
                kernel_row(tape, pt, &locs, neg_inv_s2)
                    .into_iter()
                    .zip(kz)
                    .map(|(kx, &kzj)| {
                        let d = tape.sub(kx, kzj);
                        tape.mul_const(d, scale)
                    })
                    .collect()
            })
            .collect()
    };
    let fp = features(&mut tape, &p_pts);
    let fq = features(&mut tape, &q_pts);

    let (ume_p, a) = ume_terms(&mut tape, &fp, nf);
    let (ume_q, b) = ume_terms(&mut tape, &fq, nf);
    let mean = tape.sub(ume_p, ume_q);

    let diffs: Vec<Var> = a.iter().zip(&b).map(|(&ai, &bi)| tape.sub(ai, bi)).collect();
    let dbar = tape.sum(&diffs);
    let dbar = tape.mul_const(dbar, 1.0 / nf);
    let devs: Vec<Var> = diffs
        .iter()
        .map(|&d| {
            let c = tape.sub(d, dbar);
            tape.square(c)
        })
        .collect();
    let variance = tape.sum(&devs);
    let variance = tape.mul_const(variance, 4.0 / (nf - 1.0));

    let denom = tape.add_const(variance, reg);
    let denom = tape.sqrt(denom);
    let crit = tape.div(mean, denom);

    let value = tape.val(crit);
    if !value.is_finite() {
        return Err(Error::NumericDegeneracy(format!("power criterion is {value}")));
    }
    tape.backward(crit);

    let d_locations =
        Array2::from_shape_fn((j, locations.ncols()), |(row, col)| tape.adjoint(locs[row].get(col)));
    Ok(CriterionGradient { value, d_sqrt_gwidth: tape.adjoint(s), d_locations })
}
