//! Gradient-based tuning of test locations and the Gaussian bandwidth.
//!
//! Both optimizers maximize the [power criterion](crate::criterion) over
//! θ = [√σ², location parameters] with box-constrained L-BFGS. The bandwidth
//! enters through its square root so that every θ inside the box gives a
//! strictly positive σ².
//!
//! - [`optimize_locations`] moves the locations directly in data space.
//! - [`optimize_latent_locations`] moves latent codes zₚ, z_q in [-1, 1]^d
//!   and maps them through two generators; the 2J generated points serve as
//!   the one shared location set. Gradients reach the codes through each
//!   generator's Jacobian.
//!
//! Box constraints are handled by clamping parameters on every evaluation and
//! zeroing gradient components that push further out of the box.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::criterion::{power_criterion, power_criterion_grad};
use crate::data::Sample;
use crate::generator::{Generator, GeneratorContext};
use crate::kernel::{bandwidth_bounds, median_distance, GaussianKernel};
use crate::{Error, Result};

/// Latent codes live in this box, coordinate-wise.
const LATENT_BOUNDS: (f64, f64) = (-1.0, 1.0);

/// Optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerOptions {
    /// Added to the variance in the criterion denominator.
    pub reg: f64,
    pub max_iter: u64,
    /// Stop when the objective changes less than this between iterations.
    pub tol_fun: f64,
    /// Stop when the gradient norm drops below this.
    pub tol_grad: f64,
    /// L-BFGS memory.
    pub history: usize,
    /// Log every objective evaluation at `info` level.
    pub display: bool,
    /// Explicit σ² bounds; derived from the median heuristic when absent.
    pub gwidth_lower: Option<f64>,
    pub gwidth_upper: Option<f64>,
    /// Data-space location boxes extend this many standard deviations past
    /// the pooled data range.
    pub locs_bounds_frac: f64,
    /// Rows used by the median heuristic.
    pub median_subsample: usize,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            reg: 1e-3,
            max_iter: 100,
            tol_fun: 1e-6,
            tol_grad: 1e-8,
            history: 10,
            display: false,
            gwidth_lower: None,
            gwidth_upper: None,
            locs_bounds_frac: 100.0,
            median_subsample: 1000,
        }
    }
}

impl OptimizerOptions {
    fn validate(&self) -> Result<()> {
        if !(self.reg.is_finite() && self.reg > 0.0) {
            return Err(Error::InvalidRegularization(self.reg));
        }
        if !(self.tol_fun >= 0.0 && self.tol_grad >= 0.0) {
            return Err(Error::InvalidConfig("tolerances must be non-negative"));
        }
        if self.history == 0 {
            return Err(Error::InvalidConfig("L-BFGS history must be at least 1"));
        }
        if !(self.locs_bounds_frac.is_finite() && self.locs_bounds_frac >= 0.0) {
            return Err(Error::InvalidConfig("locs_bounds_frac must be non-negative"));
        }
        Ok(())
    }
}

/// Summary of one optimizer run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub n_iter: u64,
    pub n_fev: usize,
    pub n_gev: usize,
    /// Power criterion at the returned parameters.
    pub objective: f64,
    pub converged: bool,
    pub message: String,
    pub time_secs: f64,
}

/// Result of [`optimize_locations`].
#[derive(Debug, Clone)]
pub struct LocationOptimum {
    /// J×d locations, used as both V and W.
    pub locations: Array2<f64>,
    pub gwidth: f64,
    pub report: OptimizationReport,
}

/// Result of [`optimize_latent_locations`].
#[derive(Debug, Clone)]
pub struct LatentOptimum {
    pub zp: Array2<f64>,
    pub zq: Array2<f64>,
    /// 2J×d: generated from `zp`, then from `zq`. Used as both V and W.
    pub locations: Array2<f64>,
    pub gwidth: f64,
    pub report: OptimizationReport,
}

// --- Bounded L-BFGS ---

/// A smooth function to minimize.
trait Objective {
    fn value_and_grad(&self, theta: &[f64]) -> Result<(f64, Vec<f64>)>;

    fn value(&self, theta: &[f64]) -> Result<f64> {
        Ok(self.value_and_grad(theta)?.0)
    }
}

#[derive(Default)]
struct EvalLog {
    cost: AtomicUsize,
    grad: AtomicUsize,
    failure: Mutex<Option<Error>>,
}

impl EvalLog {
    /// Keep the first crate error so it survives the trip through argmin.
    fn fail(&self, e: Error) -> argmin::core::Error {
        let msg = e.to_string();
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert(e);
        }
        argmin::core::Error::msg(msg)
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }
}

fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

struct ArgminProblem<'a, O> {
    objective: &'a O,
    bounds: &'a [(f64, f64)],
    log: Arc<EvalLog>,
    display: bool,
}

impl<O: Objective> CostFunction for ArgminProblem<'_, O> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        let count = self.log.cost.fetch_add(1, Ordering::Relaxed) + 1;
        let clamped = clamp_params(params, self.bounds);
        let value = self.objective.value(&clamped).map_err(|e| self.log.fail(e))?;
        if self.display {
            info!(eval = count, objective = value, "objective evaluation");
        }
        Ok(value)
    }
}

impl<O: Objective> Gradient for ArgminProblem<'_, O> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        self.log.grad.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        let (_, mut g) = self.objective.value_and_grad(&clamped).map_err(|e| self.log.fail(e))?;

        // At a bound, drop components pointing out of the box.
        const EPS: f64 = 1e-12;
        for (gi, (&x, &(lo, hi))) in g.iter_mut().zip(clamped.iter().zip(self.bounds)) {
            if (x <= lo + EPS && *gi > 0.0) || (x >= hi - EPS && *gi < 0.0) {
                *gi = 0.0;
            }
        }
        Ok(g)
    }
}

struct Minimum {
    params: Vec<f64>,
    fval: f64,
    n_iter: u64,
    n_fev: usize,
    n_gev: usize,
    converged: bool,
    message: String,
}

fn minimize<O: Objective>(
    objective: &O,
    init: &[f64],
    bounds: &[(f64, f64)],
    opts: &OptimizerOptions,
) -> Result<Minimum> {
    if init.len() != bounds.len() {
        return Err(Error::DimensionMismatch(bounds.len(), init.len()));
    }
    let init = clamp_params(init, bounds);
    let log = Arc::new(EvalLog::default());
    let problem = ArgminProblem { objective, bounds, log: log.clone(), display: opts.display };

    let solver = LBFGS::new(MoreThuenteLineSearch::new(), opts.history)
        .with_tolerance_grad(opts.tol_grad)
        .map_err(|e| Error::Optimizer(format!("invalid tol_grad: {e}")))?
        .with_tolerance_cost(opts.tol_fun)
        .map_err(|e| Error::Optimizer(format!("invalid tol_fun: {e}")))?;

    let res = Executor::new(problem, solver)
        .configure(|state| state.param(init).max_iters(opts.max_iter))
        .run();
    let res = match res {
        Ok(res) => res,
        Err(e) => return Err(log.take_failure().unwrap_or_else(|| Error::Optimizer(e.to_string()))),
    };

    let state = res.state();
    let best = state
        .get_best_param()
        .ok_or_else(|| Error::Optimizer("no best parameters found".into()))?;
    let termination = state.get_termination_status();
    Ok(Minimum {
        params: clamp_params(best, bounds),
        fval: state.get_best_cost(),
        n_iter: state.get_iter(),
        n_fev: log.cost.load(Ordering::Relaxed),
        n_gev: log.grad.load(Ordering::Relaxed),
        converged: matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        ),
        message: termination.to_string(),
    })
}

// --- Location parameterizations ---

/// How the location block of θ becomes a location matrix.
trait LocationMap {
    fn locations(&self, theta: &[f64]) -> Result<Array2<f64>>;

    /// Chain rule: ∂c/∂θ from ∂c/∂locations.
    fn pullback(&self, theta: &[f64], d_locations: &Array2<f64>) -> Result<Vec<f64>>;
}

/// Locations are the parameters.
struct DataSpace {
    j: usize,
    d: usize,
}

impl LocationMap for DataSpace {
    fn locations(&self, theta: &[f64]) -> Result<Array2<f64>> {
        Array2::from_shape_vec((self.j, self.d), theta.to_vec())
            .map_err(|_| Error::DimensionMismatch(self.j * self.d, theta.len()))
    }

    fn pullback(&self, _theta: &[f64], d_locations: &Array2<f64>) -> Result<Vec<f64>> {
        Ok(d_locations.iter().copied().collect())
    }
}

/// Locations are generated from J latent codes per model.
struct LatentSpace<'g, Gp, Gq> {
    gen_p: &'g Gp,
    gen_q: &'g Gq,
    ctx: &'g GeneratorContext,
    j: usize,
}

impl<Gp: Generator, Gq: Generator> LatentSpace<'_, Gp, Gq> {
    fn codes<'t>(&self, theta: &'t [f64]) -> Result<(ArrayView2<'t, f64>, ArrayView2<'t, f64>)> {
        let (dp, dq) = (self.gen_p.latent_dim(), self.gen_q.latent_dim());
        let expected = self.j * (dp + dq);
        if theta.len() != expected {
            return Err(Error::DimensionMismatch(expected, theta.len()));
        }
        let (a, b) = theta.split_at(self.j * dp);
        let zp = ArrayView2::from_shape((self.j, dp), a)
            .map_err(|_| Error::DimensionMismatch(self.j * dp, a.len()))?;
        let zq = ArrayView2::from_shape((self.j, dq), b)
            .map_err(|_| Error::DimensionMismatch(self.j * dq, b.len()))?;
        Ok((zp, zq))
    }
}

impl<Gp: Generator, Gq: Generator> LocationMap for LatentSpace<'_, Gp, Gq> {
    fn locations(&self, theta: &[f64]) -> Result<Array2<f64>> {
        let (zp, zq) = self.codes(theta)?;
        let xp = self.gen_p.generate(zp, self.ctx)?;
        let xq = self.gen_q.generate(zq, self.ctx)?;
        concatenate(Axis(0), &[xp.view(), xq.view()])
            .map_err(|_| Error::DimensionMismatch(xp.ncols(), xq.ncols()))
    }

    fn pullback(&self, theta: &[f64], d_locations: &Array2<f64>) -> Result<Vec<f64>> {
        let (zp, zq) = self.codes(theta)?;
        let mut grad = Vec::with_capacity(theta.len());
        for (i, z) in zp.outer_iter().enumerate() {
            let jac = self.gen_p.jacobian(z, self.ctx)?;
            grad.extend(jac.t().dot(&d_locations.row(i)));
        }
        for (i, z) in zq.outer_iter().enumerate() {
            let jac = self.gen_q.jacobian(z, self.ctx)?;
            grad.extend(jac.t().dot(&d_locations.row(self.j + i)));
        }
        Ok(grad)
    }
}

/// −criterion over θ = [√σ², location block].
struct CriterionObjective<'a, M> {
    p: &'a Sample,
    q: &'a Sample,
    r: &'a Sample,
    map: M,
    reg: f64,
}

impl<M: LocationMap> CriterionObjective<'_, M> {
    /// Criterion and its gradient with respect to θ.
    fn criterion(&self, theta: &[f64]) -> Result<(f64, Vec<f64>)> {
        let (&s, rest) = theta.split_first().ok_or(Error::EmptyInput)?;
        let locs = self.map.locations(rest)?;
        let g = power_criterion_grad(self.p, self.q, self.r, s, locs.view(), self.reg)?;
        let mut grad = Vec::with_capacity(theta.len());
        grad.push(g.d_sqrt_gwidth);
        grad.extend(self.map.pullback(rest, &g.d_locations)?);
        if grad.iter().any(|v| !v.is_finite()) {
            return Err(Error::NumericDegeneracy("criterion gradient is not finite".into()));
        }
        Ok((g.value, grad))
    }

    fn criterion_value(&self, theta: &[f64]) -> Result<f64> {
        let (&s, rest) = theta.split_first().ok_or(Error::EmptyInput)?;
        let locs = self.map.locations(rest)?;
        let k = GaussianKernel::new(s * s)?;
        power_criterion(self.p, self.q, self.r, &k, &k, locs.view(), locs.view(), self.reg)
    }
}

impl<M: LocationMap> Objective for CriterionObjective<'_, M> {
    fn value_and_grad(&self, theta: &[f64]) -> Result<(f64, Vec<f64>)> {
        let (v, g) = self.criterion(theta)?;
        Ok((-v, g.into_iter().map(|x| -x).collect()))
    }

    fn value(&self, theta: &[f64]) -> Result<f64> {
        Ok(-self.criterion_value(theta)?)
    }
}

// --- Shared driver ---

fn gwidth_box(p: &Sample, q: &Sample, r: &Sample, opts: &OptimizerOptions) -> Result<(f64, f64)> {
    match (opts.gwidth_lower, opts.gwidth_upper) {
        (Some(lb), Some(ub)) => bandwidth_bounds(f64::NAN, Some(lb), Some(ub)),
        (lower, upper) => {
            let pooled = Sample::stack(&[p, q, r])?;
            let med = median_distance(pooled.data(), opts.median_subsample)?;
            bandwidth_bounds(med * med, lower, upper)
        }
    }
}

/// Runs L-BFGS and converts the best θ into (σ², locations, report).
fn run<M: LocationMap>(
    objective: &CriterionObjective<'_, M>,
    init: Vec<f64>,
    bounds: Vec<(f64, f64)>,
    opts: &OptimizerOptions,
    start: Instant,
) -> Result<(Vec<f64>, f64, Array2<f64>, OptimizationReport)> {
    let min = minimize(objective, &init, &bounds, opts)?;
    let sqrt_gwidth = min.params[0];
    let gwidth = sqrt_gwidth * sqrt_gwidth;
    if !(gwidth.is_finite() && gwidth > 0.0) {
        return Err(Error::NumericDegeneracy(format!("optimized bandwidth is {gwidth}")));
    }
    let criterion = -min.fval;
    if !criterion.is_finite() {
        return Err(Error::NumericDegeneracy(format!("optimized criterion is {criterion}")));
    }
    let locations = objective.map.locations(&min.params[1..])?;
    let report = OptimizationReport {
        n_iter: min.n_iter,
        n_fev: min.n_fev,
        n_gev: min.n_gev,
        objective: criterion,
        converged: min.converged,
        message: min.message,
        time_secs: start.elapsed().as_secs_f64(),
    };
    info!(
        n_iter = report.n_iter,
        n_fev = report.n_fev,
        objective = report.objective,
        gwidth,
        converged = report.converged,
        "location optimization finished"
    );
    Ok((min.params, gwidth, locations, report))
}

fn check_gwidth0(gwidth0: f64) -> Result<()> {
    if !(gwidth0.is_finite() && gwidth0 > 0.0) {
        return Err(Error::InvalidBandwidth(gwidth0));
    }
    Ok(())
}

/// Optimize J data-space locations `v0` and the bandwidth `gwidth0`.
///
/// Each location coordinate is boxed to the pooled data range widened by
/// `locs_bounds_frac` standard deviations.
pub fn optimize_locations(
    p: &Sample,
    q: &Sample,
    r: &Sample,
    v0: ArrayView2<f64>,
    gwidth0: f64,
    opts: &OptimizerOptions,
) -> Result<LocationOptimum> {
    let start = Instant::now();
    opts.validate()?;
    check_gwidth0(gwidth0)?;
    if v0.nrows() == 0 {
        return Err(Error::InvalidLocations("need at least one test location"));
    }
    if v0.ncols() != p.dim() {
        return Err(Error::DimensionMismatch(p.dim(), v0.ncols()));
    }

    let (lb, ub) = gwidth_box(p, q, r, opts)?;
    let pooled = Sample::stack(&[p, q, r])?;
    let data = pooled.data();
    let coord_bounds: Vec<(f64, f64)> = data
        .axis_iter(Axis(1))
        .map(|col| {
            let lo = col.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = col.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let pad = opts.locs_bounds_frac * col.std(0.0);
            (lo - pad, hi + pad)
        })
        .collect();

    let d = v0.ncols();
    let mut bounds = vec![(lb.sqrt(), ub.sqrt())];
    bounds.extend((0..v0.len()).map(|i| coord_bounds[i % d]));
    let mut init = vec![gwidth0.sqrt()];
    init.extend(v0.iter().copied());

    info!(j = v0.nrows(), d, gwidth_lower = lb, gwidth_upper = ub, "optimizing test locations");
    let objective = CriterionObjective { p, q, r, map: DataSpace { j: v0.nrows(), d }, reg: opts.reg };
    let (_, gwidth, locations, report) = run(&objective, init, bounds, opts, start)?;
    Ok(LocationOptimum { locations, gwidth, report })
}

/// Optimize latent codes `zp0`, `zq0` (J rows each) and the bandwidth.
///
/// The location set is `[gen_p(zp); gen_q(zq)]` with outputs clipped to
/// `ctx.output_range`. Codes are boxed to [-1, 1].
#[allow(clippy::too_many_arguments)]
pub fn optimize_latent_locations<Gp: Generator, Gq: Generator>(
    p: &Sample,
    q: &Sample,
    r: &Sample,
    gen_p: &Gp,
    gen_q: &Gq,
    zp0: ArrayView2<f64>,
    zq0: ArrayView2<f64>,
    gwidth0: f64,
    opts: &OptimizerOptions,
    ctx: &GeneratorContext,
) -> Result<LatentOptimum> {
    let start = Instant::now();
    opts.validate()?;
    check_gwidth0(gwidth0)?;
    let j = zp0.nrows();
    if j == 0 {
        return Err(Error::InvalidLocations("need at least one latent code"));
    }
    if zq0.nrows() != j {
        return Err(Error::InvalidLocations("zp and zq must have the same number of codes"));
    }
    if zp0.ncols() != gen_p.latent_dim() {
        return Err(Error::DimensionMismatch(gen_p.latent_dim(), zp0.ncols()));
    }
    if zq0.ncols() != gen_q.latent_dim() {
        return Err(Error::DimensionMismatch(gen_q.latent_dim(), zq0.ncols()));
    }
    for out in [gen_p.output_dim(), gen_q.output_dim()] {
        if out != p.dim() {
            return Err(Error::DimensionMismatch(p.dim(), out));
        }
    }

    let (lb, ub) = gwidth_box(p, q, r, opts)?;
    let n_codes = zp0.len() + zq0.len();
    let mut bounds = vec![(lb.sqrt(), ub.sqrt())];
    bounds.extend(std::iter::repeat(LATENT_BOUNDS).take(n_codes));
    let mut init = vec![gwidth0.sqrt()];
    init.extend(zp0.iter().chain(zq0.iter()).copied());

    info!(j, gwidth_lower = lb, gwidth_upper = ub, "optimizing latent test locations");
    let map = LatentSpace { gen_p, gen_q, ctx, j };
    let objective = CriterionObjective { p, q, r, map, reg: opts.reg };
    let (params, gwidth, locations, report) = run(&objective, init, bounds, opts, start)?;

    let (zp, zq) = objective.map.codes(&params[1..])?;
    Ok(LatentOptimum { zp: zp.to_owned(), zq: zq.to_owned(), locations, gwidth, report })
}
