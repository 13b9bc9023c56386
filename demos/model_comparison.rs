//! Comparing two candidate models against reference data.
//!
//! Demonstrates:
//! - SC-UME with random test locations
//! - Tuning locations and bandwidth on a training split
//! - Searching for informative locations in two generators' latent spaces
//!
//! Run: cargo run --example model_comparison

use ndarray::array;
use ume::{
    optimize_latent_locations, sc_ume_optimized_locations, sc_ume_random_locations, ComposedModel,
    DataSource, Generator, GeneratorContext, GeneratorSource, IsotropicNormal, MlpGenerator,
    OptimizedLocationsConfig, OptimizerOptions, Outcome, RandomLocationsConfig,
};

fn main() -> ume::Result<()> {
    println!("=== UME Three-Sample Model Comparison ===\n");

    let p = ComposedModel::from_source("P", IsotropicNormal::new(array![0.6, 0.0], 1.0)?);
    let q = ComposedModel::from_source("Q", IsotropicNormal::new(array![0.2, 0.0], 1.0)?);
    let r = IsotropicNormal::new(array![0.0, 0.0], 1.0)?;

    // =========================================================================
    // Demo 1: random locations
    // =========================================================================
    println!("--- Random locations (J = 5) ---\n");
    let cfg = RandomLocationsConfig { j: 5, ..Default::default() };
    println!("trial | statistic | p-value | reject H0");
    println!("------|-----------|---------|----------");
    for trial in 0..5 {
        match sc_ume_random_locations(&p, &q, &r, 600, trial, &cfg)? {
            Outcome::Applicable(res) => println!(
                "{:5} | {:9.3} | {:7.4} | {}",
                trial, res.test.statistic, res.test.p_value, res.test.h0_rejected
            ),
            Outcome::NotApplicable(why) => println!("{trial:5} | skipped: {why}"),
        }
    }
    println!();

    // =========================================================================
    // Demo 2: optimized locations
    // =========================================================================
    println!("--- Optimized locations (J = 2, half of the data for tuning) ---\n");
    let cfg = OptimizedLocationsConfig { j: 2, ..Default::default() };
    if let Outcome::Applicable(res) = sc_ume_optimized_locations(&p, &q, &r, 600, 0, &cfg)? {
        println!(
            "statistic {:.3}, p-value {:.4}, reject H0: {} ({:.3}s)",
            res.test.statistic, res.test.p_value, res.test.h0_rejected, res.time_secs
        );
    }
    println!();

    // =========================================================================
    // Demo 3: latent-space locations
    // =========================================================================
    println!("--- Latent-space locations ---\n");
    let ctx = GeneratorContext::default();
    let gen_p = MlpGenerator::random(2, 16, 4, 1)?;
    let gen_q = MlpGenerator::random(2, 16, 4, 2)?;
    let gen_r = MlpGenerator::random(2, 16, 4, 3)?;
    let xs = GeneratorSource::new(&gen_p, ctx).sample(400, 10)?;
    let ys = GeneratorSource::new(&gen_q, ctx).sample(400, 11)?;
    let zs = GeneratorSource::new(&gen_r, ctx).sample(400, 12)?;

    let zp0 = array![[0.0, 0.0]];
    let zq0 = array![[0.0, 0.0]];
    let opt = optimize_latent_locations(
        &xs,
        &ys,
        &zs,
        &gen_p,
        &gen_q,
        zp0.view(),
        zq0.view(),
        0.5,
        &OptimizerOptions::default(),
        &ctx,
    )?;
    println!("criterion:   {:.4}", opt.report.objective);
    println!("bandwidth:   {:.4}", opt.gwidth);
    println!("iterations:  {} ({})", opt.report.n_iter, opt.report.message);
    println!("z_p = {:.3}, z_q = {:.3}", opt.zp.row(0), opt.zq.row(0));
    println!("generated location from P: {:.3}", gen_p.generate(opt.zp.view(), &ctx)?.row(0));

    Ok(())
}
