//! Estimate how many test takers scored above 507.5 when only binned score
//! counts were published.
//!
//! Run with `RUST_LOG=binmix=debug` for per-chain details.

use anyhow::Result;
use binmix::{
    estimate_tail, parameter_summary, posterior_predictive, predictive_summary, run, BinnedData,
    BoundaryPolicy, InferenceConfig, PredictiveConfig, DEFAULT_QUANTILES,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("binmix=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let data = BinnedData::from_raw(
        &[300., 350., 400., 450., 500., 1200.],
        &[8452, 22069, 53684, 14439, 12429 + 22435 + 28],
        BoundaryPolicy::Open,
    )?;
    let threshold = 507.5;

    let mut config = InferenceConfig::default();
    config.seed = 2024;
    config.thresholds = vec![threshold];
    let result = run(data, &config)?;

    let diagnostics = result.diagnostics();
    println!(
        "{} samples, max R-hat {:.4}, min bulk ESS {:.0}, {} divergences",
        result.num_samples(),
        diagnostics.max_rhat(),
        diagnostics.min_ess(),
        diagnostics.total_divergences(),
    );
    for warning in diagnostics.warnings.iter() {
        println!("warning: {}", warning);
    }

    for param in parameter_summary(&result, &DEFAULT_QUANTILES) {
        let q = &param.summary.quantiles;
        println!(
            "{:>10}: mean {:9.3}  95% [{:9.3}, {:9.3}]",
            param.name, param.summary.mean, q[0].value, q[2].value
        );
    }

    let tail = estimate_tail(&result, threshold, &DEFAULT_QUANTILES);
    let q = &tail.count.quantiles;
    println!(
        "count above {}: median {:.0}, 95% interval [{:.0}, {:.0}] of {}",
        threshold, q[1].value, q[0].value, q[2].value, tail.population
    );

    let draws = posterior_predictive(&result, &PredictiveConfig::default())?;
    for check in predictive_summary(&draws, result.data()) {
        println!(
            "bin {}: observed {:6}, predicted {:9.1} ± {:6.1}, z {:+.2}",
            check.bin, check.observed, check.mean, check.sd, check.standardized_residual
        );
    }
    Ok(())
}
