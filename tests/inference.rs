use std::sync::atomic::{AtomicBool, Ordering};

use binmix::{
    bin_probabilities, estimate_tail, parameter_summary, posterior_predictive,
    predictive_summary, run, run_with_control, simulate_counts, BinnedData, BoundaryPolicy,
    ChainProgress, InferenceConfig, MixtureModel, PredictiveConfig, RunControl,
    DEFAULT_QUANTILES,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const SCENARIO_CUTPOINTS: [f64; 6] = [300., 350., 400., 450., 500., 1200.];
const SCENARIO_COUNTS: [i64; 5] = [8452, 22069, 53684, 14439, 12429 + 22435 + 28];

fn true_model() -> MixtureModel {
    MixtureModel::from_parts(&[350., 600.], &[40., 70.], &[0.35, 0.65]).unwrap()
}

fn cutpoints() -> Vec<f64> {
    (0..=28).map(|i| 150. + 25. * i as f64).collect()
}

fn true_probabilities(model: &MixtureModel) -> Vec<f64> {
    let cutpoints = cutpoints();
    let template =
        BinnedData::from_raw(&cutpoints, &vec![1; cutpoints.len() - 1], BoundaryPolicy::Open)
            .unwrap();
    bin_probabilities(model, &template).unwrap()
}

/// Counts equal to the expected counts of `model`, rounded.
fn expected_counts(model: &MixtureModel, total: f64) -> BinnedData {
    let counts: Vec<i64> = true_probabilities(model)
        .iter()
        .map(|p| (p * total).round() as i64)
        .collect();
    BinnedData::from_raw(&cutpoints(), &counts, BoundaryPolicy::Open).unwrap()
}

/// Multinomial counts drawn from `model`.
fn sampled_counts(model: &MixtureModel, total: u64, seed: u64) -> BinnedData {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let counts: Vec<i64> = simulate_counts(&true_probabilities(model), total, &mut rng)
        .into_iter()
        .map(|c| c as i64)
        .collect();
    BinnedData::from_raw(&cutpoints(), &counts, BoundaryPolicy::Open).unwrap()
}

fn quick_config(k: usize, chains: usize, seed: u64) -> InferenceConfig {
    let mut config = InferenceConfig::default();
    config.num_components = k;
    config.num_chains = chains;
    config.seed = seed;
    config.sampler.num_tune = 500;
    config.sampler.num_draws = 500;
    config
}

#[test]
fn scenario_count_above_threshold() {
    let data =
        BinnedData::from_raw(&SCENARIO_CUTPOINTS, &SCENARIO_COUNTS, BoundaryPolicy::Open).unwrap();
    let total = data.total() as f64;
    let config = quick_config(3, 4, 42);
    let result = run(data, &config).unwrap();
    assert_eq!(result.num_samples(), 4 * 500);

    let tail = estimate_tail(&result, 507.5, &DEFAULT_QUANTILES);
    let median = tail.count.median().unwrap();
    let lower = tail.count.quantile(0.025).unwrap();
    let upper = tail.count.quantile(0.975).unwrap();
    assert!(median > 0. && median < total, "median {}", median);
    assert!(lower < median && median < upper, "{} {} {}", lower, median, upper);
    // The last bin starts at 500 and holds about a quarter of the scores.
    assert!(median < 34_892., "median {}", median);
}

#[test]
fn recovers_known_mixture() {
    let truth = true_model();
    let true_values: Vec<f64> = truth
        .means()
        .chain(truth.spreads())
        .chain(truth.weights())
        .collect();
    let trials = 12;

    let mut covered = 0;
    let mut checked = 0;
    let mut misses = Vec::new();
    for trial in 0..trials {
        let data = sampled_counts(&truth, 50_000, trial);
        let mut config = quick_config(2, 2, 1000 + trial);
        config.sampler.num_tune = 400;
        config.sampler.num_draws = 300;
        let result = run(data, &config).unwrap();

        let summaries = parameter_summary(&result, &DEFAULT_QUANTILES);
        assert_eq!(summaries.len(), true_values.len());
        for (s, &value) in summaries.iter().zip(&true_values) {
            let lower = s.summary.quantile(0.025).unwrap();
            let upper = s.summary.quantile(0.975).unwrap();
            checked += 1;
            if (lower..=upper).contains(&value) {
                covered += 1;
            } else {
                misses.push((trial, s.name.clone(), lower, upper, value));
            }
            let scale = if s.name.starts_with("weight") { 0.05 } else { 10. };
            assert!(
                (s.summary.mean - value).abs() < scale,
                "trial {}, {}: {} vs {}",
                trial,
                s.name,
                s.summary.mean,
                value
            );
        }
    }
    assert!(covered as f64 >= 0.9 * checked as f64, "{:?}", misses);
}

#[test]
fn chains_from_distant_starts_agree() {
    let data = expected_counts(&true_model(), 20_000.);
    let mut config = InferenceConfig::default();
    config.num_components = 2;
    config.num_chains = 2;
    config.seed = 17;
    config.sampler.num_draws = 2000;
    config.thresholds = vec![500.];
    let starts = vec![
        MixtureModel::from_parts(&[180., 250.], &[10., 10.], &[0.9, 0.1]).unwrap(),
        MixtureModel::from_parts(&[750., 820.], &[200., 200.], &[0.1, 0.9]).unwrap(),
    ];
    let control = RunControl {
        initial_models: Some(starts),
        ..Default::default()
    };
    let result = run_with_control(data, &config, control).unwrap();
    let diagnostics = result.diagnostics();
    for param in diagnostics.parameters.iter() {
        assert!(param.rhat <= 1.01, "{:?}", param);
    }
    assert!(diagnostics.max_rhat() <= 1.01);
}

#[test]
fn predictive_counts_match_observed() {
    let data = expected_counts(&true_model(), 20_000.);
    let config = quick_config(2, 2, 5);
    let result = run(data, &config).unwrap();

    let predictive = PredictiveConfig {
        max_samples: Some(400),
        seed: 1,
    };
    let draws = posterior_predictive(&result, &predictive).unwrap();
    assert_eq!(draws.counts.len(), 400);
    for counts in draws.counts.iter() {
        assert_eq!(counts.iter().sum::<u64>(), result.data().total());
    }

    let checks = predictive_summary(&draws, result.data());
    let close = checks
        .iter()
        .filter(|c| c.standardized_residual.abs() <= 3.)
        .count();
    assert!(close as f64 >= 0.8 * checks.len() as f64, "{:?}", checks);

    // Same seed, same draws.
    assert_eq!(posterior_predictive(&result, &predictive).unwrap(), draws);
}

#[test]
fn same_seed_same_result() {
    let data = expected_counts(&true_model(), 5_000.);
    let mut config = quick_config(2, 3, 99);
    config.sampler.num_tune = 100;
    config.sampler.num_draws = 50;
    config.thresholds = vec![450.];

    config.num_threads = Some(1);
    let first = run(data.clone(), &config).unwrap();
    config.num_threads = Some(3);
    let second = run(data.clone(), &config).unwrap();
    assert_eq!(first.chains(), second.chains());

    config.seed = 100;
    let other = run(data, &config).unwrap();
    assert_ne!(first.chains(), other.chains());
}

#[test]
fn cancelled_run_is_incomplete() {
    let data = expected_counts(&true_model(), 5_000.);
    let config = quick_config(2, 2, 8);
    let cancel = AtomicBool::new(false);
    let progress = |p: &ChainProgress| {
        if p.finished_draws >= 30 {
            cancel.store(true, Ordering::Relaxed);
        }
    };
    let control = RunControl {
        cancel: Some(&cancel),
        progress: Some(&progress),
        initial_models: None,
    };
    let result = run_with_control(data, &config, control).unwrap();

    assert!(!result.is_complete());
    for chain in result.chains() {
        assert!(chain.incomplete);
        let recorded = chain.warmup.len() + chain.samples.len();
        assert!(recorded < 1000, "{}", recorded);
    }
    assert!(!result.diagnostics().is_converged());
}

#[test]
fn invalid_input_is_rejected() {
    let data = BinnedData::from_raw(&[0., 1., 2.], &[3, 4], BoundaryPolicy::Open).unwrap();
    let mut config = InferenceConfig::default();
    config.num_components = 0;
    assert!(run(data, &config).is_err());

    assert!(BinnedData::from_raw(&[0., 2., 1.], &[3, 4], BoundaryPolicy::Open).is_err());
    assert!(BinnedData::from_raw(&[0., 1., 2.], &[3, -4], BoundaryPolicy::Open).is_err());
    assert!(BinnedData::from_raw(&[0., 1., 2.], &[0, 0], BoundaryPolicy::Open).is_err());
}
