use dsgers::metropolis::Sampler;
use dsgers::posterior::FnPosterior;
use dsgers::MhOptions;
use nalgebra::{DMatrix, DVector};

/// Allowance for Monte Carlo noise around the configured acceptance band.
const BAND_SLACK: f64 = 0.05;

fn normal_target(mean: f64, sd: f64) -> impl Fn(&DVector<f64>) -> dsgers::Result<f64> + Sync {
    move |theta: &DVector<f64>| {
        let z = (theta[0] - mean) / sd;
        Ok(-0.5 * z * z)
    }
}

#[test]
fn sampler_recovers_gaussian_moments() {
    let target = FnPosterior::new(1, normal_target(1.5, 0.5));
    let options = MhOptions::default()
        .with_blocks(20, 2_000)
        .with_burn_in(2_000)
        .with_seed(2024);
    let sampler =
        Sampler::new(&target, &DMatrix::from_element(1, 1, 0.25), options.clone()).unwrap();

    let blocks = sampler
        .run_chain(&DVector::from_element(1, 0.0))
        .unwrap()
        .collect::<dsgers::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(blocks.len(), 20);
    assert!(blocks.iter().all(|block| block.complete));

    let draws: Vec<f64> = blocks
        .iter()
        .flat_map(|block| block.draws.iter().map(|draw| draw[0]))
        .collect();
    assert_eq!(draws.len(), 40_000);
    let n = draws.len() as f64;
    let mean = draws.iter().sum::<f64>() / n;
    let variance = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    assert!((mean - 1.5).abs() < 0.05, "mean {mean}");
    assert!((variance - 0.25).abs() < 0.03, "variance {variance}");

    let accepted: usize = blocks.iter().map(|block| block.accepted).sum();
    let proposed: usize = blocks.iter().map(|block| block.proposed).sum();
    let rate = accepted as f64 / proposed as f64;
    let (low, high) = options.target_acceptance;
    assert!(
        (low - BAND_SLACK..=high + BAND_SLACK).contains(&rate),
        "acceptance {rate} outside ({low}, {high})"
    );
}

#[test]
fn burn_in_tuning_rescues_an_oversized_scale() {
    let target = FnPosterior::new(1, normal_target(1.5, 0.5));
    let covariance = DMatrix::from_element(1, 1, 0.25);
    let start = DVector::from_element(1, 1.5);
    let options = MhOptions::default()
        .with_blocks(1, 5_000)
        .with_burn_in(3_000)
        .with_scale(10.0)
        .with_seed(11);
    let (low, high) = options.target_acceptance;

    let frozen = Sampler::new(&target, &covariance, options.clone().with_tuning(false)).unwrap();
    let state = frozen.burn_in(frozen.initial_state(&start).unwrap()).unwrap().unwrap();
    assert_eq!(state.scale, 10.0);
    let (block, _) = frozen.run_block(&state, 0).unwrap();
    assert!(block.acceptance_rate() < low, "untuned acceptance {}", block.acceptance_rate());

    let tuned = Sampler::new(&target, &covariance, options).unwrap();
    let state = tuned.burn_in(tuned.initial_state(&start).unwrap()).unwrap().unwrap();
    assert!(state.scale < 10.0, "scale {}", state.scale);
    assert_eq!(state.proposed, 0);
    let (block, _) = tuned.run_block(&state, 0).unwrap();
    let rate = block.acceptance_rate();
    assert!(
        (low - BAND_SLACK..=high + BAND_SLACK).contains(&rate),
        "tuned acceptance {rate} outside ({low}, {high})"
    );
}

#[test]
fn infeasible_region_is_never_visited() {
    let target = FnPosterior::new(1, |theta: &DVector<f64>| {
        if theta[0] <= 0.0 {
            Ok(f64::NEG_INFINITY)
        } else {
            Ok(-0.5 * (theta[0] - 0.2).powi(2))
        }
    });
    let options = MhOptions::default().with_blocks(5, 500).with_burn_in(500);
    let sampler = Sampler::new(&target, &DMatrix::identity(1, 1), options).unwrap();

    for block in sampler.run_chain(&DVector::from_element(1, 1.0)).unwrap() {
        let block = block.unwrap();
        assert!(block.draws.iter().all(|draw| draw[0] > 0.0));
        assert!(block.log_posteriors.iter().all(|value| value.is_finite()));
    }
}

#[test]
fn parallel_chains_are_independent_and_complete() {
    let target = FnPosterior::new(2, |theta: &DVector<f64>| Ok(-0.5 * theta.norm_squared()));
    let options = MhOptions::default().with_blocks(3, 200).with_burn_in(100);
    let sampler = Sampler::new(&target, &DMatrix::identity(2, 2), options).unwrap();

    let starts = vec![DVector::from_element(2, -1.0), DVector::from_element(2, 1.0)];
    let chains = sampler.run_chains(&starts).unwrap();
    assert_eq!(chains.len(), 2);
    for chain in &chains {
        assert_eq!(chain.len(), 3);
        assert!(chain.iter().all(|block| block.draws.len() == 200));
    }
    assert_ne!(chains[0][2].draws, chains[1][2].draws);

    let again = sampler.run_chains(&starts).unwrap();
    assert_eq!(chains[1][2].draws, again[1][2].draws);
}
