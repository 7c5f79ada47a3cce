//! End-to-end tests running programs under each engine through the runtime

use std::rc::Rc;

use ppl_runtime::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// flip ~ Bernoulli(0.5), heads three times as likely after conditioning
fn biased_coin() -> Program {
    program(|store, k, address| {
        let at = address.child("flip");
        sample(
            store,
            cont(move |store, flip| {
                let bias = if flip.as_bool() == Some(true) { 3f64.ln() } else { 0.0 };
                let k = k.clone();
                factor(store, cont(move |s, _| k(s, flip.clone())), address.child("obs"), bias)
            }),
            at,
            Dist::Bernoulli,
            vec![0.5],
        )
    })
}

/// Two dice conditioned on a sum of at least 9, returning the larger face
fn two_dice() -> Program {
    program(|store, k, address| {
        let a_at = address.child("a");
        sample(
            store,
            cont(move |store, a| {
                let k = k.clone();
                let obs = address.child("obs");
                sample(
                    store,
                    cont(move |store, b| {
                        let (a, b) = (a.as_int().unwrap_or(0), b.as_int().unwrap_or(0));
                        let score = if a + b + 2 >= 9 { 0.0 } else { f64::NEG_INFINITY };
                        let k = k.clone();
                        factor(store, cont(move |s, _| k(s, Value::Int(a.max(b) + 1))), obs.clone(), score)
                    }),
                    address.child("b"),
                    Dist::RandomInteger,
                    vec![6.0],
                )
            }),
            a_at,
            Dist::RandomInteger,
            vec![6.0],
        )
    })
}

fn observe_all(store: Store, k: Cont, address: Address, theta: f64, data: Rc<Vec<bool>>, i: usize, ret: Value) -> Step {
    if i == data.len() {
        return k(store, ret);
    }
    let at = address.child(i);
    let seen = Value::Bool(data[i]);
    let next = cont(move |store, _| {
        observe_all(store, k.clone(), address.clone(), theta, data.clone(), i + 1, ret.clone())
    });
    observe(store, next, at, Dist::Bernoulli, vec![theta], &seen)
}

/// theta ~ Beta(1, 1) with Bernoulli observations; returns `theta > 0.5`
fn beta_bernoulli(data: Vec<bool>) -> Program {
    let data = Rc::new(data);
    program(move |store, k, address| {
        let data = data.clone();
        let at = address.child("theta");
        sample(
            store,
            cont(move |store, theta| {
                let t = theta.as_real().unwrap_or(0.5);
                observe_all(store, k.clone(), address.child("obs"), t, data.clone(), 0, Value::Bool(t > 0.5))
            }),
            at,
            Dist::Beta,
            vec![1.0, 1.0],
        )
    })
}

fn p_true(value: &Value) -> f64 {
    value.as_dist().expect("engine returns a marginal").probability(&Value::Bool(true))
}

#[test]
fn test_enumerate_biased_coin_is_exact() {
    init_tracing();
    let mut rt = Runtime::seeded(0);
    let posterior = rt.infer(&Algorithm::enumerate(), &biased_coin()).unwrap();
    assert!((p_true(&posterior) - 0.75).abs() < 1e-12);
    assert_eq!(rt.depth(), 0);
    assert_eq!(rt.diagnostics()[0].algorithm, "Enumerate");
}

#[test]
fn test_enumeration_strategies_agree() {
    let mut rt = Runtime::seeded(0);
    let strategies = [
        SearchStrategy::LikelyFirst,
        SearchStrategy::BreadthFirst,
        SearchStrategy::DepthFirst,
    ];
    let results: Vec<_> = strategies
        .iter()
        .map(|&strategy| {
            let algorithm = Algorithm::Enumerate {
                max_executions: None,
                strategy,
            };
            rt.infer(&algorithm, &two_dice()).unwrap()
        })
        .collect();
    // (3,6) (6,3) (4,5) (5,4) (4,6) (6,4) (5,5) (5,6) (6,5) (6,6): max 6 in 7 of 10
    for result in &results {
        let m = result.as_dist().unwrap();
        assert!((m.probability(&Value::Int(6)) - 0.7).abs() < 1e-12);
        assert!((m.probability(&Value::Int(5)) - 0.3).abs() < 1e-12);
    }
}

#[test]
fn test_mh_beta_bernoulli() {
    init_tracing();
    // Posterior Beta(4, 2): P(theta > 0.5) = 1 - 6/32
    let mut rt = Runtime::seeded(2024);
    let data = vec![true, true, true, false];
    let posterior = rt.infer(&Algorithm::mh(10_000), &beta_bernoulli(data)).unwrap();
    let p = p_true(&posterior);
    assert!((p - 0.8125).abs() < 0.05, "P(theta > 0.5) = {}", p);
    let stats = &rt.diagnostics()[0];
    assert_eq!(stats.proposals, 9_999);
    assert!(stats.acceptance_rate().unwrap() > 0.0);
}

#[test]
fn test_particle_methods_approximate_posterior() {
    let algorithms = [
        Algorithm::particle_filter(2000),
        Algorithm::pmcmc(200, 10),
        Algorithm::particle_filter_rejuv(500, 2),
    ];
    for algorithm in &algorithms {
        let mut rt = Runtime::seeded(99);
        let posterior = rt.infer(algorithm, &biased_coin()).unwrap();
        let p = p_true(&posterior);
        assert!((p - 0.75).abs() < 0.06, "{}: P(true) = {}", algorithm.name(), p);
        assert_eq!(rt.diagnostics()[0].algorithm, algorithm.name());
        assert_eq!(rt.depth(), 0);
    }
}

#[test]
fn test_single_sweep_pmcmc_is_particle_filter() {
    for seed in 0..4 {
        let mut a = Runtime::seeded(seed);
        let mut b = Runtime::seeded(seed);
        let data = vec![true, false, true];
        let pf = a.infer(&Algorithm::particle_filter(64), &beta_bernoulli(data.clone())).unwrap();
        let pm = b.infer(&Algorithm::pmcmc(64, 1), &beta_bernoulli(data)).unwrap();
        assert_eq!(pf, pm);
    }
}

#[test]
fn test_unrejuvenated_filter_is_particle_filter() {
    for seed in 0..4 {
        let mut a = Runtime::seeded(seed);
        let mut b = Runtime::seeded(seed);
        let pf = a.infer(&Algorithm::particle_filter(64), &two_dice()).unwrap();
        let pfr = b.infer(&Algorithm::particle_filter_rejuv(64, 0), &two_dice()).unwrap();
        assert_eq!(pf, pfr);
    }
}

#[test]
fn test_run_without_inference() {
    let mut rt = Runtime::seeded(5);
    let p = program(|store, k, _| k(store.with("seen", true), Value::Int(3)));
    let (store, value) = rt.run_with_store(&p, Store::new()).unwrap();
    assert_eq!(value, Value::Int(3));
    assert_eq!(store.get("seen"), Some(&Value::Bool(true)));
}

#[test]
fn test_factor_outside_inference_is_an_error() {
    let mut rt = Runtime::seeded(5);
    let err = rt.run(&biased_coin()).unwrap_err();
    assert!(matches!(err, InferenceError::FactorOutsideInference { .. }));
    assert_eq!(rt.depth(), 0);
}

/// Enumerates the biased coin, then draws once from the resulting marginal
fn nested_coin() -> Program {
    let inner = biased_coin();
    program(move |store, k, address| {
        let at = address.child("draw");
        let draw = cont(move |store, posterior| match posterior.as_dist() {
            Some(m) => sample(store, k.clone(), at.clone(), Dist::Marginal(m.clone()), vec![]),
            None => k(store, Value::Unit),
        });
        enumerate(store, draw, address.child("inner"), inner.clone(), None, SearchStrategy::default())
    })
}

#[test]
fn test_enumeration_nested_inside_mh() {
    init_tracing();
    let mut rt = Runtime::seeded(8);
    let posterior = rt.infer(&Algorithm::mh(2000), &nested_coin()).unwrap();
    let p = p_true(&posterior);
    assert!((p - 0.75).abs() < 0.05, "P(true) = {}", p);
    assert_eq!(rt.depth(), 0);
    let names: Vec<_> = rt.diagnostics().iter().map(|s| s.algorithm.as_str()).collect();
    assert_eq!(names.first(), Some(&"Enumerate"));
    assert_eq!(names.last(), Some(&"MH"));
}

#[test]
fn test_marginal_sampled_without_inference() {
    let mut rt = Runtime::seeded(12);
    let draws: Vec<_> = (0..200).map(|_| rt.run(&nested_coin()).unwrap()).collect();
    let heads = draws.iter().filter(|v| v.as_bool() == Some(true)).count();
    assert!(heads > 110 && heads < 190, "heads = {}", heads);
    assert_eq!(rt.depth(), 0);
}

#[test]
fn test_depth_restored_after_failure() {
    let gaussian = program(|store, k, address| {
        sample(store, k, address.child("x"), Dist::Gaussian, vec![0.0, 1.0])
    });
    let mut rt = Runtime::seeded(3);
    let err = rt.infer(&Algorithm::enumerate(), &gaussian).unwrap_err();
    assert!(matches!(err, InferenceError::MissingSupport { algorithm: "Enumerate", .. }));
    assert_eq!(rt.depth(), 0);

    // The runtime stays usable
    let posterior = rt.infer(&Algorithm::enumerate(), &biased_coin()).unwrap();
    assert!((p_true(&posterior) - 0.75).abs() < 1e-12);
}

#[test]
fn test_invalid_algorithm_rejected_before_running() {
    let mut rt = Runtime::seeded(3);
    let err = rt.infer(&Algorithm::pmcmc(10, 0), &biased_coin()).unwrap_err();
    assert!(matches!(err, InferenceError::Configuration(_)));
    assert!(rt.diagnostics().is_empty());
}

#[test]
fn test_configuration_from_json() {
    let config = RuntimeConfig::from_json(r#"{"seed": 31, "variational_steps": 25}"#).unwrap();
    let algorithm = Algorithm::from_json(r#"{"algorithm": "particle_filter", "particles": 100}"#).unwrap();

    let mut a = Runtime::new(config);
    let mut b = Runtime::seeded(31);
    assert_eq!(
        a.infer(&algorithm, &biased_coin()).unwrap(),
        b.infer(&algorithm, &biased_coin()).unwrap()
    );

    let vi = Algorithm::from_json(r#"{"algorithm": "variational", "estimate_samples": 4}"#).unwrap();
    let params = a.infer(&vi, &biased_coin()).unwrap();
    assert_eq!(params.as_list().map(|l| l.len()), Some(1));
    let stats = a.diagnostics().last().unwrap();
    assert_eq!(stats.executions, 25 * 4);
    assert_eq!(stats.variational_params[0].0, "/flip");
}

#[test]
fn test_diagnostics_serialize() {
    let mut rt = Runtime::seeded(1);
    rt.infer(&Algorithm::particle_filter(10), &biased_coin()).unwrap();
    let json = serde_json::to_string(&rt.take_diagnostics()).unwrap();
    assert!(json.contains("\"algorithm\":\"ParticleFilter\""));
    assert!(rt.diagnostics().is_empty());
}
