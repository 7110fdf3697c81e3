use gtwnet::data::ColumnSpec;
use gtwnet::inference::{
    CrossOptions, InferenceConfig, NewRows, ReferencePanel, predict_oos_transductive,
    predict_prior_only,
};
use gtwnet::kernel::PriorConfig;
use gtwnet::model::{ModelConfig, TrainedModel};
use gtwnet::network::{NetworkConfig, WeightNet};
use gtwnet::panel::Panel;
use gtwnet::train::{RowSplits, TrainConfig, TrainingProblem, finetune_with_future, train_model};
use gtwnet::wls::WlsConfig;
use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// 2 periods × 3 identical locations, y = 3·x1 − 2·x2 without noise.
fn noiseless_panel() -> Panel {
    let mut rng = StdRng::seed_from_u64(11);
    let sites = [[40.0, -3.0], [40.5, -3.5], [41.0, -2.5]];
    let coords = Array2::from_shape_fn((6, 2), |(i, j)| sites[i % 3][j]);
    let times = array![2020.0, 2020.0, 2020.0, 2021.0, 2021.0, 2021.0];
    let x = Array2::from_shape_fn((6, 2), |_| rng.gen_range(0.5..2.0));
    let y = x.dot(&array![3.0, -2.0]);
    Panel::balanced(x.view(), y.view(), coords.view(), times.view()).unwrap()
}

fn small_network() -> NetworkConfig {
    NetworkConfig {
        hidden_dim: 8,
        embedding_dim: 4,
        ..NetworkConfig::default()
    }
}

#[test]
fn noiseless_panel_is_fit_almost_exactly() {
    let panel = noiseless_panel();
    let prior = panel.prior_kernel(&PriorConfig::default()).unwrap();
    let splits = RowSplits {
        train: (0..panel.len()).collect(),
        ..RowSplits::default()
    };
    let problem = TrainingProblem {
        x: panel.x.view(),
        y: panel.y.view(),
        prior: prior.view(),
        splits: &splits,
        layout: Some(panel.layout()),
    };
    let config = TrainConfig {
        epochs: 20,
        wls: WlsConfig::ridge(0.0),
        ..TrainConfig::default()
    };
    let mut net = WeightNet::new(2, &small_network()).unwrap();
    let outcome = train_model(&mut net, &problem, &config).unwrap();

    assert!(!outcome.history.is_empty());
    assert!(outcome.history.iter().all(|r| r.rmse_train < 0.05));
    let residual = (&outcome.fitted - &panel.y).mapv(f64::abs);
    assert!(residual.iter().all(|&r| r < 0.05));
    for row in outcome.betas.rows() {
        assert_abs_diff_eq!(row[0], 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(row[1], -2.0, epsilon = 1e-4);
    }
}

#[test]
fn prior_only_prediction_sits_between_equidistant_neighbours() {
    let x = array![[1.0], [1.0]];
    let y = array![10.0, 20.0];
    let coords = array![[0.0, -1.0], [0.0, 1.0]];
    let times = array![0.0, 0.0];
    let reference = ReferencePanel {
        x: x.view(),
        y: y.view(),
        coords: coords.view(),
        times: times.view(),
    };
    let new_x = array![[1.0]];
    let new_coords = array![[0.0, 0.0]];
    let new_times = array![0.0];
    let new = NewRows {
        x: new_x.view(),
        coords: new_coords.view(),
        times: new_times.view(),
    };
    let config = InferenceConfig {
        wls: WlsConfig::ridge(0.0),
        ..InferenceConfig::default()
    };
    let prediction = predict_prior_only(&reference, &new, &config, &CrossOptions::default()).unwrap();

    assert_abs_diff_eq!(prediction.weights[[2, 0]], 0.5, epsilon = 1e-9);
    assert_abs_diff_eq!(prediction.weights[[2, 1]], 0.5, epsilon = 1e-9);
    assert_abs_diff_eq!(prediction.fitted[0], 15.0, epsilon = 1e-6);
}

/// Four yearly cross sections of a slowly drifting spatial surface.
fn drifting_panel(seed: u64) -> Panel {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.05).unwrap();
    let locations: Vec<[f64; 2]> = (0..5)
        .map(|_| [rng.gen_range(35.0..36.0), rng.gen_range(139.0..140.0)])
        .collect();
    let n = locations.len() * 4;
    let mut coords = Array2::zeros((n, 2));
    let mut times = Array1::zeros(n);
    let mut x = Array2::zeros((n, 2));
    let mut y = Array1::zeros(n);
    for period in 0..4 {
        for (k, loc) in locations.iter().enumerate() {
            let row = period * locations.len() + k;
            coords[[row, 0]] = loc[0];
            coords[[row, 1]] = loc[1];
            times[row] = 2018.0 + period as f64;
            let feature: f64 = rng.gen_range(-1.0..1.0);
            x[[row, 0]] = 1.0;
            x[[row, 1]] = feature;
            let slope = 1.0 + (loc[0] - 35.0) + 0.1 * period as f64;
            y[row] = 2.0 + slope * feature + noise.sample(&mut rng);
        }
    }
    Panel::balanced(x.view(), y.view(), coords.view(), times.view()).unwrap()
}

#[test]
fn training_rmse_history_tracks_the_restored_best() {
    let panel = drifting_panel(5);
    let prior = panel.prior_kernel(&PriorConfig::default()).unwrap();
    let splits = RowSplits {
        train: (0..panel.len()).collect(),
        ..RowSplits::default()
    };
    let problem = TrainingProblem {
        x: panel.x.view(),
        y: panel.y.view(),
        prior: prior.view(),
        splits: &splits,
        layout: Some(panel.layout()),
    };
    let config = TrainConfig {
        epochs: 15,
        learning_rate: 1e-2,
        early_stopping: false,
        wls: WlsConfig::ridge(0.5),
        ..TrainConfig::default()
    };
    let mut net = WeightNet::new(2, &small_network()).unwrap();
    let outcome = train_model(&mut net, &problem, &config).unwrap();
    assert_eq!(outcome.history.len(), 15);

    // The running best train RMSE never increases and ends at the reported score.
    let mut running_best = f64::INFINITY;
    for record in &outcome.history {
        assert!(record.rmse_train.is_finite());
        let next = running_best.min(record.rmse_train);
        assert!(next <= running_best);
        running_best = next;
    }
    assert_abs_diff_eq!(outcome.best_score, running_best, epsilon = 1e-6);
    assert!(outcome.best_score <= outcome.history[0].rmse_train);

    // The returned fit comes from the restored best parameters.
    let n = panel.len() as f64;
    let restored_rmse = ((&outcome.fitted - &panel.y).mapv(|r| r * r).sum() / n).sqrt();
    assert_abs_diff_eq!(restored_rmse, outcome.best_score, epsilon = 1e-9);
}

#[test]
fn trained_model_survives_a_save_load_cycle_and_predicts() {
    let panel = drifting_panel(3);
    let split = panel.chronological_split(true).unwrap();
    let prior_config = PriorConfig::default();
    let prior = panel.prior_kernel(&prior_config).unwrap();
    let splits = RowSplits {
        train: split.train.clone(),
        validation: split.validation.clone(),
        test: split.test.clone(),
    };
    let train_config = TrainConfig {
        epochs: 10,
        learning_rate: 1e-2,
        wls: WlsConfig::ridge(0.5),
        ..TrainConfig::default()
    };
    let network = small_network();
    let mut net = WeightNet::new(2, &network).unwrap();
    let problem = TrainingProblem {
        x: panel.x.view(),
        y: panel.y.view(),
        prior: prior.view(),
        splits: &splits,
        layout: Some(panel.layout()),
    };
    let outcome = train_model(&mut net, &problem, &train_config).unwrap();
    assert!(outcome.history.iter().all(|r| r.rmse_validation.is_some()));
    assert!(outcome.history.iter().all(|r| r.rmse_test.is_some()));

    let model = TrainedModel {
        config: ModelConfig {
            network,
            prior: prior_config,
            train: train_config,
        },
        columns: ColumnSpec {
            lat: "lat".into(),
            lon: "lon".into(),
            time: "year".into(),
            target: "y".into(),
            features: vec!["const".into(), "x".into()],
        },
        params: net.snapshot(),
        best_score: outcome.best_score,
        history: outcome.history.clone(),
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.toml");
    model.save(&path).unwrap();
    let restored = TrainedModel::load(&path).unwrap();
    let restored_net = restored.weight_net().unwrap();
    assert_eq!(restored_net.params(), net.params());

    // Predicting the held-out period from the earlier ones.
    let old: Vec<usize> = split.train.iter().chain(&split.validation).copied().collect();
    let pick = |rows: &[usize]| {
        (
            panel.x.select(ndarray::Axis(0), rows),
            panel.y.select(ndarray::Axis(0), rows),
            panel.coords.select(ndarray::Axis(0), rows),
            panel.times.select(ndarray::Axis(0), rows),
        )
    };
    let (old_x, old_y, old_coords, old_times) = pick(&old);
    let (new_x, _, new_coords, new_times) = pick(&split.test);
    let reference = ReferencePanel {
        x: old_x.view(),
        y: old_y.view(),
        coords: old_coords.view(),
        times: old_times.view(),
    };
    let new = NewRows {
        x: new_x.view(),
        coords: new_coords.view(),
        times: new_times.view(),
    };
    let inference = restored.config.inference_config();
    let options = CrossOptions::default();
    let first = predict_oos_transductive(&restored_net, &reference, &new, &inference, &options).unwrap();
    let second = predict_oos_transductive(&net, &reference, &new, &inference, &options).unwrap();
    assert_eq!(first.fitted, second.fitted);
    assert_eq!(first.fitted.len(), split.test.len());
    assert!(first.fitted.iter().all(|v| v.is_finite()));
}

#[test]
fn finetuning_reports_the_future_period_as_test() {
    let panel = drifting_panel(9);
    let split = panel.chronological_split(true).unwrap();
    let mut net = WeightNet::new(2, &small_network()).unwrap();
    let before = net.snapshot();
    let config = TrainConfig {
        epochs: 5,
        learning_rate: 1e-2,
        ..TrainConfig::finetune()
    };
    let result = finetune_with_future(
        &mut net,
        &panel,
        &PriorConfig::default(),
        &split.train,
        &split.validation,
        &split.test,
        &config,
    )
    .unwrap();
    assert_eq!(result.prior.dim(), (panel.len(), panel.len()));
    assert!(result.outcome.history.iter().all(|r| r.rmse_test.is_some()));
    assert_ne!(net.params(), &before);
}
