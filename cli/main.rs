use gtwnet::baselines::{self, BaselineKind, DEFAULT_PRIOR_RIDGE};
use gtwnet::data::{ColumnSpec, load_table};
use gtwnet::graph::GraphOptions;
use gtwnet::inference::{CrossOptions, NewRows, OosStrategy, ReferencePanel, predict_new_rows};
use gtwnet::kernel::PriorConfig;
use gtwnet::model::{ModelConfig, TrainedModel};
use gtwnet::network::{NetworkConfig, WeightNet};
use gtwnet::panel::{Panel, PanelSplit};
use gtwnet::train::{RowSplits, TrainConfig, TrainingProblem, train_model};
use gtwnet::wls::{DEFAULT_HUBER_DELTA, DEFAULT_HUBER_ITERS, WlsConfig, WlsKind};

use clap::{Args, Parser, Subcommand};
use ndarray::{Array1, ArrayView1};
use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::process;

#[derive(Parser)]
#[command(
    name = "gtwnet",
    about = "Geographically and temporally weighted regression with learned weights",
    long_about = "Trains a small network that turns a geometric spatio-temporal prior into \
                 learned local weights, fits one weighted regression per observation, and \
                 predicts unseen locations or periods."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the panel columns live.
#[derive(Args, Clone)]
struct ColumnArgs {
    #[arg(long, default_value = "lat")]
    lat: String,
    #[arg(long, default_value = "lon")]
    lon: String,
    #[arg(long, default_value = "year")]
    time: String,
    #[arg(long, default_value = "y")]
    target: String,
    /// Comma-separated feature columns (include an explicit intercept column if wanted)
    #[arg(long, value_delimiter = ',', required = true)]
    features: Vec<String>,
    /// Field delimiter of the input tables
    #[arg(long, default_value_t = ',')]
    delimiter: char,
}

impl ColumnArgs {
    fn spec(&self) -> ColumnSpec {
        ColumnSpec {
            lat: self.lat.clone(),
            lon: self.lon.clone(),
            time: self.time.clone(),
            target: self.target.clone(),
            features: self.features.clone(),
        }
    }
}

/// Geometric prior settings.
#[derive(Args, Clone)]
struct PriorArgs {
    #[arg(long, default_value_t = 1.0)]
    tau_s: f64,
    #[arg(long, default_value_t = 1.0)]
    tau_t: f64,
    /// Off-diagonal neighbours kept per row of the prior
    #[arg(long, default_value_t = 8)]
    knn_k: usize,
    #[arg(long, default_value_t = 1.0)]
    prior_self_weight: f64,
}

impl PriorArgs {
    fn config(&self) -> PriorConfig {
        PriorConfig {
            tau_s: self.tau_s,
            tau_t: self.tau_t,
            k_neighbors: self.knn_k,
            self_weight: self.prior_self_weight,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Train the weight network on a panel table
    #[command(about = "Train a model (outputs: model.toml)")]
    Train {
        /// Path to the training table
        data: String,
        #[command(flatten)]
        columns: ColumnArgs,
        #[command(flatten)]
        prior: PriorArgs,
        #[arg(long, default_value_t = 200)]
        epochs: usize,
        #[arg(long, default_value_t = 1e-3)]
        lr: f64,
        #[arg(long, default_value_t = 32)]
        hidden_dim: usize,
        #[arg(long, default_value_t = 16)]
        embedding_dim: usize,
        #[arg(long, default_value_t = 1.2)]
        initial_temperature: f64,
        #[arg(long, default_value_t = 0.30)]
        initial_alpha: f64,
        #[arg(long, default_value_t = 5e-3)]
        entropy_weight: f64,
        #[arg(long, default_value_t = 1e-3)]
        smooth_weight: f64,
        #[arg(long, default_value_t = 80)]
        patience: usize,
        #[arg(long)]
        no_early_stopping: bool,
        /// Train on every period but the last instead of holding one out for validation
        #[arg(long)]
        no_validation: bool,
        /// Local solver: ridge or huber
        #[arg(long, default_value = "ridge")]
        wls: String,
        #[arg(long, default_value_t = 5.0)]
        ridge_lambda: f64,
        #[arg(long, default_value_t = DEFAULT_HUBER_DELTA)]
        huber_delta: f64,
        #[arg(long, default_value_t = DEFAULT_HUBER_ITERS)]
        huber_iters: usize,
        /// Keep only the k largest learned weights per row
        #[arg(long)]
        graph_topk: Option<usize>,
        #[arg(long)]
        graph_symmetrize: bool,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value = "model.toml")]
        output: String,
        /// Also write the fitted values and local coefficients of every panel row
        #[arg(long)]
        fitted_output: Option<String>,
    },

    /// Predict new rows with a trained model
    #[command(about = "Predict new rows (outputs: predictions.tsv)")]
    Predict {
        /// Table of rows to predict (target column not required)
        data: String,
        #[arg(long, default_value = "model.toml")]
        model: String,
        /// The table the model was trained on
        #[arg(long)]
        reference: String,
        /// full-graph, transductive or prior-only
        #[arg(long, default_value = "transductive")]
        mode: String,
        #[arg(long, default_value_t = 0.8)]
        lambda_blend: f64,
        #[arg(long)]
        cross_topk: Option<usize>,
        #[arg(long, default_value_t = 0.0)]
        new_self_weight: f64,
        #[arg(long, default_value_t = ',')]
        delimiter: char,
        #[arg(long, default_value = "predictions.tsv")]
        output: String,
    },

    /// Score global baselines and the fixed-prior GTWR on the same split
    Baseline {
        data: String,
        #[command(flatten)]
        columns: ColumnArgs,
        #[command(flatten)]
        prior: PriorArgs,
        /// ols, ridge, huber, lasso or all
        #[arg(long, default_value = "all")]
        kind: String,
        #[arg(long, default_value_t = DEFAULT_PRIOR_RIDGE)]
        prior_ridge: f64,
        #[arg(long)]
        no_validation: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train {
            data,
            columns,
            prior,
            epochs,
            lr,
            hidden_dim,
            embedding_dim,
            initial_temperature,
            initial_alpha,
            entropy_weight,
            smooth_weight,
            patience,
            no_early_stopping,
            no_validation,
            wls,
            ridge_lambda,
            huber_delta,
            huber_iters,
            graph_topk,
            graph_symmetrize,
            seed,
            output,
            fitted_output,
        } => parse_wls(&wls, ridge_lambda, huber_delta, huber_iters).and_then(|wls| {
            let network = NetworkConfig {
                hidden_dim,
                embedding_dim,
                initial_temperature,
                initial_alpha,
                seed,
            };
            let train = TrainConfig {
                epochs,
                learning_rate: lr,
                entropy_weight,
                smooth_weight,
                early_stopping: !no_early_stopping,
                patience,
                wls,
                graph: GraphOptions {
                    topk: graph_topk,
                    symmetrize: graph_symmetrize,
                },
                ..TrainConfig::default()
            };
            let config = ModelConfig {
                network,
                prior: prior.config(),
                train,
            };
            train_command(
                &data,
                &columns,
                config,
                !no_validation,
                &output,
                fitted_output.as_deref(),
            )
        }),
        Commands::Predict {
            data,
            model,
            reference,
            mode,
            lambda_blend,
            cross_topk,
            new_self_weight,
            delimiter,
            output,
        } => {
            let options = CrossOptions {
                lambda_blend,
                cross_topk,
                new_self_weight,
            };
            predict_command(&data, &model, &reference, &mode, options, delimiter, &output)
        }
        Commands::Baseline {
            data,
            columns,
            prior,
            kind,
            prior_ridge,
            no_validation,
        } => baseline_command(&data, &columns, &prior.config(), &kind, prior_ridge, !no_validation),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn parse_wls(
    kind: &str,
    ridge_lambda: f64,
    huber_delta: f64,
    huber_iters: usize,
) -> Result<WlsConfig, Box<dyn Error>> {
    let config = match kind.parse::<WlsKind>()? {
        WlsKind::Ridge => WlsConfig::ridge(ridge_lambda),
        WlsKind::Huber { .. } => WlsConfig::huber(ridge_lambda, huber_delta, huber_iters),
    };
    config.validate()?;
    Ok(config)
}

fn delimiter_byte(delimiter: char) -> Result<u8, Box<dyn Error>> {
    u8::try_from(delimiter).map_err(|_| format!("Delimiter '{delimiter}' is not a single-byte character").into())
}

fn load_panel(path: &str, columns: &ColumnSpec, delimiter: char) -> Result<Panel, Box<dyn Error>> {
    let table = load_table(path, columns, delimiter_byte(delimiter)?, true)?;
    let y = table.y.ok_or("Target column was not loaded")?;
    let panel = Panel::balanced(table.x.view(), y.view(), table.coords.view(), table.times.view())?;
    println!(
        "Balanced panel: {} periods × {} locations, {} features",
        panel.period_times.len(),
        panel.rows_per_period,
        panel.num_features()
    );
    Ok(panel)
}

fn rmse_on(fitted: ArrayView1<f64>, y: ArrayView1<f64>, rows: &[usize]) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    let sse: f64 = rows.iter().map(|&i| (fitted[i] - y[i]).powi(2)).sum();
    Some((sse / rows.len() as f64).sqrt())
}

fn format_rmse(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"))
}

fn split_label(split: &PanelSplit, row: usize) -> &'static str {
    if split.test.contains(&row) {
        "test"
    } else if split.validation.contains(&row) {
        "validation"
    } else {
        "train"
    }
}

fn train_command(
    data_path: &str,
    columns: &ColumnArgs,
    config: ModelConfig,
    use_validation: bool,
    output_path: &str,
    fitted_path: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    println!("Loading training data from: {}", data_path);
    let spec = columns.spec();
    let panel = load_panel(data_path, &spec, columns.delimiter)?;
    let split = panel.chronological_split(use_validation)?;
    println!(
        "Split: {} train rows, {} validation rows, {} test rows (test period {})",
        split.train.len(),
        split.validation.len(),
        split.test.len(),
        split.test_time
    );

    let prior = panel.prior_kernel(&config.prior)?;
    let mut net = WeightNet::new(panel.num_features(), &config.network)?;
    let splits = RowSplits {
        train: split.train.clone(),
        validation: split.validation.clone(),
        test: split.test.clone(),
    };
    let problem = TrainingProblem {
        x: panel.x.view(),
        y: panel.y.view(),
        prior: prior.view(),
        splits: &splits,
        layout: Some(panel.layout()),
    };

    println!("Training...");
    let outcome = train_model(&mut net, &problem, &config.train)?;
    let y = panel.y.view();
    println!(
        "Final RMSE | train {} | validation {} | test {} | α {:.3} | τ {:.3}",
        format_rmse(rmse_on(outcome.fitted.view(), y, &split.train)),
        format_rmse(rmse_on(outcome.fitted.view(), y, &split.validation)),
        format_rmse(rmse_on(outcome.fitted.view(), y, &split.test)),
        net.alpha(),
        net.temperature()
    );

    if let Some(path) = fitted_path {
        let mut out = BufWriter::new(File::create(path)?);
        let beta_header: String = spec.features.iter().map(|f| format!("\tbeta_{f}")).collect();
        writeln!(out, "time\tlat\tlon\ty\tfitted\tsplit{beta_header}")?;
        for row in 0..panel.len() {
            let betas: String = outcome.betas.row(row).iter().map(|b| format!("\t{b:.6}")).collect();
            writeln!(
                out,
                "{}\t{}\t{}\t{:.6}\t{:.6}\t{}{}",
                panel.times[row],
                panel.coords[[row, 0]],
                panel.coords[[row, 1]],
                panel.y[row],
                outcome.fitted[row],
                split_label(&split, row),
                betas
            )?;
        }
        out.flush()?;
        println!("Fitted values saved to: {}", path);
    }

    let model = TrainedModel {
        config,
        columns: spec,
        params: net.snapshot(),
        best_score: outcome.best_score,
        history: outcome.history,
    };
    model.save(output_path)?;
    println!("Model saved to: {}", output_path);
    Ok(())
}

fn predict_command(
    data_path: &str,
    model_path: &str,
    reference_path: &str,
    mode: &str,
    options: CrossOptions,
    delimiter: char,
    output_path: &str,
) -> Result<(), Box<dyn Error>> {
    let strategy: OosStrategy = mode.parse()?;
    println!("Loading model from: {}", model_path);
    let model = TrainedModel::load(model_path)?;
    let net = model.weight_net()?;

    println!("Loading reference panel from: {}", reference_path);
    let panel = load_panel(reference_path, &model.columns, delimiter)?;
    println!("Loading rows to predict from: {}", data_path);
    let new_table = load_table(data_path, &model.columns, delimiter_byte(delimiter)?, false)?;

    let reference = ReferencePanel {
        x: panel.x.view(),
        y: panel.y.view(),
        coords: panel.coords.view(),
        times: panel.times.view(),
    };
    let new = NewRows {
        x: new_table.x.view(),
        coords: new_table.coords.view(),
        times: new_table.times.view(),
    };
    println!("Predicting {} rows ({} mode)...", new_table.x.nrows(), strategy);
    let prediction = predict_new_rows(
        strategy,
        &net,
        &reference,
        &new,
        &model.config.inference_config(),
        &options,
    )?;

    save_predictions(&new_table.coords, &new_table.times, &prediction.fitted, output_path)?;
    println!("Predictions saved to: {}", output_path);
    Ok(())
}

fn save_predictions(
    coords: &ndarray::Array2<f64>,
    times: &Array1<f64>,
    predictions: &Array1<f64>,
    output_path: &str,
) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(output_path)?);
    writeln!(file, "time\tlat\tlon\tprediction")?;
    for (row, &pred) in predictions.iter().enumerate() {
        writeln!(
            file,
            "{}\t{}\t{}\t{:.6}",
            times[row],
            coords[[row, 0]],
            coords[[row, 1]],
            pred
        )?;
    }
    file.flush()
}

fn baseline_command(
    data_path: &str,
    columns: &ColumnArgs,
    prior_config: &PriorConfig,
    kind: &str,
    prior_ridge: f64,
    use_validation: bool,
) -> Result<(), Box<dyn Error>> {
    let kinds: Vec<BaselineKind> = if kind.eq_ignore_ascii_case("all") {
        BaselineKind::ALL.to_vec()
    } else {
        vec![kind.parse()?]
    };
    let panel = load_panel(data_path, &columns.spec(), columns.delimiter)?;
    let split = panel.chronological_split(use_validation)?;
    let (x, y) = (panel.x.view(), panel.y.view());

    println!("{:<28} {:>10} {:>12} {:>10}", "model", "train", "validation", "test");
    let report = |name: &str, fitted: &Array1<f64>| {
        println!(
            "{:<28} {:>10} {:>12} {:>10}",
            name,
            format_rmse(rmse_on(fitted.view(), y, &split.train)),
            format_rmse(rmse_on(fitted.view(), y, &split.validation)),
            format_rmse(rmse_on(fitted.view(), y, &split.test))
        );
    };
    for kind in kinds {
        let fitted = baselines::baseline_predictions(kind, x, y, &split.train)?;
        report(&kind.to_string(), &fitted);
    }

    let prior = panel.prior_kernel(prior_config)?;
    let fit = baselines::gtwr_prior_baseline(x, y, prior.view(), prior_ridge)?;
    report(&format!("gtwr-prior(ridge={prior_ridge})"), &fit.fitted);
    Ok(())
}
