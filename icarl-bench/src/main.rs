// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! iCaRL / LwF benchmark over a synthetic class-incremental stream.
//!
//! Usage: `icarl-bench [config.json]`
//!
//! Without a config file a scaled-down configuration is used so the run
//! finishes in seconds. Log verbosity follows `RUST_LOG` (default `info`).

use std::time::Instant;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use icarl_engine::{
    ClassifierKind, Image, IncrementalConfig, IncrementalLearner, MlpModel, PassConfig, Sample,
};

const CHANNELS: usize = 3;
const SIDE: usize = 8;
const TASKS: usize = 5;
const TRAIN_PER_CLASS: usize = 40;
const TEST_PER_CLASS: usize = 10;
const FEATURE_DIM: usize = 32;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => IncrementalConfig::from_json_file(&path)?,
        None => bench_config(),
    };
    tracing::info!(
        config = %serde_json::to_string(&config).context("serializing config")?,
        "iCaRL benchmarks"
    );

    let (train, test) = synthetic_stream(&config);

    let icarl_config = config.clone();
    let t0 = Instant::now();
    let mut icarl = IncrementalLearner::new(icarl_config).context("building iCaRL learner")?;
    let report = icarl
        .run(&train, &test, fresh_model(&config))
        .context("iCaRL run failed")?;
    print_accuracies(
        &format!("iCaRL ({:?})", config.classifier),
        &report.accuracy_per_task,
        t0,
    );
    tracing::info!(exemplars = icarl.store().len(), "iCaRL run complete");

    let lwf_config = IncrementalConfig {
        classifier: ClassifierKind::Fc,
        ..config.clone()
    };
    let t0 = Instant::now();
    let mut lwf = IncrementalLearner::new(lwf_config).context("building LwF learner")?;
    let report = lwf
        .run_lwf(&train, &test, fresh_model(&config))
        .context("LwF run failed")?;
    print_accuracies("LwF (FC)", &report.accuracy_per_task, t0);

    tracing::info!("all benchmarks complete");
    Ok(())
}

fn bench_config() -> IncrementalConfig {
    IncrementalConfig {
        memory: 200,
        batch_size: 32,
        update: PassConfig {
            epochs: 8,
            learning_rate: 0.5,
            momentum: 0.9,
            weight_decay: 1e-5,
        },
        stabilize: PassConfig {
            epochs: 6,
            learning_rate: 0.05,
            momentum: 0.9,
            weight_decay: 1e-5,
        },
        lr_milestones: vec![5, 7],
        ..IncrementalConfig::default()
    }
}

fn fresh_model(config: &IncrementalConfig) -> MlpModel {
    let mut rng = StdRng::seed_from_u64(config.seed ^ 0x5eed);
    MlpModel::new(
        CHANNELS * SIDE * SIDE,
        FEATURE_DIM,
        config.class_increment,
        &mut rng,
    )
}

/// Per-class Gaussian-ish blobs around random templates. Test set `t` covers
/// every class introduced up to task `t`.
fn synthetic_stream(config: &IncrementalConfig) -> (Vec<Vec<Sample>>, Vec<Vec<Sample>>) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let inc = config.class_increment;
    let len = CHANNELS * SIDE * SIDE;
    let templates: Vec<Vec<f32>> = (0..TASKS * inc)
        .map(|_| (0..len).map(|_| rng.gen_range(0.0..1.0)).collect())
        .collect();

    let sample = |label: usize, rng: &mut StdRng| {
        let pixels = templates[label]
            .iter()
            .map(|&v| v + rng.gen_range(-0.25..0.25))
            .collect();
        Sample::new(Image::new(CHANNELS, SIDE, SIDE, pixels), label)
    };

    let mut train = Vec::with_capacity(TASKS);
    let mut test = Vec::with_capacity(TASKS);
    for task in 0..TASKS {
        train.push(
            (task * inc..(task + 1) * inc)
                .flat_map(|label| std::iter::repeat(label).take(TRAIN_PER_CLASS))
                .map(|label| sample(label, &mut rng))
                .collect(),
        );
        test.push(
            (0..(task + 1) * inc)
                .flat_map(|label| std::iter::repeat(label).take(TEST_PER_CLASS))
                .map(|label| sample(label, &mut rng))
                .collect(),
        );
    }
    (train, test)
}

fn print_accuracies(name: &str, accuracies: &[f32], started: Instant) {
    tracing::info!(
        mode = name,
        elapsed_s = started.elapsed().as_secs_f64(),
        "benchmark finished"
    );
    println!("[{name}]");
    for (task, acc) in accuracies.iter().enumerate() {
        println!("  task {:>2}: {:.1}%", task + 1, acc * 100.0);
    }
    if !accuracies.is_empty() {
        let mean = accuracies.iter().sum::<f32>() / accuracies.len() as f32;
        println!("  mean:    {:.1}%", mean * 100.0);
    }
}
