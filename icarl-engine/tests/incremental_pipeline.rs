// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! End-to-end runs of both modes on a small synthetic class-incremental stream.
//!
//! Each class is a random 4×4 template plus per-sample noise. Tasks introduce
//! ten classes at a time; task `t`'s test set covers every class seen so far.
//!
//! Run with: `cargo test -p icarl-engine --test incremental_pipeline -- --nocapture`

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use icarl_engine::{
    ClassifierKind, DistillWeighting, EvalStage, ExemplarStore, FeatureModel, Image,
    IncrementalConfig, IncrementalLearner, MlpModel, NoAugmentation, PassConfig, ProgressEvent,
    RecordingObserver, Sample, SelectionStrategy,
};

const SIDE: usize = 4;
const INC: usize = 10;

// ═══════════════════════════════════════════════════════════
// Synthetic stream
// ═══════════════════════════════════════════════════════════

struct Stream {
    train: Vec<Vec<Sample>>,
    test: Vec<Vec<Sample>>,
}

fn stream(tasks: usize, train_per_class: usize, test_per_class: usize, seed: u64) -> Stream {
    let mut rng = StdRng::seed_from_u64(seed);
    let templates: Vec<Vec<f32>> = (0..tasks * INC)
        .map(|_| (0..SIDE * SIDE).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();

    let draw = |label: usize, rng: &mut StdRng| {
        let pixels = templates[label]
            .iter()
            .map(|&v| v + rng.gen_range(-0.1..0.1))
            .collect();
        Sample::new(Image::new(1, SIDE, SIDE, pixels), label)
    };

    let mut train = Vec::new();
    let mut test = Vec::new();
    for t in 0..tasks {
        let mut batch = Vec::new();
        for label in t * INC..(t + 1) * INC {
            for _ in 0..train_per_class {
                batch.push(draw(label, &mut rng));
            }
        }
        train.push(batch);

        let mut seen = Vec::new();
        for label in 0..(t + 1) * INC {
            for _ in 0..test_per_class {
                seen.push(draw(label, &mut rng));
            }
        }
        test.push(seen);
    }
    Stream { train, test }
}

fn config(memory: usize) -> IncrementalConfig {
    IncrementalConfig {
        memory,
        class_increment: INC,
        batch_size: 16,
        eval_batch_size: 64,
        update: PassConfig {
            epochs: 2,
            learning_rate: 0.5,
            momentum: 0.9,
            weight_decay: 1e-5,
        },
        stabilize: PassConfig {
            epochs: 3,
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 1e-5,
        },
        ..IncrementalConfig::default()
    }
}

fn model(seed: u64) -> MlpModel {
    let mut rng = StdRng::seed_from_u64(seed);
    MlpModel::new(SIDE * SIDE, 12, INC, &mut rng)
}

fn learner(
    config: IncrementalConfig,
    recorder: &RecordingObserver,
) -> IncrementalLearner<MlpModel> {
    IncrementalLearner::new(config)
        .expect("valid config")
        .with_observer(Box::new(recorder.clone()))
        .with_augmentation(Box::new(NoAugmentation))
}

fn store_sizes(store: &ExemplarStore) -> Vec<usize> {
    store.iter().map(|(_, list)| list.len()).collect()
}

// ═══════════════════════════════════════════════════════════
// Replay mode
// ═══════════════════════════════════════════════════════════

#[test]
fn test_herding_store_holds_budget_after_two_tasks() {
    let data = stream(2, 20, 2, 1);
    let recorder = RecordingObserver::new();
    let mut icarl = learner(config(20), &recorder);

    let report = icarl.run(&data.train, &data.test, model(2)).unwrap();
    println!("accuracy per task: {:?}", report.accuracy_per_task);

    // quota after task 2 = floor(20 / 20) = 1 per class
    assert_eq!(icarl.store().len(), 20);
    assert_eq!(icarl.store().num_classes(), 20);
    assert!(store_sizes(icarl.store()).iter().all(|&n| n == 1));

    assert_eq!(report.accuracy_per_task.len(), 2);
    assert!(report
        .accuracy_per_task
        .iter()
        .all(|a| (0.0..=1.0).contains(a)));
    assert_eq!(report.model.num_classes(), 20);
    assert_eq!(icarl.registry().len(), 1);
}

#[test]
fn test_store_budget_holds_after_every_task() {
    let data = stream(3, 12, 1, 3);
    let recorder = RecordingObserver::new();
    let mut icarl = learner(config(60), &recorder);
    icarl.run(&data.train, &data.test, model(4)).unwrap();

    let reductions: Vec<(usize, usize)> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::ExemplarsReduced { quota, total } => Some((quota, total)),
            _ => None,
        })
        .collect();
    // 60/10, 60/20, 60/30 per class
    assert_eq!(reductions, vec![(6, 60), (3, 60), (2, 60)]);
}

#[test]
fn test_random_selection_and_cosine_run() {
    let data = stream(2, 10, 2, 5);
    let recorder = RecordingObserver::new();
    let cfg = IncrementalConfig {
        selection: SelectionStrategy::Random,
        classifier: ClassifierKind::Cosine,
        ..config(20)
    };
    let mut icarl = learner(cfg, &recorder);
    let report = icarl.run(&data.train, &data.test, model(6)).unwrap();

    assert_eq!(icarl.store().len(), 20);
    let finals: Vec<ClassifierKind> = recorder
        .evaluations()
        .into_iter()
        .filter(|&(task, _, stage)| task == 1 && stage == EvalStage::Final)
        .map(|(_, kind, _)| kind)
        .collect();
    assert_eq!(finals, vec![ClassifierKind::Fc, ClassifierKind::Cosine]);
    assert_eq!(report.accuracy_per_task.len(), 2);
}

#[test]
fn test_fc_classifier_with_decay_policy_and_lambda() {
    let data = stream(3, 8, 1, 7);
    let recorder = RecordingObserver::new();
    let cfg = IncrementalConfig {
        classifier: ClassifierKind::Fc,
        decay_policy: true,
        distill_weighting: DistillWeighting::Lambda,
        ..config(30)
    };
    let mut icarl = learner(cfg, &recorder);
    let report = icarl.run(&data.train, &data.test, model(8)).unwrap();

    assert_eq!(report.accuracy_per_task.len(), 3);
    assert!(recorder
        .evaluations()
        .iter()
        .filter(|(_, _, stage)| *stage == EvalStage::Final)
        .all(|(_, kind, _)| *kind == ClassifierKind::Fc));
    assert!(recorder.events().iter().any(|e| matches!(
        e,
        ProgressEvent::EpochCompleted { loss, .. } if loss.is_finite()
    )));
}

#[test]
fn test_same_seed_same_run() {
    let data = stream(2, 10, 2, 9);
    let a = learner(config(20), &RecordingObserver::new())
        .run(&data.train, &data.test, model(10))
        .unwrap();
    let b = learner(config(20), &RecordingObserver::new())
        .run(&data.train, &data.test, model(10))
        .unwrap();
    assert_eq!(a.accuracy_per_task, b.accuracy_per_task);
    assert_eq!(a.model.w2, b.model.w2);
}

// ═══════════════════════════════════════════════════════════
// No-replay mode
// ═══════════════════════════════════════════════════════════

#[test]
fn test_lwf_never_touches_store_and_only_uses_fc() {
    let data = stream(3, 8, 2, 11);
    let recorder = RecordingObserver::new();
    let mut lwf = learner(config(20), &recorder);

    let report = lwf.run_lwf(&data.train, &data.test, model(12)).unwrap();
    println!("LwF accuracy per task: {:?}", report.accuracy_per_task);

    assert!(lwf.store().is_empty());
    assert_eq!(lwf.registry().len(), 2);
    assert_eq!(report.model.num_classes(), 30);

    let evaluations = recorder.evaluations();
    assert_eq!(evaluations.len(), 3);
    assert!(evaluations
        .iter()
        .all(|&(_, kind, stage)| kind == ClassifierKind::Fc && stage == EvalStage::Final));
    assert!(!recorder.events().iter().any(|e| matches!(
        e,
        ProgressEvent::ExemplarsSelected { .. } | ProgressEvent::ExemplarsReduced { .. }
    )));
}

#[test]
fn test_fine_tune_lwf_still_snapshots() {
    let data = stream(2, 8, 1, 13);
    let recorder = RecordingObserver::new();
    let cfg = IncrementalConfig {
        fine_tune: true,
        ..config(20)
    };
    let mut lwf = learner(cfg, &recorder);
    let report = lwf.run_lwf(&data.train, &data.test, model(14)).unwrap();
    assert_eq!(report.accuracy_per_task.len(), 2);
    assert_eq!(lwf.registry().len(), 1);
}
