// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

pub mod classifier;
pub mod config;
pub mod data;
pub mod distill;
pub mod error;
pub mod exemplar;
pub mod incremental;
pub mod math;
pub mod model;
pub mod observer;
pub mod optim;
pub mod training;

pub use classifier::{
    accuracy, classify_fc, classify_nme, ClassPrototypes, ConfusionMatrix, Evaluation,
    PrototypeMetric,
};
pub use config::{
    ClassifierKind, Device, DistillWeighting, IncrementalConfig, PassConfig, SelectionStrategy,
};
pub use data::{
    group_by_class, one_hot, Augmentation, BatchLoader, Image, NoAugmentation, PadCropFlip, Sample,
};
pub use distill::{TeacherRegistry, TeacherSnapshot};
pub use error::{IncrementalError, Result};
pub use exemplar::{select_herding, select_random, ExemplarSelector, ExemplarStore};
pub use incremental::{IncrementalLearner, RunReport};
pub use model::{FeatureModel, ForwardOutput, MlpModel, ModelMode};
pub use observer::{
    EvalStage, NullObserver, Pass, ProgressEvent, ProgressObserver, ProgressReporter,
    RecordingObserver, TracingObserver,
};
pub use optim::{decay_policy, linspace, Optimizer, Sgd, StepSchedule};
pub use training::{RepresentationUpdater, TrainingContext};
