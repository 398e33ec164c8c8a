// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Runtime configuration for an incremental learning run.
//!
//! Covers the memory budget, both training passes (representation update and
//! stabilization), exemplar selection, the evaluation classifier and the
//! optional weight-decay / distillation-weight decay policy.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{IncrementalError, Result};

/// Compute device requested by the caller.
///
/// Placement is executed by the `FeatureModel`; the engine only forwards the choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Gpu { device_id: usize },
}

/// How exemplars are picked for newly introduced classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionStrategy {
    /// Greedy class-mean approximation in feature space.
    Herding,
    /// Uniform sample without replacement.
    Random,
}

/// Classifier whose accuracy is recorded for each task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifierKind {
    /// Nearest mean of exemplars (Euclidean distance to unit prototypes).
    Nme,
    /// Prototype classifier scored by dot-product similarity.
    Cosine,
    /// Argmax of the fully-connected head.
    Fc,
}

/// Whether `lambda` scales the distillation term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistillWeighting {
    /// `class_loss + distill_loss`.
    Unit,
    /// `class_loss + lambda * distill_loss`.
    Lambda,
}

/// Hyperparameters of one SGD-driven pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassConfig {
    pub epochs: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f64,
}

/// Full configuration for an incremental run. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalConfig {
    /// Total exemplar budget shared by all classes.
    pub memory: usize,
    pub device: Device,
    /// Classes introduced per task.
    pub class_increment: usize,
    /// Training mini-batch size (partial batches are dropped).
    pub batch_size: usize,
    /// Chunk size for evaluation-mode forward passes.
    pub eval_batch_size: usize,
    /// Representation update pass.
    pub update: PassConfig,
    /// Stabilization pass over the replay memory.
    pub stabilize: PassConfig,
    /// Absolute epochs at which the update pass decays its learning rate.
    pub lr_milestones: Vec<usize>,
    /// Multiplier applied to the learning rate at each milestone.
    pub lr_decay_factor: f32,
    /// Distillation weight (grown by the decay policy).
    pub lambda: f64,
    pub distill_weighting: DistillWeighting,
    pub selection: SelectionStrategy,
    pub classifier: ClassifierKind,
    /// Train every task with the plain classification loss.
    pub fine_tune: bool,
    /// Shrink weight decay and grow lambda as tasks accumulate.
    pub decay_policy: bool,
    /// Emit a confusion matrix event after every task.
    pub confusion_matrix: bool,
    pub seed: u64,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            memory: 2000,
            device: Device::Cpu,
            class_increment: 10,
            batch_size: 128,
            eval_batch_size: 512,
            update: PassConfig {
                epochs: 70,
                learning_rate: 2.0,
                momentum: 0.9,
                weight_decay: 1e-5,
            },
            stabilize: PassConfig {
                epochs: 30,
                learning_rate: 0.2,
                momentum: 0.9,
                weight_decay: 1e-5,
            },
            lr_milestones: vec![48, 62],
            lr_decay_factor: 0.5,
            lambda: 1.0,
            distill_weighting: DistillWeighting::Unit,
            selection: SelectionStrategy::Herding,
            classifier: ClassifierKind::Nme,
            fine_tune: false,
            decay_policy: false,
            confusion_matrix: false,
            seed: 42,
        }
    }
}

impl IncrementalConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(IncrementalError::InvalidConfig(msg.to_string()));
        if self.class_increment == 0 {
            return invalid("class_increment must be positive");
        }
        if self.batch_size == 0 || self.eval_batch_size == 0 {
            return invalid("batch sizes must be positive");
        }
        for (name, pass) in [("update", &self.update), ("stabilize", &self.stabilize)] {
            if !(pass.learning_rate > 0.0) {
                return invalid(&format!("{name}.learning_rate must be positive"));
            }
            if !(0.0..1.0).contains(&pass.momentum) {
                return invalid(&format!("{name}.momentum must lie in [0, 1)"));
            }
            if pass.weight_decay < 0.0 {
                return invalid(&format!("{name}.weight_decay must be non-negative"));
            }
        }
        if !(self.lr_decay_factor > 0.0 && self.lr_decay_factor <= 1.0) {
            return invalid("lr_decay_factor must lie in (0, 1]");
        }
        Ok(())
    }

    /// Per-class quota used when selecting exemplars for the newest classes.
    ///
    /// Divides the budget by the classes known before this task (or by the
    /// increment on the first task); the store is reduced to
    /// [`reduced_quota`](Self::reduced_quota) after evaluation.
    pub fn selection_quota(&self, n_classes: usize) -> usize {
        let previous = n_classes.saturating_sub(self.class_increment);
        self.memory / previous.max(self.class_increment)
    }

    /// Per-class quota after the store is shrunk at the end of a task.
    pub fn reduced_quota(&self, n_classes: usize) -> usize {
        if n_classes == 0 {
            return self.memory;
        }
        self.memory / n_classes
    }
}
