// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Optimizer, learning-rate milestones and the per-task decay policy.

use std::collections::{BTreeSet, HashMap};

use crate::model::{FeatureModel, ParamSlot};

// ─── Optimizer ─────────────────────────────────────────

pub trait Optimizer {
    /// Apply one update from the gradients currently held by `model`.
    fn step<M: FeatureModel>(&mut self, model: &mut M);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}

/// Stochastic gradient descent with momentum and L2 weight decay.
///
/// Update per parameter `p` with gradient `g`:
/// ```text
/// g' = g + wd·p
/// v  = μ·v + g'        (v = g' on the first step)
/// p  = p − lr·v
/// ```
#[derive(Debug, Clone)]
pub struct Sgd {
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    velocity: HashMap<usize, Vec<f32>>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocity: HashMap::new(),
        }
    }

    fn update(&mut self, slot: ParamSlot<'_>) {
        let (lr, mu, wd) = (self.lr, self.momentum, self.weight_decay);
        let first = !self.velocity.contains_key(&slot.id);
        let v = self
            .velocity
            .entry(slot.id)
            .or_insert_with(|| vec![0.0; slot.values.len()]);
        if v.len() != slot.values.len() {
            *v = vec![0.0; slot.values.len()];
        }
        for ((p, &g), vi) in slot.values.iter_mut().zip(slot.grads).zip(v.iter_mut()) {
            let d = g + wd * *p;
            *vi = if first || mu == 0.0 { d } else { mu * *vi + d };
            *p -= lr * *vi;
        }
    }
}

impl Optimizer for Sgd {
    fn step<M: FeatureModel>(&mut self, model: &mut M) {
        model.visit_parameters(&mut |slot| self.update(slot));
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

// ─── Step Schedule ─────────────────────────────────────

/// Multiplies the learning rate by `factor` when an epoch in `milestones` begins.
#[derive(Debug, Clone)]
pub struct StepSchedule {
    milestones: BTreeSet<usize>,
    factor: f32,
}

impl StepSchedule {
    pub fn new(milestones: impl IntoIterator<Item = usize>, factor: f32) -> Self {
        Self {
            milestones: milestones.into_iter().collect(),
            factor,
        }
    }

    /// Milestones at one and two thirds of `epochs` (stabilization pass).
    pub fn thirds(epochs: usize, factor: f32) -> Self {
        Self::new([epochs / 3, 2 * epochs / 3], factor)
    }

    pub fn milestones(&self) -> Vec<usize> {
        self.milestones.iter().copied().collect()
    }

    /// Call at the start of every epoch.
    pub fn on_epoch_start<O: Optimizer>(&self, epoch: usize, optimizer: &mut O) {
        if self.milestones.contains(&epoch) {
            optimizer.set_learning_rate(optimizer.learning_rate() * self.factor);
        }
    }
}

// ─── Decay Policy ──────────────────────────────────────

/// `num` evenly spaced values from `start` to `stop` inclusive.
///
/// Element `i < num − 1` is `start + i·(stop − start)/(num − 1)`; the last element
/// is exactly `stop`.
pub fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            let mut out: Vec<f64> = (0..num).map(|i| start + i as f64 * step).collect();
            out[num - 1] = stop;
            out
        }
    }
}

/// Number of interpolation points in the weight-decay schedule.
pub const DECAY_POLICY_POINTS: usize = 10;

/// Weight decay and distillation weight for a task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskHyperparameters {
    pub weight_decay: f64,
    pub lambda: f64,
    /// Increment index: `n_classes / class_increment − 1`.
    pub step: usize,
}

/// Shrink weight decay linearly from `wd` to `wd/10` over the first ten
/// increments (then hold), and grow lambda by 0.1 per increment.
pub fn decay_policy(
    n_classes: usize,
    class_increment: usize,
    weight_decay: f64,
    lambda: f64,
) -> TaskHyperparameters {
    let step = (n_classes / class_increment.max(1)).saturating_sub(1);
    let schedule = linspace(weight_decay, weight_decay / 10.0, DECAY_POLICY_POINTS);
    let idx = step.min(DECAY_POLICY_POINTS - 1);
    TaskHyperparameters {
        weight_decay: schedule[idx],
        lambda: lambda + 0.1 * (step as f64 - 1.0),
        step,
    }
}
