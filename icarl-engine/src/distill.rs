// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Teacher snapshots and the loss composition used by the representation update.
//!
//! Every task after the first freezes a copy of the model before its head
//! grows. The distillation target for the classes known before the current
//! task is stitched together column-wise from those copies:
//!
//! ```text
//! teacher 0: columns [0, inc)           (its full head)
//! teacher i: columns [i·inc, i·inc+inc) (only the classes it introduced)
//! ```
//!
//! Loss (sigmoid outputs `o`, one-hot `y`, teacher targets `t`, old width `K`):
//!
//! ```text
//! L = mean((o − y)²) + w · mean((√o[:, :K] − √t)²)
//! ```

use std::ops::Range;

use crate::data::Image;
use crate::error::{IncrementalError, Result};
use crate::math::sigmoid;
use crate::model::{batched_forward, FeatureModel, ForwardOutput, ModelMode};

/// Smallest output value used in the `1/√o` factor of the distillation gradient.
const SQRT_GRAD_FLOOR: f32 = 1e-12;

// ─── Teachers ──────────────────────────────────────────

/// Frozen, evaluation-only copy of a model.
#[derive(Debug, Clone)]
pub struct TeacherSnapshot<M> {
    model: M,
}

impl<M: FeatureModel> TeacherSnapshot<M> {
    pub fn freeze(model: &M) -> Self {
        let mut model = model.clone();
        model.set_mode(ModelMode::Eval);
        model.zero_grad();
        Self { model }
    }

    pub fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    /// Sigmoid-activated scores over the snapshot's whole head.
    pub fn probabilities(&self, images: &[&Image], chunk: usize) -> Vec<Vec<f32>> {
        let mut scores = batched_forward(&self.model, images, ForwardOutput::Scores, chunk);
        for row in &mut scores {
            row.iter_mut().for_each(|v| *v = sigmoid(*v));
        }
        scores
    }
}

/// Append-only list of teacher snapshots, one per task boundary.
#[derive(Debug, Clone)]
pub struct TeacherRegistry<M> {
    snapshots: Vec<TeacherSnapshot<M>>,
    class_increment: usize,
    eval_batch_size: usize,
}

impl<M: FeatureModel> TeacherRegistry<M> {
    pub fn new(class_increment: usize, eval_batch_size: usize) -> Self {
        Self {
            snapshots: Vec::new(),
            class_increment,
            eval_batch_size,
        }
    }

    /// Freeze `model` and append it. Call before the task's head expansion.
    pub fn snapshot(&mut self, model: &M) {
        let snapshot = TeacherSnapshot::freeze(model);
        tracing::debug!(
            teacher = self.snapshots.len(),
            width = snapshot.num_classes(),
            "teacher snapshot taken"
        );
        self.snapshots.push(snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TeacherSnapshot<M>> {
        self.snapshots.get(index)
    }

    /// Columns teacher `index` contributes to the distillation target.
    pub fn target_columns(&self, index: usize) -> Range<usize> {
        let inc = self.class_increment;
        if index == 0 {
            0..inc
        } else {
            index * inc..index * inc + inc
        }
    }

    /// Width of the reconstructed target: every class known before the newest task.
    pub fn target_width(&self) -> usize {
        self.snapshots.len() * self.class_increment
    }

    /// Reconstruct the distillation target for `images`.
    ///
    /// Fails with `HeadMismatch` if a snapshot's head is not exactly as wide as
    /// the classes known when it was taken.
    pub fn old_outputs(&self, images: &[&Image]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(self.target_width()); images.len()];
        for (i, teacher) in self.snapshots.iter().enumerate() {
            let expected = (i + 1) * self.class_increment;
            if teacher.num_classes() != expected {
                return Err(IncrementalError::HeadMismatch {
                    teacher: i,
                    expected,
                    found: teacher.num_classes(),
                });
            }
            let cols = self.target_columns(i);
            let probs = teacher.probabilities(images, self.eval_batch_size);
            for (row, p) in out.iter_mut().zip(&probs) {
                row.extend_from_slice(&p[cols.clone()]);
            }
        }
        Ok(out)
    }
}

// ─── Loss ──────────────────────────────────────────────

/// Loss values for one mini-batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossTerms {
    pub classification: f32,
    /// Unweighted distillation term, when one was computed.
    pub distillation: Option<f32>,
    pub total: f32,
}

/// Mean squared error between `outputs` and `targets`, accumulating
/// `scale · dL/dOutputs` into `grad`.
pub fn mse_with_grad(
    outputs: &[Vec<f32>],
    targets: &[Vec<f32>],
    grad: &mut [Vec<f32>],
    scale: f32,
) -> f32 {
    let count = outputs.iter().map(Vec::len).sum::<usize>().max(1) as f32;
    let mut loss = 0.0f32;
    for ((o, t), g) in outputs.iter().zip(targets).zip(grad.iter_mut()) {
        for ((&oi, &ti), gi) in o.iter().zip(t).zip(g.iter_mut()) {
            let diff = oi - ti;
            loss += diff * diff;
            *gi += scale * 2.0 * diff / count;
        }
    }
    loss / count
}

/// MSE between `√outputs[:, :K]` and `√teacher`, `K = teacher width`,
/// accumulating `scale · dL/dOutputs` into `grad`.
pub fn sqrt_distillation_with_grad(
    outputs: &[Vec<f32>],
    teacher: &[Vec<f32>],
    grad: &mut [Vec<f32>],
    scale: f32,
) -> f32 {
    let count = teacher.iter().map(Vec::len).sum::<usize>().max(1) as f32;
    let mut loss = 0.0f32;
    for ((o, t), g) in outputs.iter().zip(teacher).zip(grad.iter_mut()) {
        for ((&oi, &ti), gi) in o.iter().zip(t).zip(g.iter_mut()) {
            let so = oi.sqrt();
            let diff = so - ti.sqrt();
            loss += diff * diff;
            // d/do (√o − √t)² = (√o − √t) / √o
            *gi += scale * diff / (count * oi.max(SQRT_GRAD_FLOOR).sqrt());
        }
    }
    loss / count
}

/// Full loss for a batch of sigmoid `outputs` and the gradient w.r.t. the
/// pre-sigmoid logits.
///
/// With `teacher = None` only the classification term is used.
pub fn compose_loss(
    outputs: &[Vec<f32>],
    one_hot: &[Vec<f32>],
    teacher: Option<&[Vec<f32>]>,
    distill_weight: f32,
) -> (LossTerms, Vec<Vec<f32>>) {
    let mut grad: Vec<Vec<f32>> = outputs.iter().map(|o| vec![0.0; o.len()]).collect();
    let classification = mse_with_grad(outputs, one_hot, &mut grad, 1.0);
    let distillation =
        teacher.map(|t| sqrt_distillation_with_grad(outputs, t, &mut grad, distill_weight));
    let total = classification + distill_weight * distillation.unwrap_or(0.0);

    // Chain through the sigmoid: dσ/dz = σ(1 − σ)
    for (g, o) in grad.iter_mut().zip(outputs) {
        for (gi, &oi) in g.iter_mut().zip(o) {
            *gi *= oi * (1.0 - oi);
        }
    }

    (
        LossTerms {
            classification,
            distillation,
            total,
        },
        grad,
    )
}
