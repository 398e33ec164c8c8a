// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Representation update and stabilization passes.
//!
//! Pipeline per task:
//! 1. Init: training pool = current batch ++ replay memory. On every task
//!    after the first, freeze the model into the teacher registry, then grow
//!    the head by one increment.
//! 2. Train: shuffled drop-last mini-batches, augmentation, sigmoid outputs,
//!    MSE against one-hot targets plus square-root distillation against the
//!    teachers (skipped on the first task and when fine-tuning).
//! 3. Done: the updated model is handed back; nothing is retained here.
//!
//! Stabilization reuses the same epoch loop on the replay memory alone with
//! the plain MSE loss and its own milestone schedule at thirds of the run.

use rand::rngs::StdRng;

use crate::config::{DistillWeighting, IncrementalConfig, PassConfig};
use crate::data::{one_hot, Augmentation, BatchLoader, Image, Sample};
use crate::distill::{compose_loss, TeacherRegistry};
use crate::error::{IncrementalError, Result};
use crate::math::sigmoid;
use crate::model::{FeatureModel, ModelMode};
use crate::observer::{Pass, ProgressEvent, ProgressReporter};
use crate::optim::{decay_policy, Optimizer, Sgd, StepSchedule, TaskHyperparameters};

/// Mutable collaborators shared by both passes.
pub struct TrainingContext<'a> {
    pub rng: &'a mut StdRng,
    pub augmentation: &'a dyn Augmentation,
    pub reporter: &'a mut ProgressReporter,
}

/// Distillation source for one pass.
struct Distillation<'r, M> {
    registry: &'r TeacherRegistry<M>,
    weight: f32,
}

/// Drives the representation update and stabilization passes.
#[derive(Debug, Clone)]
pub struct RepresentationUpdater {
    pub class_increment: usize,
    pub batch_size: usize,
    pub update: PassConfig,
    pub stabilize: PassConfig,
    /// Absolute epochs at which the update pass decays its learning rate.
    pub lr_milestones: Vec<usize>,
    pub lr_decay_factor: f32,
    pub lambda: f64,
    pub distill_weighting: DistillWeighting,
    pub fine_tune: bool,
    pub decay_policy: bool,
}

impl RepresentationUpdater {
    pub fn from_config(config: &IncrementalConfig) -> Self {
        Self {
            class_increment: config.class_increment,
            batch_size: config.batch_size,
            update: config.update.clone(),
            stabilize: config.stabilize.clone(),
            lr_milestones: config.lr_milestones.clone(),
            lr_decay_factor: config.lr_decay_factor,
            lambda: config.lambda,
            distill_weighting: config.distill_weighting,
            fine_tune: config.fine_tune,
            decay_policy: config.decay_policy,
        }
    }

    pub fn with_fine_tune(mut self, fine_tune: bool) -> Self {
        self.fine_tune = fine_tune;
        self
    }

    /// Weight decay and lambda for the task ending at `n_classes`.
    pub fn hyperparameters(&self, n_classes: usize) -> TaskHyperparameters {
        let wd = self.update.weight_decay;
        let lambda = self.lambda;
        if self.decay_policy {
            decay_policy(n_classes, self.class_increment, wd, lambda)
        } else {
            TaskHyperparameters {
                weight_decay: wd,
                lambda,
                step: (n_classes / self.class_increment.max(1)).saturating_sub(1),
            }
        }
    }

    /// Train `model` on `batch` plus `replay` for the task ending at `n_classes`.
    ///
    /// On non-first tasks the model is snapshotted into `registry` and its
    /// head grown by `class_increment` before training starts.
    pub fn update<M: FeatureModel>(
        &self,
        mut model: M,
        batch: &[Sample],
        replay: &[Sample],
        n_classes: usize,
        registry: &mut TeacherRegistry<M>,
        ctx: &mut TrainingContext<'_>,
    ) -> Result<M> {
        let inc = self.class_increment;
        let first_task = n_classes <= inc;

        if first_task {
            if model.num_classes() != n_classes {
                return Err(IncrementalError::InvalidConfig(format!(
                    "first task expects a head of {n_classes} classes, model has {}",
                    model.num_classes()
                )));
            }
        } else {
            let old = n_classes - inc;
            if model.num_classes() != old {
                return Err(IncrementalError::HeadMismatch {
                    teacher: registry.len(),
                    expected: old,
                    found: model.num_classes(),
                });
            }
            registry.snapshot(&model);
            if registry.target_width() != old {
                return Err(IncrementalError::HeadMismatch {
                    teacher: registry.len() - 1,
                    expected: old,
                    found: registry.target_width(),
                });
            }
            model.expand_head(inc, ctx.rng);
        }

        let mut pool: Vec<Sample> = batch.to_vec();
        pool.extend_from_slice(replay);

        let hp = self.hyperparameters(n_classes);
        let weight = match self.distill_weighting {
            DistillWeighting::Unit => 1.0,
            DistillWeighting::Lambda => hp.lambda as f32,
        };
        let distill = (!first_task && !self.fine_tune).then_some(Distillation {
            registry: &*registry,
            weight,
        });

        tracing::info!(
            n_classes,
            pool = pool.len(),
            replay = replay.len(),
            weight_decay = hp.weight_decay,
            distill = distill.is_some(),
            "updating representation"
        );

        let mut sgd = Sgd::new(
            self.update.learning_rate,
            self.update.momentum,
            hp.weight_decay as f32,
        );
        let schedule = StepSchedule::new(self.lr_milestones.iter().copied(), self.lr_decay_factor);
        self.run_pass(
            &mut model,
            &pool,
            n_classes,
            Pass::Update,
            self.update.epochs,
            &mut sgd,
            &schedule,
            distill.as_ref(),
            ctx,
        )?;
        Ok(model)
    }

    /// Re-balance the head on the replay memory alone.
    pub fn stabilize<M: FeatureModel>(
        &self,
        mut model: M,
        replay: &[Sample],
        n_classes: usize,
        ctx: &mut TrainingContext<'_>,
    ) -> Result<M> {
        tracing::info!(n_classes, pool = replay.len(), "stabilizing");
        let mut sgd = Sgd::new(
            self.stabilize.learning_rate,
            self.stabilize.momentum,
            self.stabilize.weight_decay as f32,
        );
        let schedule = StepSchedule::thirds(self.stabilize.epochs, self.lr_decay_factor);
        self.run_pass::<M>(
            &mut model,
            replay,
            n_classes,
            Pass::Stabilize,
            self.stabilize.epochs,
            &mut sgd,
            &schedule,
            None,
            ctx,
        )?;
        Ok(model)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_pass<M: FeatureModel>(
        &self,
        model: &mut M,
        pool: &[Sample],
        n_classes: usize,
        pass: Pass,
        epochs: usize,
        sgd: &mut Sgd,
        schedule: &StepSchedule,
        distill: Option<&Distillation<'_, M>>,
        ctx: &mut TrainingContext<'_>,
    ) -> Result<()> {
        let loader = BatchLoader::new(self.batch_size)
            .with_shuffle(true)
            .with_drop_last(true);
        if epochs > 0 && loader.num_batches(pool.len()) == 0 {
            return Err(IncrementalError::EmptyBatch {
                pass: pass.name(),
                pool_size: pool.len(),
                batch_size: self.batch_size,
            });
        }

        for epoch in 0..epochs {
            schedule.on_epoch_start(epoch, sgd);
            model.set_mode(ModelMode::Train);

            let mut running = 0.0f32;
            for batch in loader.batches(pool, ctx.rng) {
                let mut images: Vec<Image> = Vec::with_capacity(batch.len());
                for sample in &batch {
                    images.push(ctx.augmentation.apply(&sample.image, ctx.rng));
                }
                let labels: Vec<usize> = batch.iter().map(|s| s.label).collect();
                let targets = one_hot(&labels, n_classes)?;

                model.zero_grad();
                let outputs: Vec<Vec<f32>> = model
                    .forward_train(&images)
                    .into_iter()
                    .map(|row| row.into_iter().map(sigmoid).collect())
                    .collect();

                let teacher = match distill {
                    Some(d) => {
                        let refs: Vec<&Image> = images.iter().collect();
                        Some(d.registry.old_outputs(&refs)?)
                    }
                    None => None,
                };
                let weight = distill.map_or(1.0, |d| d.weight);
                let (terms, grad) = compose_loss(&outputs, &targets, teacher.as_deref(), weight);
                if !terms.total.is_finite() {
                    return Err(IncrementalError::NonFiniteLoss {
                        pass: pass.name(),
                        epoch,
                        loss: terms.total,
                    });
                }

                model.backward(&grad);
                sgd.step(model);
                running += terms.total * images.len() as f32;
            }

            ctx.reporter.emit(ProgressEvent::EpochCompleted {
                pass,
                epoch,
                epochs,
                learning_rate: sgd.learning_rate(),
                loss: running / pool.len() as f32,
            });
        }
        Ok(())
    }
}
