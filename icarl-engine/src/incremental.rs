// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Task-sequence orchestration for the two run modes.
//!
//! Replay (iCaRL), per task:
//! 1. Update the representation on the batch plus the flattened store
//! 2. Select exemplars for the new classes and merge them into the store
//! 3. Non-first tasks: evaluate FC and NME, then stabilize on the store
//! 4. Final evaluation with the configured classifier; accuracy recorded
//! 5. Reduce the store to `memory / classes_seen` per class
//!
//! No replay (LwF): update with an empty replay pool, evaluate with FC.
//! Tasks run strictly in order; each depends on the previous model.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::classifier::{
    classify_fc, classify_nme, ClassPrototypes, Evaluation, PrototypeMetric,
};
use crate::config::{ClassifierKind, IncrementalConfig};
use crate::data::{group_by_class, Augmentation, PadCropFlip, Sample};
use crate::distill::TeacherRegistry;
use crate::error::{IncrementalError, Result};
use crate::exemplar::{ExemplarSelector, ExemplarStore};
use crate::model::{FeatureModel, ModelMode};
use crate::observer::{EvalStage, ProgressEvent, ProgressObserver, ProgressReporter};
use crate::training::{RepresentationUpdater, TrainingContext};

/// Outcome of a full run.
#[derive(Debug, Clone)]
pub struct RunReport<M> {
    /// Recorded accuracy after every task, in task order.
    pub accuracy_per_task: Vec<f32>,
    pub model: M,
}

/// Owns the run-scoped state: teachers, exemplar store, RNG and reporter.
pub struct IncrementalLearner<M> {
    config: IncrementalConfig,
    updater: RepresentationUpdater,
    selector: ExemplarSelector,
    registry: TeacherRegistry<M>,
    store: ExemplarStore,
    reporter: ProgressReporter,
    augmentation: Box<dyn Augmentation>,
    rng: StdRng,
}

impl<M: FeatureModel> IncrementalLearner<M> {
    pub fn new(config: IncrementalConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            device = ?config.device,
            seed = config.seed,
            "incremental learner created"
        );
        Ok(Self {
            updater: RepresentationUpdater::from_config(&config),
            selector: ExemplarSelector::new(config.selection, config.eval_batch_size),
            registry: TeacherRegistry::new(config.class_increment, config.eval_batch_size),
            store: ExemplarStore::new(),
            reporter: ProgressReporter::default(),
            augmentation: Box::new(PadCropFlip::default()),
            rng: StdRng::seed_from_u64(config.seed),
            config,
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn ProgressObserver>) -> Self {
        self.reporter = ProgressReporter::new(observer);
        self
    }

    pub fn with_augmentation(mut self, augmentation: Box<dyn Augmentation>) -> Self {
        tracing::debug!(augmentation = augmentation.name(), "augmentation set");
        self.augmentation = augmentation;
        self
    }

    pub fn config(&self) -> &IncrementalConfig {
        &self.config
    }

    pub fn store(&self) -> &ExemplarStore {
        &self.store
    }

    pub fn registry(&self) -> &TeacherRegistry<M> {
        &self.registry
    }

    fn reset(&mut self) {
        self.registry =
            TeacherRegistry::new(self.config.class_increment, self.config.eval_batch_size);
        self.store = ExemplarStore::new();
        self.rng = StdRng::seed_from_u64(self.config.seed);
        self.reporter.restart();
    }

    /// Every train and test image must share one shape.
    fn check_shapes(train_batches: &[Vec<Sample>], test_batches: &[Vec<Sample>]) -> Result<()> {
        let mut images = train_batches.iter().chain(test_batches).flatten().map(|s| &s.image);
        let Some(first) = images.next() else {
            return Ok(());
        };
        let shape = (first.channels, first.height, first.width);
        match images.find(|image| (image.channels, image.height, image.width) != shape) {
            Some(image) => Err(IncrementalError::InvalidConfig(format!(
                "image of shape {}x{}x{} in a stream of {}x{}x{}",
                image.channels, image.height, image.width, shape.0, shape.1, shape.2
            ))),
            None => Ok(()),
        }
    }

    fn test_batch<'t>(test_batches: &'t [Vec<Sample>], task: usize) -> Result<&'t [Sample]> {
        test_batches.get(task).map(Vec::as_slice).ok_or_else(|| {
            IncrementalError::InvalidConfig(format!("no test batch for task {task}"))
        })
    }

    /// Replay mode: exemplar memory, stabilization and prototype evaluation.
    pub fn run(
        &mut self,
        train_batches: &[Vec<Sample>],
        test_batches: &[Vec<Sample>],
        mut model: M,
    ) -> Result<RunReport<M>> {
        Self::check_shapes(train_batches, test_batches)?;
        self.reset();
        tracing::info!(
            tasks = train_batches.len(),
            augmentation = self.augmentation.name(),
            "run started"
        );
        let inc = self.config.class_increment;
        let mut accuracy_per_task = Vec::with_capacity(train_batches.len());

        for (task, batch) in train_batches.iter().enumerate() {
            let n_classes = (task + 1) * inc;
            let test = Self::test_batch(test_batches, task)?;
            self.reporter.emit(ProgressEvent::TaskStarted { task, n_classes });

            let replay = self.store.flatten();
            model = {
                let mut ctx = TrainingContext {
                    rng: &mut self.rng,
                    augmentation: self.augmentation.as_ref(),
                    reporter: &mut self.reporter,
                };
                self.updater
                    .update(model, batch, &replay, n_classes, &mut self.registry, &mut ctx)?
            };
            model.set_mode(ModelMode::Eval);

            let current = group_by_class(batch);
            let new_pools: BTreeMap<usize, Vec<Sample>> = current
                .iter()
                .filter(|&(&label, _)| label + inc >= n_classes && label < n_classes)
                .map(|(&label, pool)| (label, pool.clone()))
                .collect();
            let quota = self.config.selection_quota(n_classes);
            let selected = self
                .selector
                .select_all(new_pools, &model, quota, &mut self.rng)?;
            self.reporter.emit(ProgressEvent::ExemplarsSelected {
                strategy: self.config.selection,
                classes: selected.len(),
                per_class: quota,
            });
            self.store.extend(selected);

            let prototype_kind = match self.config.classifier {
                ClassifierKind::Cosine => ClassifierKind::Cosine,
                _ => ClassifierKind::Nme,
            };

            if task != 0 {
                let stage = EvalStage::PreStabilize;
                self.evaluate(&model, test, &current, n_classes, task, ClassifierKind::Fc, stage)?;
                self.evaluate(&model, test, &current, n_classes, task, prototype_kind, stage)?;

                let memory = self.store.flatten();
                model = {
                    let mut ctx = TrainingContext {
                        rng: &mut self.rng,
                        augmentation: self.augmentation.as_ref(),
                        reporter: &mut self.reporter,
                    };
                    self.updater.stabilize(model, &memory, n_classes, &mut ctx)?
                };
                model.set_mode(ModelMode::Eval);
            }

            let stage = EvalStage::Final;
            let fc =
                self.evaluate(&model, test, &current, n_classes, task, ClassifierKind::Fc, stage)?;
            let recorded = match self.config.classifier {
                ClassifierKind::Fc => fc,
                kind => self.evaluate(&model, test, &current, n_classes, task, kind, stage)?,
            };
            self.finish_task(task, n_classes, &recorded);
            accuracy_per_task.push(recorded.accuracy);

            let reduced = self.config.reduced_quota(n_classes);
            self.store.reduce(reduced);
            self.reporter.emit(ProgressEvent::ExemplarsReduced {
                quota: reduced,
                total: self.store.len(),
            });
        }

        tracing::info!(
            elapsed_s = self.reporter.elapsed().as_secs_f64(),
            "run finished"
        );
        Ok(RunReport {
            accuracy_per_task,
            model,
        })
    }

    /// No-replay mode: distillation only, FC evaluation only.
    pub fn run_lwf(
        &mut self,
        train_batches: &[Vec<Sample>],
        test_batches: &[Vec<Sample>],
        mut model: M,
    ) -> Result<RunReport<M>> {
        Self::check_shapes(train_batches, test_batches)?;
        self.reset();
        tracing::info!(
            tasks = train_batches.len(),
            augmentation = self.augmentation.name(),
            "run started"
        );
        let inc = self.config.class_increment;
        let mut accuracy_per_task = Vec::with_capacity(train_batches.len());
        let empty = BTreeMap::new();

        for (task, batch) in train_batches.iter().enumerate() {
            let n_classes = (task + 1) * inc;
            let test = Self::test_batch(test_batches, task)?;
            self.reporter.emit(ProgressEvent::TaskStarted { task, n_classes });

            model = {
                let mut ctx = TrainingContext {
                    rng: &mut self.rng,
                    augmentation: self.augmentation.as_ref(),
                    reporter: &mut self.reporter,
                };
                self.updater
                    .update(model, batch, &[], n_classes, &mut self.registry, &mut ctx)?
            };
            model.set_mode(ModelMode::Eval);

            let evaluation = self.evaluate(
                &model,
                test,
                &empty,
                n_classes,
                task,
                ClassifierKind::Fc,
                EvalStage::Final,
            )?;
            self.finish_task(task, n_classes, &evaluation);
            accuracy_per_task.push(evaluation.accuracy);
        }

        tracing::info!(
            elapsed_s = self.reporter.elapsed().as_secs_f64(),
            "run finished"
        );
        Ok(RunReport {
            accuracy_per_task,
            model,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &mut self,
        model: &M,
        test: &[Sample],
        current: &BTreeMap<usize, Vec<Sample>>,
        n_classes: usize,
        task: usize,
        kind: ClassifierKind,
        stage: EvalStage,
    ) -> Result<Evaluation> {
        let chunk = self.config.eval_batch_size;
        let evaluation = match PrototypeMetric::for_classifier(kind) {
            None => classify_fc(model, test, n_classes, chunk),
            Some(metric) => {
                let prototypes = ClassPrototypes::build(
                    model,
                    current,
                    &self.store,
                    n_classes,
                    self.config.class_increment,
                    chunk,
                )?;
                classify_nme(model, test, &prototypes, metric, chunk)
            }
        };
        self.reporter.emit(ProgressEvent::Evaluated {
            task,
            classifier: kind,
            stage,
            accuracy: evaluation.accuracy,
        });
        Ok(evaluation)
    }

    fn finish_task(&mut self, task: usize, n_classes: usize, evaluation: &Evaluation) {
        if self.config.confusion_matrix {
            self.reporter.emit(ProgressEvent::ConfusionMatrix {
                task,
                matrix: evaluation.confusion_matrix(n_classes),
            });
        }
        self.reporter.emit(ProgressEvent::TaskFinished {
            task,
            accuracy: evaluation.accuracy,
        });
    }
}
