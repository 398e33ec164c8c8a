// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Structured progress events emitted while a run advances.
//!
//! Observers are purely observational: nothing they do feeds back into
//! training or selection.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::classifier::ConfusionMatrix;
use crate::config::{ClassifierKind, SelectionStrategy};

/// Which SGD pass an epoch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Pass {
    Update,
    Stabilize,
}

impl Pass {
    pub fn name(self) -> &'static str {
        match self {
            Pass::Update => "update",
            Pass::Stabilize => "stabilize",
        }
    }
}

/// When in the task an evaluation ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvalStage {
    /// Before the stabilization pass (non-first replay tasks only).
    PreStabilize,
    /// The evaluation whose accuracy is recorded for the task.
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProgressEvent {
    TaskStarted {
        task: usize,
        n_classes: usize,
    },
    EpochCompleted {
        pass: Pass,
        epoch: usize,
        epochs: usize,
        learning_rate: f32,
        loss: f32,
    },
    ExemplarsSelected {
        strategy: SelectionStrategy,
        classes: usize,
        per_class: usize,
    },
    Evaluated {
        task: usize,
        classifier: ClassifierKind,
        stage: EvalStage,
        accuracy: f32,
    },
    ExemplarsReduced {
        quota: usize,
        total: usize,
    },
    ConfusionMatrix {
        task: usize,
        matrix: ConfusionMatrix,
    },
    TaskFinished {
        task: usize,
        accuracy: f32,
    },
}

pub trait ProgressObserver: Send {
    fn on_event(&mut self, event: &ProgressEvent, elapsed: Duration);
}

/// Forwards every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_event(&mut self, event: &ProgressEvent, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        match event {
            ProgressEvent::TaskStarted { task, n_classes } => {
                tracing::info!(task, n_classes, elapsed_s = secs, "task started");
            }
            ProgressEvent::EpochCompleted {
                pass,
                epoch,
                epochs,
                learning_rate,
                loss,
            } => {
                tracing::debug!(?pass, epoch, epochs, learning_rate, loss, "epoch");
            }
            ProgressEvent::ExemplarsSelected {
                strategy,
                classes,
                per_class,
            } => {
                tracing::info!(
                    ?strategy,
                    classes,
                    per_class,
                    elapsed_s = secs,
                    "exemplars selected"
                );
            }
            ProgressEvent::Evaluated {
                task,
                classifier,
                stage,
                accuracy,
            } => {
                tracing::info!(task, ?classifier, ?stage, accuracy, elapsed_s = secs, "evaluated");
            }
            ProgressEvent::ExemplarsReduced { quota, total } => {
                tracing::info!(quota, total, "exemplar store reduced");
            }
            ProgressEvent::ConfusionMatrix { task, matrix } => {
                tracing::info!(task, classes = matrix.num_classes(), "confusion matrix");
                tracing::debug!(task, rows = ?matrix.rows(), "confusion matrix rows");
            }
            ProgressEvent::TaskFinished { task, accuracy } => {
                tracing::info!(task, accuracy, elapsed_s = secs, "task finished");
            }
        }
    }
}

/// Discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_event(&mut self, _event: &ProgressEvent, _elapsed: Duration) {}
}

/// Keeps every event. Clones share the same log, so a handle kept by the
/// caller sees what the run recorded.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Classifiers evaluated so far, in order.
    pub fn evaluations(&self) -> Vec<(usize, ClassifierKind, EvalStage)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Evaluated {
                    task,
                    classifier,
                    stage,
                    ..
                } => Some((task, classifier, stage)),
                _ => None,
            })
            .collect()
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_event(&mut self, event: &ProgressEvent, _elapsed: Duration) {
        let mut guard = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(event.clone());
    }
}

/// Observer plus the run's start time.
pub struct ProgressReporter {
    observer: Box<dyn ProgressObserver>,
    started: Instant,
}

impl ProgressReporter {
    pub fn new(observer: Box<dyn ProgressObserver>) -> Self {
        Self {
            observer,
            started: Instant::now(),
        }
    }

    pub fn emit(&mut self, event: ProgressEvent) {
        let elapsed = self.started.elapsed();
        self.observer.on_event(&event, elapsed);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Restart the clock events are stamped against.
    pub fn restart(&mut self) {
        self.started = Instant::now();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(Box::new(TracingObserver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_elapsed_is_monotonic() {
        let reporter = ProgressReporter::new(Box::new(NullObserver));
        let first = reporter.elapsed();
        assert!(reporter.elapsed() >= first);

        let mut reporter = reporter;
        std::thread::sleep(Duration::from_millis(5));
        let before = reporter.elapsed();
        reporter.restart();
        assert!(reporter.elapsed() < before);
    }

    #[test]
    fn test_recording_observer_shares_log() {
        let recorder = RecordingObserver::new();
        let mut reporter = ProgressReporter::new(Box::new(recorder.clone()));
        reporter.emit(ProgressEvent::TaskStarted {
            task: 0,
            n_classes: 10,
        });
        reporter.emit(ProgressEvent::Evaluated {
            task: 0,
            classifier: ClassifierKind::Fc,
            stage: EvalStage::Final,
            accuracy: 0.5,
        });
        assert_eq!(recorder.events().len(), 2);
        assert_eq!(
            recorder.evaluations(),
            vec![(0, ClassifierKind::Fc, EvalStage::Final)]
        );
    }

    #[test]
    fn test_tracing_observer_accepts_all_events() {
        let mut obs = TracingObserver;
        obs.on_event(
            &ProgressEvent::ExemplarsReduced { quota: 1, total: 20 },
            Duration::from_millis(5),
        );
        obs.on_event(
            &ProgressEvent::ConfusionMatrix {
                task: 0,
                matrix: ConfusionMatrix::new(2),
            },
            Duration::ZERO,
        );
    }
}
