// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Evaluation-time classifiers over every class seen so far.
//!
//! - **NME / Cosine**: one unit-norm prototype per class, averaged over the
//!   class samples and their horizontal mirrors. A test feature goes to the
//!   nearest prototype (Euclidean) or the most similar one (dot product).
//! - **FC**: argmax of the sigmoid head outputs.
//!
//! Both use the gradient-free forward pass and leave the model untouched.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::ClassifierKind;
use crate::data::{Image, Sample};
use crate::error::{IncrementalError, Result};
use crate::exemplar::ExemplarStore;
use crate::math::{argmax, dot, euclidean, mean_rows, normalize, sigmoid};
use crate::model::{batched_forward, FeatureModel, ForwardOutput};

// ─── Scoring ───────────────────────────────────────────

/// Fraction of positions where `predictions` and `labels` agree.
pub fn accuracy(predictions: &[usize], labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count();
    correct as f32 / labels.len() as f32
}

/// `counts[true][predicted]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn from_predictions(num_classes: usize, predictions: &[usize], labels: &[usize]) -> Self {
        let mut matrix = Self::new(num_classes);
        for (&p, &l) in predictions.iter().zip(labels) {
            matrix.record(l, p);
        }
        matrix
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    /// Out-of-range labels are ignored.
    pub fn record(&mut self, actual: usize, predicted: usize) {
        let n = self.num_classes();
        if actual < n && predicted < n {
            self.counts[actual][predicted] += 1;
        }
    }

    pub fn count(&self, actual: usize, predicted: usize) -> usize {
        self.counts
            .get(actual)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes()).map(|i| self.counts[i][i]).sum()
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }
}

/// Result of one classifier pass over a test set.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub classifier: ClassifierKind,
    pub accuracy: f32,
    pub predictions: Vec<usize>,
    pub labels: Vec<usize>,
}

impl Evaluation {
    fn new(classifier: ClassifierKind, predictions: Vec<usize>, labels: Vec<usize>) -> Self {
        Self {
            classifier,
            accuracy: accuracy(&predictions, &labels),
            predictions,
            labels,
        }
    }

    pub fn confusion_matrix(&self, num_classes: usize) -> ConfusionMatrix {
        ConfusionMatrix::from_predictions(num_classes, &self.predictions, &self.labels)
    }
}

// ─── Prototypes ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrototypeMetric {
    /// Smallest Euclidean distance wins.
    Euclidean,
    /// Largest dot product wins.
    Dot,
}

impl PrototypeMetric {
    /// `None` for `Fc`, which does not use prototypes.
    pub fn for_classifier(kind: ClassifierKind) -> Option<Self> {
        match kind {
            ClassifierKind::Nme => Some(Self::Euclidean),
            ClassifierKind::Cosine => Some(Self::Dot),
            ClassifierKind::Fc => None,
        }
    }
}

/// Unit-norm mean feature per class, iterated by ascending label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassPrototypes {
    means: BTreeMap<usize, Vec<f32>>,
}

/// Mean feature over `samples` and their mirrors, unit-normalized.
pub fn class_prototype<M: FeatureModel>(
    model: &M,
    label: usize,
    samples: &[Sample],
    chunk: usize,
) -> Result<Vec<f32>> {
    if samples.is_empty() {
        return Err(IncrementalError::EmptyPool { label });
    }
    let flipped: Vec<Image> = samples.iter().map(|s| s.image.flip_horizontal()).collect();
    let images: Vec<&Image> = samples
        .iter()
        .map(|s| &s.image)
        .chain(flipped.iter())
        .collect();
    let features = batched_forward(model, &images, ForwardOutput::Features, chunk);
    let mut mean = mean_rows(&features).ok_or(IncrementalError::EmptyPool { label })?;
    normalize(&mut mean);
    Ok(mean)
}

impl ClassPrototypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prototypes for labels `0..n_classes`: the newest `class_increment`
    /// labels come from `current`, older ones from `store`.
    pub fn build<M: FeatureModel>(
        model: &M,
        current: &BTreeMap<usize, Vec<Sample>>,
        store: &ExemplarStore,
        n_classes: usize,
        class_increment: usize,
        chunk: usize,
    ) -> Result<Self> {
        let newest = n_classes.saturating_sub(class_increment);
        let mut prototypes = Self::new();
        for label in 0..n_classes {
            let samples: &[Sample] = if label >= newest {
                current.get(&label).map(Vec::as_slice).unwrap_or(&[])
            } else {
                store.get(label).unwrap_or(&[])
            };
            let mean = class_prototype(model, label, samples, chunk)?;
            prototypes.insert(label, mean);
        }
        tracing::debug!(classes = prototypes.len(), "class prototypes computed");
        Ok(prototypes)
    }

    pub fn insert(&mut self, label: usize, mean: Vec<f32>) {
        self.means.insert(label, mean);
    }

    pub fn get(&self, label: usize) -> Option<&[f32]> {
        self.means.get(&label).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// Label of the best prototype. On equal scores the smaller label wins.
    pub fn predict(&self, feature: &[f32], metric: PrototypeMetric) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (&label, mean) in &self.means {
            let score = match metric {
                PrototypeMetric::Euclidean => -euclidean(mean, feature),
                PrototypeMetric::Dot => dot(mean, feature),
            };
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((label, score));
            }
        }
        best.map(|(label, _)| label)
    }
}

// ─── Classifiers ───────────────────────────────────────

fn split(test: &[Sample]) -> (Vec<&Image>, Vec<usize>) {
    test.iter().map(|s| (&s.image, s.label)).unzip()
}

/// Nearest-prototype classification of `test`.
pub fn classify_nme<M: FeatureModel>(
    model: &M,
    test: &[Sample],
    prototypes: &ClassPrototypes,
    metric: PrototypeMetric,
    chunk: usize,
) -> Evaluation {
    let (images, labels) = split(test);
    let features = batched_forward(model, &images, ForwardOutput::Features, chunk);
    let first = prototypes.means.keys().next().copied().unwrap_or(0);
    let predictions = features
        .iter()
        .map(|f| prototypes.predict(f, metric).unwrap_or(first))
        .collect();
    let kind = match metric {
        PrototypeMetric::Euclidean => ClassifierKind::Nme,
        PrototypeMetric::Dot => ClassifierKind::Cosine,
    };
    Evaluation::new(kind, predictions, labels)
}

/// Argmax of the sigmoid head over columns `0..n_classes`.
pub fn classify_fc<M: FeatureModel>(
    model: &M,
    test: &[Sample],
    n_classes: usize,
    chunk: usize,
) -> Evaluation {
    let (images, labels) = split(test);
    let scores = batched_forward(model, &images, ForwardOutput::Scores, chunk);
    let predictions = scores
        .iter()
        .map(|row| {
            let valid = &row[..n_classes.min(row.len())];
            let probs: Vec<f32> = valid.iter().map(|&z| sigmoid(z)).collect();
            // All-NaN rows fall back to class 0.
            argmax(&probs).unwrap_or(0)
        })
        .collect();
    Evaluation::new(ClassifierKind::Fc, predictions, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelMode, ParamSlot};
    use rand::rngs::StdRng;

    /// Features are the raw pixels; scores are the pixels too.
    #[derive(Clone)]
    struct Identity;

    impl FeatureModel for Identity {
        fn feature_dim(&self) -> usize {
            2
        }
        fn num_classes(&self) -> usize {
            2
        }
        fn mode(&self) -> ModelMode {
            ModelMode::Eval
        }
        fn set_mode(&mut self, _mode: ModelMode) {}
        fn forward(&self, inputs: &[&Image], _output: ForwardOutput) -> Vec<Vec<f32>> {
            inputs.iter().map(|img| img.pixels.clone()).collect()
        }
        fn forward_train(&mut self, inputs: &[Image]) -> Vec<Vec<f32>> {
            inputs.iter().map(|img| img.pixels.clone()).collect()
        }
        fn backward(&mut self, _grad_logits: &[Vec<f32>]) {}
        fn zero_grad(&mut self) {}
        fn visit_parameters(&mut self, _visitor: &mut dyn FnMut(ParamSlot<'_>)) {}
        fn expand_head(&mut self, _by: usize, _rng: &mut StdRng) {}
    }

    /// 1×1×2 image: horizontal flip leaves it unchanged.
    fn point(x: f32, y: f32, label: usize) -> Sample {
        Sample::new(Image::new(2, 1, 1, vec![x, y]), label)
    }

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(&[0, 1, 2, 2], &[0, 1, 1, 2]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_confusion_matrix() {
        let m = ConfusionMatrix::from_predictions(3, &[0, 1, 1, 2], &[0, 1, 2, 2]);
        assert_eq!(m.num_classes(), 3);
        assert_eq!(m.count(2, 1), 1);
        assert_eq!(m.count(2, 2), 1);
        assert_eq!(m.total(), 4);
        assert_eq!(m.correct(), 3);
        assert_eq!(m.rows(), &[vec![1, 0, 0], vec![0, 1, 0], vec![0, 1, 1]]);
    }

    #[test]
    fn test_prototype_mirrors_and_normalizes() {
        // Single-row image, so the flip swaps the two values.
        let sample = Sample::new(Image::new(1, 1, 2, vec![3.0, 1.0]), 0);
        let proto = class_prototype(&Identity, 0, &[sample], 512).unwrap();
        // mean of [3,1] and [1,3] is [2,2]; normalized to 1/√2 each
        let expected = 1.0 / 2.0f32.sqrt();
        assert!((proto[0] - expected).abs() < 1e-6);
        assert!((proto[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_prototype_empty_pool() {
        assert_eq!(
            class_prototype(&Identity, 4, &[], 512).unwrap_err(),
            IncrementalError::EmptyPool { label: 4 }
        );
    }

    #[test]
    fn test_nme_and_cosine_predictions() {
        let mut protos = ClassPrototypes::new();
        protos.insert(0, vec![1.0, 0.0]);
        protos.insert(1, vec![0.0, 1.0]);

        let test = vec![point(0.9, 0.1, 0), point(0.2, 0.8, 1), point(2.0, 1.5, 0)];
        let nme = classify_nme(&Identity, &test, &protos, PrototypeMetric::Euclidean, 2);
        assert_eq!(nme.classifier, ClassifierKind::Nme);
        assert_eq!(nme.predictions, vec![0, 1, 0]);
        assert_eq!(nme.accuracy, 1.0);

        let cos = classify_nme(&Identity, &test, &protos, PrototypeMetric::Dot, 2);
        assert_eq!(cos.classifier, ClassifierKind::Cosine);
        assert_eq!(cos.predictions, vec![0, 1, 0]);
    }

    #[test]
    fn test_ties_go_to_smaller_label() {
        let mut protos = ClassPrototypes::new();
        protos.insert(3, vec![0.0, 1.0]);
        protos.insert(1, vec![1.0, 0.0]);
        let feature = [0.5, 0.5];
        assert_eq!(protos.predict(&feature, PrototypeMetric::Euclidean), Some(1));
        assert_eq!(protos.predict(&feature, PrototypeMetric::Dot), Some(1));
    }

    #[test]
    fn test_prediction_independent_of_insertion_order() {
        let means = [
            (0usize, vec![1.0f32, 0.0]),
            (1, vec![0.0, 1.0]),
            (2, vec![0.6, 0.8]),
            (3, vec![0.8, 0.6]),
        ];
        let mut forward = ClassPrototypes::new();
        for (label, mean) in means.iter() {
            forward.insert(*label, mean.clone());
        }
        let mut reverse = ClassPrototypes::new();
        for (label, mean) in means.iter().rev() {
            reverse.insert(*label, mean.clone());
        }

        let test: Vec<Sample> = (0..20)
            .map(|i| {
                let t = i as f32 / 19.0;
                point(t, 1.0 - t, i % 4)
            })
            .collect();
        for metric in [PrototypeMetric::Euclidean, PrototypeMetric::Dot] {
            let a = classify_nme(&Identity, &test, &forward, metric, 7);
            let b = classify_nme(&Identity, &test, &reverse, metric, 3);
            assert_eq!(a.predictions, b.predictions);
        }
    }

    #[test]
    fn test_build_uses_current_pool_for_newest_classes() {
        let mut store = ExemplarStore::new();
        store.insert(0, vec![point(1.0, 0.0, 0)]);
        store.insert(1, vec![point(0.0, 1.0, 1)]);
        let mut current = BTreeMap::new();
        current.insert(2, vec![point(-1.0, 0.0, 2), point(-3.0, 0.0, 2)]);
        current.insert(3, vec![point(0.0, -2.0, 3)]);

        let protos = ClassPrototypes::build(&Identity, &current, &store, 4, 2, 512).unwrap();
        assert_eq!(protos.len(), 4);
        assert_eq!(protos.get(0), Some(&[1.0, 0.0][..]));
        assert_eq!(protos.get(2), Some(&[-1.0, 0.0][..]));
        assert_eq!(protos.get(3), Some(&[0.0, -1.0][..]));
    }

    #[test]
    fn test_build_reports_missing_class() {
        let store = ExemplarStore::new();
        let current = BTreeMap::new();
        let err = ClassPrototypes::build(&Identity, &current, &store, 2, 2, 512).unwrap_err();
        assert_eq!(err, IncrementalError::EmptyPool { label: 0 });
    }

    #[test]
    fn test_fc_restricts_columns() {
        let test = vec![point(0.1, 5.0, 0), point(0.3, -1.0, 0)];
        let fc = classify_fc(&Identity, &test, 1, 512);
        assert_eq!(fc.predictions, vec![0, 0]);
        assert_eq!(fc.accuracy, 1.0);

        let full = classify_fc(&Identity, &test, 2, 512);
        assert_eq!(full.predictions, vec![1, 0]);
        assert_eq!(full.accuracy, 0.5);
    }
}
