// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Feature model capability consumed by the engine, plus a reference MLP.
//!
//! The engine never looks inside a model. It needs:
//! 1. **Evaluation forward**: per-sample features or class logits
//! 2. **Training forward/backward**: logits with cached activations, then
//!    gradients of the loss w.r.t. those logits
//! 3. **Parameter visiting**: so an optimizer can update values in place
//! 4. **Head expansion**: grow the output layer, keeping trained rows
//! 5. **Deep copy** (`Clone`): an independent snapshot for distillation
//!
//! `MlpModel` implements all of it with one ReLU hidden layer whose
//! activations serve as the feature vector, and a row-major linear head.

use rand::rngs::StdRng;
use rand::Rng;

use crate::data::Image;

// ─── Capability ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    Train,
    Eval,
}

/// What an evaluation forward pass returns per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutput {
    /// Raw class logits, one per head column.
    Scores,
    /// Embedding of width `feature_dim()`.
    Features,
}

/// One trainable tensor exposed to an optimizer.
pub struct ParamSlot<'a> {
    /// Stable identifier, used to key optimizer state such as momentum.
    pub id: usize,
    pub values: &'a mut [f32],
    pub grads: &'a [f32],
}

pub trait FeatureModel: Clone + Send {
    fn feature_dim(&self) -> usize;

    /// Current head width.
    fn num_classes(&self) -> usize;

    fn mode(&self) -> ModelMode;

    fn set_mode(&mut self, mode: ModelMode);

    /// Gradient-free forward pass. Never mutates the model.
    ///
    /// Inputs must match the shape the model was built for; implementations
    /// may panic otherwise. `IncrementalLearner` rejects mixed-shape streams
    /// before training.
    fn forward(&self, inputs: &[&Image], output: ForwardOutput) -> Vec<Vec<f32>>;

    /// Forward pass that caches what `backward` needs. Returns logits.
    fn forward_train(&mut self, inputs: &[Image]) -> Vec<Vec<f32>>;

    /// Accumulate parameter gradients given `dLoss/dLogits` for the last
    /// `forward_train` batch.
    fn backward(&mut self, grad_logits: &[Vec<f32>]);

    fn zero_grad(&mut self);

    fn visit_parameters(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>));

    /// Append `by` freshly initialized output columns. Existing rows are kept.
    fn expand_head(&mut self, by: usize, rng: &mut StdRng);

    fn features(&self, inputs: &[&Image]) -> Vec<Vec<f32>> {
        self.forward(inputs, ForwardOutput::Features)
    }

    fn scores(&self, inputs: &[&Image]) -> Vec<Vec<f32>> {
        self.forward(inputs, ForwardOutput::Scores)
    }
}

/// Evaluation forward over `images`, `chunk` samples at a time.
pub fn batched_forward<M: FeatureModel>(
    model: &M,
    images: &[&Image],
    output: ForwardOutput,
    chunk: usize,
) -> Vec<Vec<f32>> {
    let mut out = Vec::with_capacity(images.len());
    for batch in images.chunks(chunk.max(1)) {
        out.extend(model.forward(batch, output));
    }
    out
}

// ─── MLP ───────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct ForwardCache {
    inputs: Vec<Vec<f32>>,
    hidden: Vec<Vec<f32>>,
}

/// Two-layer perceptron: `features = relu(W1·x + b1)`, `logits = W2·features + b2`.
///
/// Weights are row-major: `w1[i * input_dim + j]`, `w2[k * feature_dim + i]`.
#[derive(Debug, Clone)]
pub struct MlpModel {
    pub input_dim: usize,
    feature_dim: usize,
    num_classes: usize,
    pub w1: Vec<f32>,
    pub b1: Vec<f32>,
    pub w2: Vec<f32>,
    pub b2: Vec<f32>,
    grad_w1: Vec<f32>,
    grad_b1: Vec<f32>,
    grad_w2: Vec<f32>,
    grad_b2: Vec<f32>,
    mode: ModelMode,
    cache: Option<ForwardCache>,
}

fn uniform_init(len: usize, fan_in: usize, rng: &mut StdRng) -> Vec<f32> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
}

impl MlpModel {
    pub fn new(input_dim: usize, feature_dim: usize, num_classes: usize, rng: &mut StdRng) -> Self {
        Self {
            input_dim,
            feature_dim,
            num_classes,
            w1: uniform_init(feature_dim * input_dim, input_dim, rng),
            b1: uniform_init(feature_dim, input_dim, rng),
            w2: uniform_init(num_classes * feature_dim, feature_dim, rng),
            b2: vec![0.0; num_classes],
            grad_w1: vec![0.0; feature_dim * input_dim],
            grad_b1: vec![0.0; feature_dim],
            grad_w2: vec![0.0; num_classes * feature_dim],
            grad_b2: vec![0.0; num_classes],
            mode: ModelMode::Train,
            cache: None,
        }
    }

    fn hidden(&self, x: &[f32]) -> Vec<f32> {
        assert_eq!(
            x.len(),
            self.input_dim,
            "input of {} values, model expects {}",
            x.len(),
            self.input_dim
        );
        (0..self.feature_dim)
            .map(|i| {
                let row = &self.w1[i * self.input_dim..(i + 1) * self.input_dim];
                let z = self.b1[i] + row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>();
                z.max(0.0)
            })
            .collect()
    }

    fn head(&self, h: &[f32]) -> Vec<f32> {
        (0..self.num_classes)
            .map(|k| {
                let row = &self.w2[k * self.feature_dim..(k + 1) * self.feature_dim];
                self.b2[k] + row.iter().zip(h).map(|(w, v)| w * v).sum::<f32>()
            })
            .collect()
    }
}

impl FeatureModel for MlpModel {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
        if mode == ModelMode::Eval {
            self.cache = None;
        }
    }

    fn forward(&self, inputs: &[&Image], output: ForwardOutput) -> Vec<Vec<f32>> {
        inputs
            .iter()
            .map(|img| {
                let h = self.hidden(&img.pixels);
                match output {
                    ForwardOutput::Features => h,
                    ForwardOutput::Scores => self.head(&h),
                }
            })
            .collect()
    }

    fn forward_train(&mut self, inputs: &[Image]) -> Vec<Vec<f32>> {
        let mut cache = ForwardCache::default();
        let mut logits = Vec::with_capacity(inputs.len());
        for img in inputs {
            let h = self.hidden(&img.pixels);
            logits.push(self.head(&h));
            cache.inputs.push(img.pixels.clone());
            cache.hidden.push(h);
        }
        self.cache = Some(cache);
        logits
    }

    fn backward(&mut self, grad_logits: &[Vec<f32>]) {
        let Some(cache) = self.cache.take() else {
            tracing::warn!("backward called without a cached forward pass");
            return;
        };
        let (d, f, k) = (self.input_dim, self.feature_dim, self.num_classes);

        for ((x, h), g) in cache.inputs.iter().zip(&cache.hidden).zip(grad_logits) {
            // Head: dW2 = g ⊗ h, db2 = g
            let mut dh = vec![0.0f32; f];
            for c in 0..k {
                let gc = g[c];
                if gc == 0.0 {
                    continue;
                }
                self.grad_b2[c] += gc;
                for i in 0..f {
                    self.grad_w2[c * f + i] += gc * h[i];
                    dh[i] += gc * self.w2[c * f + i];
                }
            }
            // ReLU gate, then first layer
            for i in 0..f {
                if h[i] <= 0.0 {
                    continue;
                }
                let gi = dh[i];
                self.grad_b1[i] += gi;
                for j in 0..d {
                    self.grad_w1[i * d + j] += gi * x[j];
                }
            }
        }
    }

    fn zero_grad(&mut self) {
        for g in [
            &mut self.grad_w1,
            &mut self.grad_b1,
            &mut self.grad_w2,
            &mut self.grad_b2,
        ] {
            g.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    fn visit_parameters(&mut self, visitor: &mut dyn FnMut(ParamSlot<'_>)) {
        visitor(ParamSlot {
            id: 0,
            values: &mut self.w1,
            grads: &self.grad_w1,
        });
        visitor(ParamSlot {
            id: 1,
            values: &mut self.b1,
            grads: &self.grad_b1,
        });
        visitor(ParamSlot {
            id: 2,
            values: &mut self.w2,
            grads: &self.grad_w2,
        });
        visitor(ParamSlot {
            id: 3,
            values: &mut self.b2,
            grads: &self.grad_b2,
        });
    }

    fn expand_head(&mut self, by: usize, rng: &mut StdRng) {
        let f = self.feature_dim;
        self.w2.extend(uniform_init(by * f, f, rng));
        self.b2.extend(std::iter::repeat(0.0).take(by));
        self.num_classes += by;
        self.grad_w2 = vec![0.0; self.num_classes * f];
        self.grad_b2 = vec![0.0; self.num_classes];
        self.cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn model() -> MlpModel {
        let mut rng = StdRng::seed_from_u64(3);
        MlpModel::new(4, 6, 2, &mut rng)
    }

    fn image(values: [f32; 4]) -> Image {
        Image::new(1, 2, 2, values.to_vec())
    }

    #[test]
    fn test_forward_shapes() {
        let m = model();
        let img = image([0.1, 0.2, 0.3, 0.4]);
        let feats = m.features(&[&img, &img]);
        assert_eq!(feats.len(), 2);
        assert_eq!(feats[0].len(), 6);
        assert!(feats[0].iter().all(|&v| v >= 0.0));
        let scores = m.scores(&[&img]);
        assert_eq!(scores[0].len(), 2);
    }

    #[test]
    fn test_expand_head_preserves_existing_rows() {
        let mut m = model();
        let img = image([0.5, -0.2, 0.9, 0.1]);
        let before = m.scores(&[&img])[0].clone();
        let old_w2 = m.w2.clone();

        let mut rng = StdRng::seed_from_u64(11);
        m.expand_head(3, &mut rng);

        assert_eq!(m.num_classes(), 5);
        assert_eq!(m.w2.len(), 5 * 6);
        assert_eq!(&m.w2[..old_w2.len()], old_w2.as_slice());
        let after = m.scores(&[&img])[0].clone();
        assert_eq!(&after[..2], before.as_slice());
        assert_eq!(m.features(&[&img])[0].len(), 6);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut m = model();
        let snapshot = m.clone();
        let mut rng = StdRng::seed_from_u64(1);
        m.expand_head(2, &mut rng);
        m.w1.iter_mut().for_each(|w| *w += 1.0);
        assert_eq!(snapshot.num_classes(), 2);
        assert_ne!(snapshot.w1, m.w1);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        // Loss = sum of logits of class 1 -> dL/dlogits = [0, 1]
        let mut m = model();
        let img = image([0.3, 0.8, -0.4, 0.6]);
        m.zero_grad();
        m.forward_train(std::slice::from_ref(&img));
        m.backward(&[vec![0.0, 1.0]]);

        let mut analytic = Vec::new();
        m.visit_parameters(&mut |slot| {
            if slot.id == 0 {
                analytic = slot.grads.to_vec();
            }
        });

        let eps = 1e-3f32;
        for idx in [0usize, 5, 13, 22] {
            let mut plus = m.clone();
            plus.w1[idx] += eps;
            let mut minus = m.clone();
            minus.w1[idx] -= eps;
            let lp = plus.scores(&[&img])[0][1];
            let lm = minus.scores(&[&img])[0][1];
            let numeric = (lp - lm) / (2.0 * eps);
            assert!(
                (numeric - analytic[idx]).abs() < 1e-2,
                "w1[{idx}]: numeric={numeric}, analytic={}",
                analytic[idx]
            );
        }
    }

    #[test]
    fn test_batched_forward_matches_single_pass() {
        let m = model();
        let imgs: Vec<Image> = (0..7).map(|i| image([i as f32 * 0.1, 0.2, -0.3, 0.4])).collect();
        let refs: Vec<&Image> = imgs.iter().collect();
        let whole = m.forward(&refs, ForwardOutput::Features);
        let chunked = batched_forward(&m, &refs, ForwardOutput::Features, 3);
        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_eval_mode_clears_cache() {
        let mut m = model();
        let img = image([0.1; 4]);
        m.forward_train(std::slice::from_ref(&img));
        m.set_mode(ModelMode::Eval);
        assert_eq!(m.mode(), ModelMode::Eval);
        m.zero_grad();
        // No cache -> backward leaves gradients untouched.
        m.backward(&[vec![1.0, 1.0]]);
        m.visit_parameters(&mut |slot| assert!(slot.grads.iter().all(|&g| g == 0.0)));
    }
}
