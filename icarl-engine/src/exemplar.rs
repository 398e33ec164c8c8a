// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Exemplar memory: per-class selection and the budgeted store.
//!
//! Herding picks samples greedily so that the running mean of the selected
//! set tracks the class mean in feature space:
//!
//! ```text
//! w ← μ
//! repeat m times:
//!     k = argmax_j ⟨w, φ(x_j)⟩     over samples not yet selected
//!     w ← w + μ − φ(x_k)
//! ```
//!
//! The store keeps lists in selection order, so shrinking the budget is a
//! prefix truncation that drops the least important exemplars first.

use std::collections::BTreeMap;

use rand::rngs::StdRng;

use crate::config::SelectionStrategy;
use crate::data::{Image, Sample};
use crate::error::{IncrementalError, Result};
use crate::math::{argmax, dot, mean_rows};
use crate::model::{batched_forward, FeatureModel, ForwardOutput};

// ─── Selection ─────────────────────────────────────────

fn check_quota(label: usize, pool: &[Sample], m: usize) -> Result<()> {
    if m > pool.len() {
        return Err(IncrementalError::InsufficientSamples {
            label,
            requested: m,
            available: pool.len(),
        });
    }
    Ok(())
}

/// Herding selection over a class pool. The pool is consumed.
///
/// `model` must already be in evaluation mode. Deterministic for a fixed pool
/// order and model; ties go to the earliest remaining sample.
pub fn select_herding<M: FeatureModel>(
    label: usize,
    mut pool: Vec<Sample>,
    model: &M,
    m: usize,
    eval_batch_size: usize,
) -> Result<Vec<Sample>> {
    check_quota(label, &pool, m)?;
    if m == 0 {
        return Ok(Vec::new());
    }

    let images: Vec<&Image> = pool.iter().map(|s| &s.image).collect();
    let mut features = batched_forward(model, &images, ForwardOutput::Features, eval_batch_size);
    let mean = mean_rows(&features).ok_or(IncrementalError::EmptyPool { label })?;

    let mut w = mean.clone();
    let mut selected = Vec::with_capacity(m);
    let mut scores = Vec::with_capacity(pool.len());
    for _ in 0..m {
        scores.clear();
        scores.extend(features.iter().map(|f| dot(&w, f)));
        let k = argmax(&scores).unwrap_or(0);

        let chosen = features.remove(k);
        for ((wi, &mi), &fi) in w.iter_mut().zip(&mean).zip(&chosen) {
            *wi += mi - fi;
        }
        selected.push(pool.remove(k));
    }
    Ok(selected)
}

/// Uniform selection of `m` samples without replacement. The pool is consumed.
pub fn select_random(
    label: usize,
    pool: Vec<Sample>,
    m: usize,
    rng: &mut StdRng,
) -> Result<Vec<Sample>> {
    check_quota(label, &pool, m)?;
    let indices = rand::seq::index::sample(rng, pool.len(), m);
    let mut slots: Vec<Option<Sample>> = pool.into_iter().map(Some).collect();
    Ok(indices.iter().filter_map(|i| slots[i].take()).collect())
}

/// Dispatches to herding or random selection.
#[derive(Debug, Clone, Copy)]
pub struct ExemplarSelector {
    pub strategy: SelectionStrategy,
    pub eval_batch_size: usize,
}

impl ExemplarSelector {
    pub fn new(strategy: SelectionStrategy, eval_batch_size: usize) -> Self {
        Self {
            strategy,
            eval_batch_size,
        }
    }

    pub fn select<M: FeatureModel>(
        &self,
        label: usize,
        pool: Vec<Sample>,
        model: &M,
        m: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<Sample>> {
        match self.strategy {
            SelectionStrategy::Herding => {
                select_herding(label, pool, model, m, self.eval_batch_size)
            }
            SelectionStrategy::Random => select_random(label, pool, m, rng),
        }
    }

    /// Select `m` exemplars for every class in `pools`, in label order.
    pub fn select_all<M: FeatureModel>(
        &self,
        pools: BTreeMap<usize, Vec<Sample>>,
        model: &M,
        m: usize,
        rng: &mut StdRng,
    ) -> Result<BTreeMap<usize, Vec<Sample>>> {
        let mut out = BTreeMap::new();
        for (label, pool) in pools {
            let list = self.select(label, pool, model, m, rng)?;
            tracing::debug!(label, selected = list.len(), "exemplars selected");
            out.insert(label, list);
        }
        Ok(out)
    }
}

// ─── Store ─────────────────────────────────────────────

/// Label → exemplar list, iterated in ascending label order.
#[derive(Debug, Clone, Default)]
pub struct ExemplarStore {
    lists: BTreeMap<usize, Vec<Sample>>,
}

impl ExemplarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a label's list. Returns the previous list, if any.
    pub fn insert(&mut self, label: usize, list: Vec<Sample>) -> Option<Vec<Sample>> {
        let previous = self.lists.insert(label, list);
        if previous.is_some() {
            tracing::warn!(label, "exemplar list overwritten");
        }
        previous
    }

    /// Merge freshly selected lists.
    pub fn extend(&mut self, lists: BTreeMap<usize, Vec<Sample>>) {
        for (label, list) in lists {
            self.insert(label, list);
        }
    }

    /// Truncate every list to its first `quota` exemplars.
    pub fn reduce(&mut self, quota: usize) {
        for list in self.lists.values_mut() {
            list.truncate(quota);
        }
    }

    /// Label-major concatenation of all lists, in selection order.
    pub fn flatten(&self) -> Vec<Sample> {
        self.lists.values().flat_map(|l| l.iter().cloned()).collect()
    }

    pub fn get(&self, label: usize) -> Option<&[Sample]> {
        self.lists.get(&label).map(Vec::as_slice)
    }

    pub fn labels(&self) -> impl Iterator<Item = usize> + '_ {
        self.lists.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[Sample])> + '_ {
        self.lists.iter().map(|(&k, v)| (k, v.as_slice()))
    }

    pub fn num_classes(&self) -> usize {
        self.lists.len()
    }

    /// Total number of stored exemplars.
    pub fn len(&self) -> usize {
        self.lists.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}
