// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Error type shared by every stage of the incremental pipeline.
//!
//! All variants are fatal for the task that raised them. Nothing in the
//! engine retries: a diverged or mis-sequenced run is surfaced as-is.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IncrementalError {
    /// The per-class quota asks for more exemplars than the class pool holds.
    #[error("class {label}: quota of {requested} exemplars exceeds pool of {available} samples")]
    InsufficientSamples {
        label: usize,
        requested: usize,
        available: usize,
    },

    /// A teacher snapshot's head width does not cover its column slice.
    #[error("teacher {teacher}: expected {expected} output columns, found {found}")]
    HeadMismatch {
        teacher: usize,
        expected: usize,
        found: usize,
    },

    /// Batch iteration produced no mini-batch although at least one epoch is required.
    #[error("{pass}: pool of {pool_size} samples yields no mini-batch of size {batch_size}")]
    EmptyBatch {
        pass: &'static str,
        pool_size: usize,
        batch_size: usize,
    },

    /// Loss became NaN or infinite.
    #[error("{pass}: non-finite loss {loss} at epoch {epoch}")]
    NonFiniteLoss {
        pass: &'static str,
        epoch: usize,
        loss: f32,
    },

    /// A label falls outside the current head width.
    #[error("label {label} outside head of {n_classes} classes")]
    LabelOutOfRange { label: usize, n_classes: usize },

    /// A class that must be represented has no samples at all.
    #[error("class {label} has no samples to build a prototype from")]
    EmptyPool { label: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, IncrementalError>;
