// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Icarus-Proprietary
// See LICENSE in the repository root for full license terms.

//! Samples, augmentation and mini-batch iteration.
//!
//! Images are stored channel-major (`C × H × W`, row-major within a channel).
//! Batch order is driven entirely by the caller's `StdRng`, so an epoch is
//! reproducible from the run seed.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{IncrementalError, Result};

// ─── Image ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    /// Pixel values, `pixels[(c * height + y) * width + x]`.
    pub pixels: Vec<f32>,
}

impl Image {
    pub fn new(channels: usize, height: usize, width: usize, pixels: Vec<f32>) -> Self {
        assert_eq!(
            pixels.len(),
            channels * height * width,
            "pixel buffer does not match {channels}x{height}x{width}"
        );
        Self {
            channels,
            height,
            width,
            pixels,
        }
    }

    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self::new(channels, height, width, vec![0.0; channels * height * width])
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    #[inline]
    fn idx(&self, c: usize, y: usize, x: usize) -> usize {
        (c * self.height + y) * self.width + x
    }

    /// Mirror along the width axis.
    pub fn flip_horizontal(&self) -> Self {
        let mut out = self.clone();
        for c in 0..self.channels {
            for y in 0..self.height {
                for x in 0..self.width {
                    out.pixels[self.idx(c, y, x)] = self.pixels[self.idx(c, y, self.width - 1 - x)];
                }
            }
        }
        out
    }

    /// Zero-pad by `pad` on every side, then cut a window of the original size
    /// whose top-left corner sits at `(top, left)` in padded coordinates.
    pub fn padded_crop(&self, pad: usize, top: usize, left: usize) -> Self {
        let mut out = Self::zeros(self.channels, self.height, self.width);
        for c in 0..self.channels {
            for y in 0..self.height {
                let sy = (y + top) as isize - pad as isize;
                if sy < 0 || sy >= self.height as isize {
                    continue;
                }
                for x in 0..self.width {
                    let sx = (x + left) as isize - pad as isize;
                    if sx < 0 || sx >= self.width as isize {
                        continue;
                    }
                    let o = out.idx(c, y, x);
                    out.pixels[o] = self.pixels[self.idx(c, sy as usize, sx as usize)];
                }
            }
        }
        out
    }
}

// ─── Sample ────────────────────────────────────────────

/// An (image, label) pair. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: Image,
    pub label: usize,
}

impl Sample {
    pub fn new(image: Image, label: usize) -> Self {
        Self { image, label }
    }
}

/// Group samples by label, preserving their relative order within each class.
pub fn group_by_class(samples: &[Sample]) -> BTreeMap<usize, Vec<Sample>> {
    let mut map: BTreeMap<usize, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        map.entry(sample.label).or_default().push(sample.clone());
    }
    map
}

/// One-hot rows sized to the current head width.
pub fn one_hot(labels: &[usize], n_classes: usize) -> Result<Vec<Vec<f32>>> {
    labels
        .iter()
        .map(|&label| {
            if label >= n_classes {
                return Err(IncrementalError::LabelOutOfRange { label, n_classes });
            }
            let mut row = vec![0.0f32; n_classes];
            row[label] = 1.0;
            Ok(row)
        })
        .collect()
}

// ─── Augmentation ──────────────────────────────────────

/// Per-sample transform applied to training images.
pub trait Augmentation: Send + Sync {
    fn apply(&self, image: &Image, rng: &mut StdRng) -> Image;

    fn name(&self) -> &str;
}

/// Identity transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAugmentation;

impl Augmentation for NoAugmentation {
    fn apply(&self, image: &Image, _rng: &mut StdRng) -> Image {
        image.clone()
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Zero-padded random crop followed by a random horizontal flip.
#[derive(Debug, Clone, Copy)]
pub struct PadCropFlip {
    pub pad: usize,
    /// Probability of mirroring the crop.
    pub flip_prob: f64,
}

impl Default for PadCropFlip {
    fn default() -> Self {
        Self {
            pad: 4,
            flip_prob: 0.5,
        }
    }
}

impl Augmentation for PadCropFlip {
    fn apply(&self, image: &Image, rng: &mut StdRng) -> Image {
        let top = rng.gen_range(0..=2 * self.pad);
        let left = rng.gen_range(0..=2 * self.pad);
        let cropped = image.padded_crop(self.pad, top, left);
        if rng.gen_bool(self.flip_prob) {
            cropped.flip_horizontal()
        } else {
            cropped
        }
    }

    fn name(&self) -> &str {
        "pad-crop-flip"
    }
}

// ─── Batch Loader ──────────────────────────────────────

/// Mini-batch iteration over a sample pool.
#[derive(Debug, Clone, Copy)]
pub struct BatchLoader {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
}

impl BatchLoader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Number of batches one pass over `pool_size` samples produces.
    pub fn num_batches(&self, pool_size: usize) -> usize {
        if self.batch_size == 0 {
            return 0;
        }
        if self.drop_last {
            pool_size / self.batch_size
        } else {
            pool_size.div_ceil(self.batch_size)
        }
    }

    /// Split `pool` into batches for one epoch. `rng` is only consumed when shuffling.
    pub fn batches<'a>(&self, pool: &'a [Sample], rng: &mut StdRng) -> Vec<Vec<&'a Sample>> {
        let mut order: Vec<usize> = (0..pool.len()).collect();
        if self.shuffle {
            order.shuffle(rng);
        }
        let n = self.num_batches(pool.len());
        order
            .chunks(self.batch_size.max(1))
            .take(n)
            .map(|chunk| chunk.iter().map(|&i| &pool[i]).collect())
            .collect()
    }
}
