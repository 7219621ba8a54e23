//! Label-preserving random image transformations for the training split.
//!
//! Augmentation is recomputed for every batch of every epoch and never touches
//! validation or evaluation data.

use std::iter::Take;

use burn::config::Config;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::data::CHANNELS;
use crate::error::{self, ClassifierError};
use crate::preprocess::{ImageDataset, ImageItem};

const FLIP_PROBABILITY: f64 = 0.5;

/// Configuration to create an [augmentation policy](AugmentationPolicy).
#[derive(Config, Debug)]
pub struct AugmentationConfig {
    /// Maximum rotation in degrees, sampled in `[-range, range]`.
    #[config(default = 15.0)]
    pub rotation_range: f64,
    /// Maximum horizontal shift as a fraction of the width.
    #[config(default = 0.1)]
    pub width_shift_range: f64,
    /// Maximum vertical shift as a fraction of the height.
    #[config(default = 0.1)]
    pub height_shift_range: f64,
    /// Mirror images horizontally with probability 0.5.
    #[config(default = true)]
    pub horizontal_flip: bool,
}

impl AugmentationConfig {
    /// Policy that leaves every image untouched.
    pub fn identity() -> Self {
        Self::new()
            .with_rotation_range(0.0)
            .with_width_shift_range(0.0)
            .with_height_shift_range(0.0)
            .with_horizontal_flip(false)
    }

    /// Validates the ranges and creates the policy.
    pub fn init(&self) -> error::Result<AugmentationPolicy> {
        let ranges = [
            ("rotation_range", self.rotation_range, f64::INFINITY),
            ("width_shift_range", self.width_shift_range, 1.0),
            ("height_shift_range", self.height_shift_range, 1.0),
        ];
        for (name, value, bound) in ranges {
            if !value.is_finite() || value < 0.0 || value >= bound {
                return Err(ClassifierError::InvalidConfig(format!(
                    "{name} must be finite, non-negative and below {bound}, got {value}"
                )));
            }
        }

        Ok(AugmentationPolicy {
            rotation_range: self.rotation_range,
            width_shift_range: self.width_shift_range,
            height_shift_range: self.height_shift_range,
            horizontal_flip: self.horizontal_flip,
        })
    }
}

/// Random rotation, shift and mirror applied independently to each image.
#[derive(Clone, Debug)]
pub struct AugmentationPolicy {
    rotation_range: f64,
    width_shift_range: f64,
    height_shift_range: f64,
    horizontal_flip: bool,
}

/// Transformation parameters drawn for one image.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Transform {
    /// Rotation in degrees.
    pub rotation: f64,
    /// Vertical shift in pixels.
    pub shift_rows: f64,
    /// Horizontal shift in pixels.
    pub shift_cols: f64,
    /// Mirror along the vertical axis.
    pub flip: bool,
}

impl Transform {
    fn is_affine_identity(&self) -> bool {
        self.rotation == 0.0 && self.shift_rows == 0.0 && self.shift_cols == 0.0
    }
}

impl AugmentationPolicy {
    /// True when no image can ever be altered.
    pub fn is_identity(&self) -> bool {
        self.rotation_range == 0.0
            && self.width_shift_range == 0.0
            && self.height_shift_range == 0.0
            && !self.horizontal_flip
    }

    /// Draws the parameters for one image.
    pub fn sample_transform<R: Rng>(&self, height: usize, width: usize, rng: &mut R) -> Transform {
        Transform {
            rotation: symmetric(rng, self.rotation_range),
            shift_rows: symmetric(rng, self.height_shift_range) * height as f64,
            shift_cols: symmetric(rng, self.width_shift_range) * width as f64,
            flip: self.horizontal_flip && rng.gen_bool(FLIP_PROBABILITY),
        }
    }

    /// Returns an augmented copy of the item. The label is never altered.
    pub fn augment<R: Rng>(
        &self,
        item: &ImageItem,
        height: usize,
        width: usize,
        rng: &mut R,
    ) -> ImageItem {
        if self.is_identity() {
            return item.clone();
        }

        let transform = self.sample_transform(height, width, rng);
        ImageItem {
            image: apply_transform(&item.image, height, width, &transform),
            label: item.label,
        }
    }

    /// Lazy, infinite stream of augmented batches over `dataset`.
    ///
    /// Every epoch visits each sample exactly once in a freshly shuffled order.
    pub fn flow<'a>(
        &'a self,
        dataset: &'a ImageDataset,
        batch_size: usize,
        seed: u64,
    ) -> error::Result<AugmentedBatches<'a>> {
        if batch_size == 0 {
            return Err(ClassifierError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }

        let mut batches = AugmentedBatches {
            policy: self,
            dataset,
            batch_size,
            seed,
            rng: StdRng::seed_from_u64(seed),
            order: (0..dataset.items().len()).collect(),
            cursor: 0,
            epoch: 0,
        };
        batches.shuffle();

        Ok(batches)
    }
}

fn symmetric<R: Rng>(rng: &mut R, range: f64) -> f64 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

/// Applies the transform to a channel-last image.
///
/// Output pixels are mapped back through the inverse rotation around the image
/// centre and sampled bilinearly; coordinates outside the image take the value
/// of the nearest edge pixel.
pub fn apply_transform(image: &[f32], height: usize, width: usize, transform: &Transform) -> Vec<f32> {
    let mut output = if transform.is_affine_identity() {
        image.to_vec()
    } else {
        let (sin, cos) = transform.rotation.to_radians().sin_cos();
        let center_row = (height as f64 - 1.0) / 2.0;
        let center_col = (width as f64 - 1.0) / 2.0;

        let mut output = vec![0.0; image.len()];
        for row in 0..height {
            for col in 0..width {
                let dr = row as f64 - center_row + transform.shift_rows;
                let dc = col as f64 - center_col + transform.shift_cols;
                let src_row = center_row + cos * dr - sin * dc;
                let src_col = center_col + sin * dr + cos * dc;

                let offset = (row * width + col) * CHANNELS;
                for channel in 0..CHANNELS {
                    output[offset + channel] =
                        sample_bilinear(image, height, width, channel, src_row, src_col);
                }
            }
        }
        output
    };

    if transform.flip {
        for row in output.chunks_exact_mut(width * CHANNELS) {
            for col in 0..width / 2 {
                let mirror = width - 1 - col;
                for channel in 0..CHANNELS {
                    row.swap(col * CHANNELS + channel, mirror * CHANNELS + channel);
                }
            }
        }
    }

    output
}

fn sample_bilinear(
    image: &[f32],
    height: usize,
    width: usize,
    channel: usize,
    row: f64,
    col: f64,
) -> f32 {
    let row = row.clamp(0.0, (height - 1) as f64);
    let col = col.clamp(0.0, (width - 1) as f64);
    let row0 = row.floor() as usize;
    let col0 = col.floor() as usize;
    let row1 = (row0 + 1).min(height - 1);
    let col1 = (col0 + 1).min(width - 1);
    let dr = (row - row0 as f64) as f32;
    let dc = (col - col0 as f64) as f32;

    let at = |r: usize, c: usize| image[(r * width + c) * CHANNELS + channel];

    let top = at(row0, col0) * (1.0 - dc) + at(row0, col1) * dc;
    let bottom = at(row1, col0) * (1.0 - dc) + at(row1, col1) * dc;
    top * (1.0 - dr) + bottom * dr
}

/// Augmented training samples of one batch.
#[derive(Clone, Debug)]
pub struct AugmentedBatch {
    /// Zero-based epoch the batch belongs to.
    pub epoch: usize,
    /// Augmented items.
    pub items: Vec<ImageItem>,
}

/// Infinite iterator of augmented batches cycling through the training set.
pub struct AugmentedBatches<'a> {
    policy: &'a AugmentationPolicy,
    dataset: &'a ImageDataset,
    batch_size: usize,
    seed: u64,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
}

impl AugmentedBatches<'_> {
    /// Number of batches needed to visit every sample once, the last one
    /// possibly smaller than the batch size.
    pub fn batches_per_epoch(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Batches of the next epoch.
    pub fn epoch(&mut self) -> Take<&mut Self> {
        let num_batches = self.batches_per_epoch();
        self.take(num_batches)
    }

    /// Returns the stream to its initial seeded state.
    pub fn restart(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.order = (0..self.dataset.items().len()).collect();
        self.cursor = 0;
        self.epoch = 0;
        self.shuffle();
    }

    fn shuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
    }
}

impl Iterator for AugmentedBatches<'_> {
    type Item = AugmentedBatch;

    fn next(&mut self) -> Option<AugmentedBatch> {
        if self.order.is_empty() {
            return None;
        }

        if self.cursor == self.order.len() {
            self.cursor = 0;
            self.epoch += 1;
            self.shuffle();
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let (height, width) = (self.dataset.height(), self.dataset.width());
        let items = self.order[self.cursor..end]
            .iter()
            .map(|&index| {
                self.policy
                    .augment(&self.dataset.items()[index], height, width, &mut self.rng)
            })
            .collect();
        self.cursor = end;

        Some(AugmentedBatch {
            epoch: self.epoch,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::one_hot;
    use std::collections::HashMap;

    const SIZE: usize = 4;

    /// Dataset where every pixel of image `i` holds `i / 100`.
    fn constant_dataset(len: usize) -> ImageDataset {
        let items = (0..len)
            .map(|i| ImageItem {
                image: vec![i as f32 / 100.0; SIZE * SIZE * CHANNELS],
                label: one_hot(i % 10).unwrap(),
            })
            .collect();
        ImageDataset::new(SIZE, SIZE, items).unwrap()
    }

    fn gradient_image() -> Vec<f32> {
        (0..SIZE * SIZE * CHANNELS)
            .map(|i| i as f32 / (SIZE * SIZE * CHANNELS) as f32)
            .collect()
    }

    fn image_id(item: &ImageItem) -> usize {
        (item.image[0] * 100.0).round() as usize
    }

    #[test]
    fn identity_policy_leaves_pixels_untouched() {
        let policy = AugmentationConfig::identity().init().unwrap();
        let item = ImageItem {
            image: gradient_image(),
            label: one_hot(3).unwrap(),
        };
        let mut rng = StdRng::seed_from_u64(0);

        let augmented = policy.augment(&item, SIZE, SIZE, &mut rng);

        assert!(policy.is_identity());
        assert_eq!(augmented, item);
    }

    #[test]
    fn zero_affine_transform_is_exact() {
        let image = gradient_image();

        let output = apply_transform(&image, SIZE, SIZE, &Transform::default());

        assert_eq!(output, image);
    }

    #[test]
    fn flip_mirrors_columns() {
        let image = gradient_image();
        let transform = Transform {
            flip: true,
            ..Default::default()
        };

        let output = apply_transform(&image, SIZE, SIZE, &transform);

        for row in 0..SIZE {
            for col in 0..SIZE {
                for channel in 0..CHANNELS {
                    let mirrored = (row * SIZE + (SIZE - 1 - col)) * CHANNELS + channel;
                    assert_eq!(output[(row * SIZE + col) * CHANNELS + channel], image[mirrored]);
                }
            }
        }
    }

    #[test]
    fn integer_shift_moves_content_and_repeats_edges() {
        let image = gradient_image();
        let transform = Transform {
            shift_cols: 1.0,
            ..Default::default()
        };

        let output = apply_transform(&image, SIZE, SIZE, &transform);

        for row in 0..SIZE {
            for col in 0..SIZE {
                let src_col = (col + 1).min(SIZE - 1);
                let expected = image[(row * SIZE + src_col) * CHANNELS];
                let found = output[(row * SIZE + col) * CHANNELS];
                assert!((expected - found).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn random_transforms_keep_labels_and_range() {
        let policy = AugmentationConfig::new().init().unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        for label in 0..10 {
            let item = ImageItem {
                image: gradient_image(),
                label: one_hot(label).unwrap(),
            };
            let augmented = policy.augment(&item, SIZE, SIZE, &mut rng);

            assert_eq!(augmented.label, item.label);
            assert_eq!(augmented.image.len(), item.image.len());
            assert!(augmented.image.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn sampled_parameters_stay_within_ranges() {
        let policy = AugmentationConfig::new().init().unwrap();
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..200 {
            let transform = policy.sample_transform(32, 32, &mut rng);

            assert!(transform.rotation.abs() <= 15.0);
            assert!(transform.shift_rows.abs() <= 3.2 + 1e-9);
            assert!(transform.shift_cols.abs() <= 3.2 + 1e-9);
        }
    }

    #[test]
    fn constant_image_is_invariant_to_rotation_and_shift() {
        let policy = AugmentationConfig::new().with_horizontal_flip(false).init().unwrap();
        let dataset = constant_dataset(6);
        let mut rng = StdRng::seed_from_u64(3);

        let augmented = policy.augment(&dataset.items()[5], SIZE, SIZE, &mut rng);

        assert!(augmented.image.iter().all(|v| (v - 0.05).abs() < 1e-6));
    }

    #[test]
    fn every_epoch_covers_the_training_set_once() {
        let policy = AugmentationConfig::identity().init().unwrap();
        let dataset = constant_dataset(10);
        let mut batches = policy.flow(&dataset, 4, 42).unwrap();

        assert_eq!(batches.batches_per_epoch(), 3);

        let mut orders = Vec::new();
        for epoch in 0..3 {
            let epoch_batches = batches.epoch().collect::<Vec<_>>();
            let sizes = epoch_batches.iter().map(|b| b.items.len()).collect::<Vec<_>>();
            assert_eq!(sizes, vec![4, 4, 2]);
            assert!(epoch_batches.iter().all(|b| b.epoch == epoch));

            let ids = epoch_batches
                .iter()
                .flat_map(|batch| batch.items.iter().map(image_id))
                .collect::<Vec<_>>();
            let mut counts = HashMap::new();
            for id in ids.iter() {
                *counts.entry(*id).or_insert(0) += 1;
            }
            assert_eq!(counts.len(), 10);
            assert!(counts.values().all(|&count| count == 1));
            orders.push(ids);
        }

        assert!(orders[0] != orders[1] || orders[1] != orders[2]);
    }

    #[test]
    fn labels_follow_their_images() {
        let policy = AugmentationConfig::new().init().unwrap();
        let dataset = constant_dataset(10);
        let mut batches = policy.flow(&dataset, 3, 1).unwrap();

        for batch in batches.epoch() {
            for item in batch.items {
                let original = &dataset.items()[item.class_index()];
                assert_eq!(item.label, original.label);
            }
        }
    }

    #[test]
    fn restart_replays_the_same_sequence() {
        let policy = AugmentationConfig::new().init().unwrap();
        let dataset = constant_dataset(6);
        let mut batches = policy.flow(&dataset, 4, 5).unwrap();

        let first = batches.epoch().map(|b| b.items).collect::<Vec<_>>();
        let _second = batches.epoch().count();
        batches.restart();
        let replay = batches.epoch().map(|b| b.items).collect::<Vec<_>>();

        assert_eq!(first, replay);
    }

    #[test]
    fn stream_is_infinite() {
        let policy = AugmentationConfig::identity().init().unwrap();
        let dataset = constant_dataset(3);
        let batches = policy.flow(&dataset, 2, 0).unwrap();

        let last = batches.take(100).last().unwrap();

        assert_eq!(last.epoch, 49);
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        assert!(AugmentationConfig::new().with_rotation_range(-1.0).init().is_err());
        assert!(AugmentationConfig::new().with_width_shift_range(1.0).init().is_err());
        assert!(AugmentationConfig::new()
            .with_height_shift_range(f64::NAN)
            .init()
            .is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let policy = AugmentationConfig::identity().init().unwrap();
        let dataset = constant_dataset(3);

        assert!(policy.flow(&dataset, 0, 0).is_err());
    }
}
