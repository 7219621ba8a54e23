use std::sync::Arc;

use burn::data::dataset::Dataset;

use crate::data::{RawSplit, CHANNELS, NUM_CLASSES};
use crate::error::{ClassifierError, Result};

/// One-hot encoded class label.
pub type LabelVector = [f32; NUM_CLASSES];

/// Normalized labeled image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageItem {
    /// Pixels in `[0, 1]`, `height x width x 3` row-major channel-last order.
    pub image: Vec<f32>,
    /// One-hot label.
    pub label: LabelVector,
}

impl ImageItem {
    /// Class index encoded by the one-hot label.
    pub fn class_index(&self) -> usize {
        decode_one_hot(&self.label)
    }
}

/// Preprocessed split: images sharing the same dimensions and their labels.
///
/// Cloning shares the samples, so a dataset can be handed to a data loader.
#[derive(Clone, Debug, Default)]
pub struct ImageDataset {
    height: usize,
    width: usize,
    items: Arc<Vec<ImageItem>>,
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

impl ImageDataset {
    /// Creates a dataset, checking that every image has `height * width * 3` values.
    pub fn new(height: usize, width: usize, items: Vec<ImageItem>) -> Result<Self> {
        let expected = height * width * CHANNELS;
        if let Some((index, item)) = items
            .iter()
            .enumerate()
            .find(|(_, item)| item.image.len() != expected)
        {
            return Err(ClassifierError::InvalidShape(format!(
                "image {index} holds {} values, expected {height}x{width}x{CHANNELS} = {expected}",
                item.image.len()
            )));
        }

        Ok(Self {
            height,
            width,
            items: Arc::new(items),
        })
    }

    /// Image height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Image width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Samples in their original order.
    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    /// Class index of every sample.
    pub fn class_indices(&self) -> Vec<usize> {
        self.items.iter().map(ImageItem::class_index).collect()
    }

    /// Number of samples per class.
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0; NUM_CLASSES];
        for item in self.items.iter() {
            counts[item.class_index()] += 1;
        }
        counts
    }
}

/// Normalizes pixel intensities and one-hot encodes labels.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    height: usize,
    width: usize,
}

impl Preprocessor {
    /// Creates a preprocessor expecting images of the given dimensions.
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Converts a raw split, preserving sample order and count.
    pub fn process(&self, split: &RawSplit) -> Result<ImageDataset> {
        if split.height != self.height || split.width != self.width {
            return Err(ClassifierError::InvalidShape(format!(
                "expected {}x{}x{CHANNELS} images, the split holds {}x{}x{CHANNELS} images",
                self.height, self.width, split.height, split.width
            )));
        }

        let expected = self.height * self.width * CHANNELS;
        let items = split
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                if item.image.len() != expected {
                    return Err(ClassifierError::InvalidShape(format!(
                        "image {index} holds {} values, expected {expected}",
                        item.image.len()
                    )));
                }

                let label = one_hot(item.label).map_err(|_| ClassifierError::InvalidLabel {
                    index,
                    label: item.label,
                    max: NUM_CLASSES - 1,
                })?;

                Ok(ImageItem {
                    image: normalize(&item.image),
                    label,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        ImageDataset::new(self.height, self.width, items)
    }
}

/// Maps pixel intensities from `[0, 255]` to `[0, 1]`.
pub fn normalize(pixels: &[u8]) -> Vec<f32> {
    pixels.iter().map(|&pixel| pixel as f32 / 255.0).collect()
}

/// Encodes a class index as a one-hot vector.
pub fn one_hot(label: usize) -> Result<LabelVector> {
    if label >= NUM_CLASSES {
        return Err(ClassifierError::InvalidLabel {
            index: 0,
            label,
            max: NUM_CLASSES - 1,
        });
    }

    let mut vector = [0.0; NUM_CLASSES];
    vector[label] = 1.0;
    Ok(vector)
}

/// Recovers the class index of a one-hot (or probability) vector.
pub fn decode_one_hot(vector: &[f32]) -> usize {
    argmax(vector)
}

/// Index of the largest value, the first one on ties.
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (index, &value)| {
            if value > max {
                (index, value)
            } else {
                (best, max)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RawImageItem;

    fn split(labels: &[usize]) -> RawSplit {
        let items = labels
            .iter()
            .enumerate()
            .map(|(index, &label)| RawImageItem {
                image: vec![index as u8 * 10; 2 * 2 * CHANNELS],
                label,
            })
            .collect();
        RawSplit::new(2, 2, items)
    }

    #[test]
    fn normalized_values_round_trip() {
        let pixels: Vec<u8> = (0..=255).collect();

        let normalized = normalize(&pixels);

        for (original, value) in pixels.iter().zip(normalized.iter()) {
            assert!((0.0..=1.0).contains(value));
            assert!((value * 255.0 - *original as f32).abs() < 1e-3);
        }
    }

    #[test]
    fn one_hot_has_single_one_and_decodes_back() {
        for label in 0..NUM_CLASSES {
            let vector = one_hot(label).unwrap();

            assert_eq!(vector.iter().filter(|&&v| v == 1.0).count(), 1);
            assert_eq!(vector.iter().filter(|&&v| v == 0.0).count(), NUM_CLASSES - 1);
            assert_eq!(vector[label], 1.0);
            assert_eq!(decode_one_hot(&vector), label);
        }
    }

    #[test]
    fn process_preserves_order_and_count() {
        let raw = split(&[4, 0, 9]);

        let dataset = Preprocessor::new(2, 2).process(&raw).unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.class_indices(), vec![4, 0, 9]);
        assert_eq!(dataset.items()[1].image[0], 10.0 / 255.0);
        assert_eq!(dataset.class_counts()[4], 1);
    }

    #[test]
    fn label_out_of_range_is_rejected() {
        let raw = split(&[1, 10]);

        let result = Preprocessor::new(2, 2).process(&raw);

        match result {
            Err(ClassifierError::InvalidLabel { index, label, max }) => {
                assert_eq!((index, label, max), (1, 10, 9));
            }
            other => panic!("expected an invalid label error, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let raw = split(&[1]);

        let result = Preprocessor::new(32, 32).process(&raw);

        assert!(matches!(result, Err(ClassifierError::InvalidShape(_))));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut raw = split(&[1, 2]);
        raw.items[1].image.pop();

        let result = Preprocessor::new(2, 2).process(&raw);

        assert!(matches!(result, Err(ClassifierError::InvalidShape(_))));
    }

    #[test]
    fn argmax_returns_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[0.9]), 0);
    }
}
