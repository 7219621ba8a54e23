use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::data::{CHANNELS, NUM_CLASSES};
use crate::preprocess::ImageItem;

/// Converts preprocessed items into backend tensors.
#[derive(Clone, Debug)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    height: usize,
    width: usize,
}

/// Batch of images and one-hot targets.
#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    /// Images as `[batch_size, 3, height, width]`.
    pub images: Tensor<B, 4>,
    /// One-hot targets as `[batch_size, 10]`.
    pub targets: Tensor<B, 2>,
}

impl<B: Backend> ImageBatcher<B> {
    /// Creates a batcher for images of the given dimensions.
    pub fn new(device: B::Device, height: usize, width: usize) -> Self {
        Self {
            device,
            height,
            width,
        }
    }
}

impl<B: Backend> Batcher<ImageItem, ClassificationBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ClassificationBatch<B> {
        let batch_size = items.len();

        let mut pixels = Vec::with_capacity(batch_size * self.height * self.width * CHANNELS);
        let mut labels = Vec::with_capacity(batch_size * NUM_CLASSES);
        for item in items {
            pixels.extend(item.image);
            labels.extend_from_slice(&item.label);
        }

        let images = TensorData::new(pixels, [batch_size, self.height, self.width, CHANNELS]);
        let images = Tensor::<B, 4>::from_data(images.convert::<B::FloatElem>(), &self.device)
            .swap_dims(3, 1) // [N, C, W, H]
            .swap_dims(2, 3); // [N, C, H, W]

        let targets = TensorData::new(labels, [batch_size, NUM_CLASSES]);
        let targets = Tensor::<B, 2>::from_data(targets.convert::<B::FloatElem>(), &self.device);

        ClassificationBatch { images, targets }
    }
}
