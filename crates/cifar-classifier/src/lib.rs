//! Convolutional image classifier for the CIFAR-10 dataset.
//!
//! The crate covers the whole workflow: acquiring the dataset, preprocessing,
//! on-the-fly augmentation, training with early stopping, evaluation with
//! per-class accuracy, and reporting of training curves and predictions.

pub mod augment;
pub mod batcher;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod history;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod report;
pub mod training;

pub use error::{ClassifierError, Result};
pub use pipeline::ImageClassifier;

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;
#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
