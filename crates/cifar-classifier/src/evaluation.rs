use core::fmt;

use burn::data::dataloader::DataLoaderBuilder;
use burn::prelude::*;

use crate::batcher::ImageBatcher;
use crate::data::{class_index, CLASS_NAMES, NUM_CLASSES};
use crate::error::{ClassifierError, Result};
use crate::model::Classifier;
use crate::preprocess::{argmax, ImageDataset};

/// Loss, accuracy and per-sample predictions of a model on a dataset.
#[derive(Clone, Debug)]
pub struct Measurement {
    /// Sample-weighted mean categorical cross-entropy.
    pub loss: f64,
    /// Fraction of correctly predicted samples.
    pub accuracy: f64,
    /// Predicted class index of every sample.
    pub predictions: Vec<usize>,
    /// Highest class probability of every sample.
    pub confidences: Vec<f32>,
    /// True class index of every sample.
    pub labels: Vec<usize>,
}

/// Runs the model over `dataset` in batches of `batch_size`, in dataset order.
pub fn measure<B: Backend>(
    model: &Classifier<B>,
    dataset: &ImageDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<Measurement> {
    if batch_size == 0 {
        return Err(ClassifierError::InvalidConfig(
            "batch_size must be at least 1".to_string(),
        ));
    }
    model.check_input(dataset)?;

    let batcher = ImageBatcher::<B>::new(device.clone(), dataset.height(), dataset.width());
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .build(dataset.clone());

    let num_items = dataset.items().len();
    let mut loss_sum = 0.0;
    let mut predictions = Vec::with_capacity(num_items);
    let mut confidences = Vec::with_capacity(num_items);

    for batch in dataloader.iter() {
        let batch_len = batch.targets.dims()[0];
        let output = model.forward_classification(batch);
        loss_sum += output.loss.into_scalar().elem::<f64>() * batch_len as f64;

        let probabilities = read_rows(output.probabilities)?;
        for row in probabilities.chunks_exact(NUM_CLASSES) {
            let predicted = argmax(row);
            predictions.push(predicted);
            confidences.push(row[predicted]);
        }
    }

    let labels = dataset.class_indices();
    let (loss, accuracy) = if num_items == 0 {
        (f64::NAN, f64::NAN)
    } else {
        (
            loss_sum / num_items as f64,
            correct_count(&predictions, &labels) as f64 / num_items as f64,
        )
    };

    Ok(Measurement {
        loss,
        accuracy,
        predictions,
        confidences,
        labels,
    })
}

pub(crate) fn read_rows<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| ClassifierError::Tensor(format!("{err:?}")))
}

fn correct_count(predictions: &[usize], labels: &[usize]) -> usize {
    predictions
        .iter()
        .zip(labels.iter())
        .filter(|(predicted, label)| predicted == label)
        .count()
}

/// Accuracy restricted to samples whose true label is one class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassAccuracy {
    /// Class index.
    pub class: usize,
    /// Class name.
    pub name: &'static str,
    /// Correctly predicted samples of the class.
    pub correct: usize,
    /// Samples whose true label is the class. Never zero.
    pub total: usize,
}

impl ClassAccuracy {
    pub fn accuracy(&self) -> f64 {
        self.correct as f64 / self.total as f64
    }
}

/// Result of evaluating a model on a held-out split.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationReport {
    /// Mean categorical cross-entropy.
    pub loss: f64,
    /// Mean of per-sample correctness, not the mean of per-class accuracies.
    pub accuracy: f64,
    /// Number of evaluated samples.
    pub num_samples: usize,
    /// Classes with at least one sample, in class index order.
    pub per_class: Vec<ClassAccuracy>,
    /// Classes without samples, whose accuracy is undefined.
    pub empty_classes: Vec<&'static str>,
}

impl EvaluationReport {
    /// Builds a report from predicted and true class indices.
    pub fn from_predictions(loss: f64, predictions: &[usize], labels: &[usize]) -> Result<Self> {
        if predictions.len() != labels.len() {
            return Err(ClassifierError::InvalidShape(format!(
                "{} predictions for {} labels",
                predictions.len(),
                labels.len()
            )));
        }
        if labels.is_empty() {
            return Err(ClassifierError::EmptySplit("evaluation"));
        }

        let mut correct = [0usize; NUM_CLASSES];
        let mut total = [0usize; NUM_CLASSES];
        for (&predicted, &label) in predictions.iter().zip(labels.iter()) {
            if label >= NUM_CLASSES {
                return Err(ClassifierError::InvalidLabel {
                    index: total.iter().sum(),
                    label,
                    max: NUM_CLASSES - 1,
                });
            }
            total[label] += 1;
            if predicted == label {
                correct[label] += 1;
            }
        }

        let mut per_class = Vec::new();
        let mut empty_classes = Vec::new();
        for (class, name) in CLASS_NAMES.iter().enumerate() {
            if total[class] == 0 {
                empty_classes.push(*name);
            } else {
                per_class.push(ClassAccuracy {
                    class,
                    name,
                    correct: correct[class],
                    total: total[class],
                });
            }
        }

        Ok(Self {
            loss,
            accuracy: correct_count(predictions, labels) as f64 / labels.len() as f64,
            num_samples: labels.len(),
            per_class,
            empty_classes,
        })
    }

    /// Accuracy of the named class.
    pub fn class_accuracy(&self, name: &str) -> Result<f64> {
        let class = class_index(name).ok_or_else(|| ClassifierError::UnknownClass(name.into()))?;

        match self.per_class.iter().find(|entry| entry.class == class) {
            Some(entry) => Ok(entry.accuracy()),
            None => Err(ClassifierError::EmptyClass(CLASS_NAMES[class])),
        }
    }

    /// `(name, accuracy)` for every represented class.
    pub fn per_class_accuracy(&self) -> Vec<(&'static str, f64)> {
        self.per_class
            .iter()
            .map(|entry| (entry.name, entry.accuracy()))
            .collect()
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Test loss: {:.4}", self.loss)?;
        writeln!(
            f,
            "Test accuracy: {:.4} ({} samples)",
            self.accuracy, self.num_samples
        )?;
        writeln!(f, "Per-class accuracy:")?;

        for (class, name) in CLASS_NAMES.iter().enumerate() {
            match self.per_class.iter().find(|entry| entry.class == class) {
                Some(entry) => writeln!(
                    f,
                    "  {name:<12} {:.4} ({}/{})",
                    entry.accuracy(),
                    entry.correct,
                    entry.total
                )?,
                None => writeln!(f, "  {name:<12} undefined (no samples)")?,
            }
        }

        Ok(())
    }
}

/// Prediction for one displayed sample.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplePrediction {
    /// Normalized channel-last pixels.
    pub image: Vec<f32>,
    /// Image height in pixels.
    pub height: usize,
    /// Image width in pixels.
    pub width: usize,
    /// Predicted class index.
    pub predicted: usize,
    /// True class index.
    pub actual: usize,
    /// Probability of the predicted class.
    pub confidence: f32,
}

impl SamplePrediction {
    pub fn is_correct(&self) -> bool {
        self.predicted == self.actual
    }

    /// Caption naming the predicted and true classes.
    pub fn caption(&self) -> String {
        format!(
            "Pred: {} / True: {}",
            CLASS_NAMES[self.predicted], CLASS_NAMES[self.actual]
        )
    }
}

/// Forward-only evaluation on a held-out split.
#[derive(Clone, Debug)]
pub struct Evaluator<B: Backend> {
    device: B::Device,
    batch_size: usize,
}

impl<B: Backend> Evaluator<B> {
    pub fn new(device: B::Device, batch_size: usize) -> Self {
        Self { device, batch_size }
    }

    /// Aggregate and per-class metrics of the model on `dataset`.
    pub fn evaluate(&self, model: &Classifier<B>, dataset: &ImageDataset) -> Result<EvaluationReport> {
        if dataset.items().is_empty() {
            return Err(ClassifierError::EmptySplit("test"));
        }

        let measurement = measure(model, dataset, self.batch_size, &self.device)?;
        let report = EvaluationReport::from_predictions(
            measurement.loss,
            &measurement.predictions,
            &measurement.labels,
        )?;

        log::info!(
            "Evaluated {} samples: loss {:.4}, accuracy {:.4}",
            report.num_samples,
            report.loss,
            report.accuracy
        );
        for name in report.empty_classes.iter() {
            log::warn!("Class `{name}` has no test samples, its accuracy is undefined");
        }

        Ok(report)
    }

    /// Arg-max class index of every sample.
    pub fn predict(&self, model: &Classifier<B>, dataset: &ImageDataset) -> Result<Vec<usize>> {
        Ok(measure(model, dataset, self.batch_size, &self.device)?.predictions)
    }

    /// Predictions for the first `count` samples.
    pub fn sample_predictions(
        &self,
        model: &Classifier<B>,
        dataset: &ImageDataset,
        count: usize,
    ) -> Result<Vec<SamplePrediction>> {
        let count = count.min(dataset.items().len());
        let items = dataset.items()[..count].to_vec();
        let head = ImageDataset::new(dataset.height(), dataset.width(), items)?;
        let measurement = measure(model, &head, self.batch_size, &self.device)?;

        let samples = head
            .items()
            .iter()
            .zip(measurement.predictions.iter())
            .zip(measurement.confidences.iter())
            .map(|((item, &predicted), &confidence)| SamplePrediction {
                image: item.image.clone(),
                height: head.height(),
                width: head.width(),
                predicted,
                actual: item.class_index(),
                confidence,
            })
            .collect();

        Ok(samples)
    }
}
