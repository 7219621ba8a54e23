use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::augment::{AugmentationConfig, AugmentationPolicy};
use crate::batcher::ImageBatcher;
use crate::data::NUM_CLASSES;
use crate::error::{self, ClassifierError};
use crate::evaluation::{measure, read_rows};
use crate::history::{EpochRecord, TrainingHistory};
use crate::model::{Classifier, ClassifierConfig, ClassifierRecord};
use crate::preprocess::{argmax, ImageDataset, ImageItem};

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = "ClassifierConfig::new()")]
    pub model: ClassifierConfig,
    #[config(default = "AdamConfig::new().with_epsilon(1e-7)")]
    pub optimizer: AdamConfig,
    #[config(default = "AugmentationConfig::new()")]
    pub augmentation: AugmentationConfig,

    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// Epochs without validation loss improvement before training halts.
    #[config(default = 5)]
    pub patience: usize,
    #[config(default = 42)]
    pub seed: u64,
}

/// Whether training should go on after an epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoppingDecision {
    Continue,
    Stop,
}

/// Lowest validation loss seen so far and the parameters that produced it.
#[derive(Clone, Debug)]
pub struct BestCheckpoint<S> {
    pub epoch: usize,
    pub loss: f64,
    pub snapshot: S,
}

/// Stops training once the validation loss has not improved for `patience`
/// consecutive epochs, keeping a snapshot of the best epoch.
///
/// Only a strictly lower loss counts as an improvement and `NaN` never does.
#[derive(Clone, Debug)]
pub struct EarlyStopping<S> {
    patience: usize,
    best: Option<BestCheckpoint<S>>,
    epochs_without_improvement: usize,
}

impl<S> EarlyStopping<S> {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            epochs_without_improvement: 0,
        }
    }

    /// Records the validation loss of `epoch`. The snapshot is only taken when
    /// the loss improves.
    pub fn observe<F>(&mut self, epoch: usize, loss: f64, snapshot: F) -> StoppingDecision
    where
        F: FnOnce() -> S,
    {
        let improved = !loss.is_nan()
            && self.best.as_ref().map_or(true, |best| loss < best.loss);

        if improved {
            self.best = Some(BestCheckpoint {
                epoch,
                loss,
                snapshot: snapshot(),
            });
            self.epochs_without_improvement = 0;
            return StoppingDecision::Continue;
        }

        self.epochs_without_improvement += 1;
        if self.epochs_without_improvement >= self.patience {
            StoppingDecision::Stop
        } else {
            StoppingDecision::Continue
        }
    }

    pub fn best(&self) -> Option<&BestCheckpoint<S>> {
        self.best.as_ref()
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.epochs_without_improvement
    }

    pub fn into_best(self) -> Option<BestCheckpoint<S>> {
        self.best
    }
}

/// Trains a classifier with augmented mini-batches and early stopping on the
/// validation loss.
pub struct Trainer<B: AutodiffBackend, O> {
    model: Classifier<B>,
    optim: O,
    augmentation: AugmentationPolicy,
    learning_rate: f64,
    patience: usize,
    seed: u64,
    device: B::Device,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Classifier<B>, B>,
{
    pub fn new(
        model: Classifier<B>,
        optim: O,
        config: &TrainingConfig,
        device: B::Device,
    ) -> error::Result<Self> {
        if config.learning_rate.is_nan() || config.learning_rate <= 0.0 {
            return Err(ClassifierError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                config.learning_rate
            )));
        }

        Ok(Self {
            model,
            optim,
            augmentation: config.augmentation.init()?,
            learning_rate: config.learning_rate,
            patience: config.patience,
            seed: config.seed,
            device,
        })
    }

    /// Runs up to `max_epochs` epochs and leaves the model with the parameters
    /// of the epoch with the lowest validation loss.
    pub fn train(
        &mut self,
        train: &ImageDataset,
        valid: &ImageDataset,
        max_epochs: usize,
        batch_size: usize,
    ) -> error::Result<TrainingHistory> {
        if train.items().is_empty() {
            return Err(ClassifierError::EmptySplit("training"));
        }
        if valid.items().is_empty() {
            return Err(ClassifierError::EmptySplit("validation"));
        }
        if batch_size == 0 {
            return Err(ClassifierError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        self.model.check_input(train)?;
        self.model.check_input(valid)?;

        let batcher = ImageBatcher::<B>::new(self.device.clone(), train.height(), train.width());
        let mut batches = self.augmentation.flow(train, batch_size, self.seed)?;
        let mut stopping = EarlyStopping::<ClassifierRecord<B>>::new(self.patience);
        let mut history = TrainingHistory::default();
        let mut model = self.model.clone();

        log::info!(
            "Training on {} samples, validating on {} samples, {} batches per epoch",
            train.items().len(),
            valid.items().len(),
            batches.batches_per_epoch()
        );

        for epoch in 1..max_epochs + 1 {
            let mut loss_sum = 0.0;
            let mut correct = 0;
            let mut seen = 0;

            for batch in batches.epoch() {
                let labels: Vec<usize> = batch.items.iter().map(ImageItem::class_index).collect();
                let output = model.forward_classification(batcher.batch(batch.items));
                loss_sum += output.loss.clone().into_scalar().elem::<f64>() * labels.len() as f64;
                correct += count_correct(output.probabilities, &labels)?;
                seen += labels.len();

                // Gradients for the current backward pass
                let grads = output.loss.backward();
                // Gradients linked to each parameter of the model
                let grads = GradientsParams::from_grads(grads, &model);
                model = self.optim.step(self.learning_rate, model, grads);
            }

            let validation = measure(&model.valid(), valid, batch_size, &self.device)?;
            let record = EpochRecord {
                epoch,
                train_loss: loss_sum / seen as f64,
                train_accuracy: correct as f64 / seen as f64,
                val_loss: validation.loss,
                val_accuracy: validation.accuracy,
            };
            history.push(record);

            log::info!(
                "Epoch {epoch}/{max_epochs} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
                record.train_loss,
                record.train_accuracy,
                record.val_loss,
                record.val_accuracy
            );

            let decision = stopping.observe(epoch, record.val_loss, || model.clone().into_record());
            if decision == StoppingDecision::Stop {
                log::info!(
                    "Early stopping at epoch {epoch}: no val_loss improvement in {} epochs",
                    self.patience
                );
                history.stopped_early = Some(epoch);
                break;
            }
        }

        if let Some(best) = stopping.into_best() {
            log::info!(
                "Restoring model weights from epoch {} (val_loss {:.4})",
                best.epoch,
                best.loss
            );
            model = model.load_record(best.snapshot);
            history.best_epoch = Some(best.epoch);
        }
        self.model = model;

        Ok(history)
    }

    pub fn model(&self) -> &Classifier<B> {
        &self.model
    }

    pub fn into_model(self) -> Classifier<B> {
        self.model
    }
}

fn count_correct<B: Backend>(
    probabilities: Tensor<B, 2>,
    labels: &[usize],
) -> error::Result<usize> {
    let rows = read_rows(probabilities)?;
    let correct = rows
        .chunks_exact(NUM_CLASSES)
        .zip(labels.iter())
        .filter(|(row, label)| argmax(row) == **label)
        .count();
    Ok(correct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::one_hot;
    use crate::{TestAutodiffBackend, TestBackend};

    #[test]
    fn stops_after_patience_and_keeps_best_epoch() {
        let mut stopping = EarlyStopping::new(5);
        let losses = [3.0, 2.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.5];

        let mut stopped_at = None;
        for (index, loss) in losses.iter().enumerate() {
            let epoch = index + 1;
            if stopping.observe(epoch, *loss, || epoch) == StoppingDecision::Stop {
                stopped_at = Some(epoch);
                break;
            }
        }

        assert_eq!(stopped_at, Some(8));
        let best = stopping.into_best().unwrap();
        assert_eq!(best.epoch, 3);
        assert_eq!(best.snapshot, 3);
        assert_eq!(best.loss, 1.0);
    }

    #[test]
    fn nan_never_improves() {
        let mut stopping = EarlyStopping::new(2);

        assert_eq!(stopping.observe(1, f64::NAN, || 1), StoppingDecision::Continue);
        assert!(stopping.best().is_none());
        assert_eq!(stopping.observe(2, 0.5, || 2), StoppingDecision::Continue);
        assert_eq!(stopping.observe(3, f64::NAN, || 3), StoppingDecision::Continue);
        assert_eq!(stopping.observe(4, f64::NAN, || 4), StoppingDecision::Stop);
        assert_eq!(stopping.best().unwrap().epoch, 2);
    }

    #[test]
    fn improvement_resets_the_counter() {
        let mut stopping = EarlyStopping::new(3);

        stopping.observe(1, 1.0, || ());
        stopping.observe(2, 1.0, || ());
        stopping.observe(3, 1.5, || ());
        assert_eq!(stopping.epochs_without_improvement(), 2);

        stopping.observe(4, 0.9, || ());
        assert_eq!(stopping.epochs_without_improvement(), 0);
        assert_eq!(stopping.best().unwrap().epoch, 4);
    }

    fn dataset(labels: &[usize]) -> ImageDataset {
        let items = labels
            .iter()
            .map(|&label| ImageItem {
                image: vec![label as f32 / 10.0; 8 * 8 * 3],
                label: one_hot(label).unwrap(),
            })
            .collect();
        ImageDataset::new(8, 8, items).unwrap()
    }

    fn config() -> TrainingConfig {
        TrainingConfig::new()
            .with_model(
                ClassifierConfig::new()
                    .with_height(8)
                    .with_width(8)
                    .with_hidden_size(16),
            )
            .with_augmentation(AugmentationConfig::identity())
    }

    fn trainer(
        config: &TrainingConfig,
    ) -> Trainer<TestAutodiffBackend, impl Optimizer<Classifier<TestAutodiffBackend>, TestAutodiffBackend>>
    {
        let device = Default::default();
        TestAutodiffBackend::seed(config.seed);
        let model = config.model.init::<TestAutodiffBackend>(&device).unwrap();
        let optim = config
            .optimizer
            .init::<TestAutodiffBackend, Classifier<TestAutodiffBackend>>();
        Trainer::new(model, optim, config, device).unwrap()
    }

    #[test]
    fn validation_loss_is_deterministic_without_updates() {
        let device = Default::default();
        let model = config().model.init::<TestBackend>(&device).unwrap();
        let valid = dataset(&[0, 1, 2, 3]);

        let first = measure(&model, &valid, 3, &device).unwrap();
        let second = measure(&model, &valid, 3, &device).unwrap();

        assert_eq!(first.loss, second.loss);
        assert_eq!(first.predictions, second.predictions);
    }

    #[test]
    fn short_run_records_every_epoch() {
        let config = config();
        let mut trainer = trainer(&config);
        let train = dataset(&[0, 1, 0, 1, 2, 3]);
        let valid = dataset(&[0, 1, 2]);

        let history = trainer.train(&train, &valid, 2, 4).unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history.records()[0].epoch, 1);
        assert!(history.best_epoch.is_some());
        for record in history.records() {
            assert!(record.train_loss.is_finite());
            assert!((0.0..=1.0).contains(&record.val_accuracy));
        }
    }

    #[test]
    fn restored_model_reproduces_best_validation_loss() {
        let config = config();
        let mut trainer = trainer(&config);
        let train = dataset(&[0, 1, 2, 3]);
        let valid = dataset(&[0, 1]);

        let history = trainer.train(&train, &valid, 3, 2).unwrap();

        let best_epoch = history.best_epoch.unwrap();
        let best_loss = history.records()[best_epoch - 1].val_loss;
        let restored = measure(&trainer.model().valid(), &valid, 2, &Default::default()).unwrap();
        assert!((restored.loss - best_loss).abs() < 1e-5);
    }

    #[test]
    fn diverging_run_stops_early_and_restores_best_epoch() {
        let config = config().with_patience(1).with_learning_rate(5.0);
        let mut trainer = trainer(&config);
        let train = dataset(&[0, 1, 2, 3, 4, 5, 6, 7]);
        let valid = dataset(&[0, 1, 2, 3]);
        let max_epochs = 30;

        let history = trainer.train(&train, &valid, max_epochs, 4).unwrap();

        let stopped = history
            .stopped_early
            .expect("training should halt before max_epochs");
        assert_eq!(stopped, history.len());
        assert!(history.len() < max_epochs);

        let best_epoch = history.best_epoch.unwrap();
        assert_eq!(best_epoch, stopped - config.patience);
        let best_loss = history.records()[best_epoch - 1].val_loss;
        for record in history.records() {
            assert!(record.val_loss.is_nan() || record.val_loss >= best_loss);
        }

        let restored = measure(&trainer.model().valid(), &valid, 4, &Default::default()).unwrap();
        assert!((restored.loss - best_loss).abs() < 1e-5);
    }

    #[test]
    fn empty_splits_are_rejected() {
        let config = config();
        let mut trainer = trainer(&config);
        let empty = ImageDataset::new(8, 8, vec![]).unwrap();
        let some = dataset(&[1]);

        assert!(matches!(
            trainer.train(&empty, &some, 1, 2),
            Err(ClassifierError::EmptySplit("training"))
        ));
        assert!(matches!(
            trainer.train(&some, &empty, 1, 2),
            Err(ClassifierError::EmptySplit("validation"))
        ));
        assert!(matches!(
            trainer.train(&some, &some, 1, 0),
            Err(ClassifierError::InvalidConfig(_))
        ));
    }
}
