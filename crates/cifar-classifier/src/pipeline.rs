use std::path::{Path, PathBuf};

use burn::{
    module::AutodiffModule,
    prelude::*,
    record::DefaultRecorder,
    tensor::backend::AutodiffBackend,
};

use crate::data::DatasetProvider;
use crate::error::{ClassifierError, Result};
use crate::evaluation::{EvaluationReport, Evaluator, SamplePrediction};
use crate::history::TrainingHistory;
use crate::model::Classifier;
use crate::preprocess::{ImageDataset, Preprocessor};
use crate::report::Reporter;
use crate::training::{Trainer, TrainingConfig};

const CONFIG_FILE: &str = "config.json";
const MODEL_FILE: &str = "model";

/// Owns everything needed to go from raw data to a trained, evaluated model.
///
/// Operations that need a model fail with [`ClassifierError::ModelNotBuilt`]
/// until [build_model](Self::build_model) is called, and reporting fails with
/// [`ClassifierError::NoHistory`] until training completed.
pub struct ImageClassifier<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    model: Option<Classifier<B>>,
    history: Option<TrainingHistory>,
}

impl<B: AutodiffBackend> ImageClassifier<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            model: None,
            history: None,
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// The model, once built or loaded.
    pub fn model(&self) -> Option<&Classifier<B>> {
        self.model.as_ref()
    }

    /// Loads both splits and preprocesses them for the configured image size.
    pub fn load_dataset<P>(&self, provider: &P) -> Result<(ImageDataset, ImageDataset)>
    where
        P: DatasetProvider + ?Sized,
    {
        let raw = provider.load()?;
        let preprocessor = Preprocessor::new(self.config.model.height, self.config.model.width);

        let train = preprocessor.process(&raw.train)?;
        let test = preprocessor.process(&raw.test)?;
        log::info!(
            "Preprocessed {} train and {} test images",
            train.items().len(),
            test.items().len()
        );

        Ok((train, test))
    }

    /// Seeds the backend and creates a fresh model, discarding any history.
    pub fn build_model(&mut self) -> Result<&Classifier<B>> {
        let plan = self.config.model.stages()?;
        for stage in plan.stages() {
            log::info!("{}: {} -> {}", stage.name, stage.input, stage.output);
        }

        B::seed(self.config.seed);
        let model = self.config.model.init::<B>(&self.device)?;
        log::info!("Model built with {} parameters", model.num_params());

        self.history = None;
        Ok(&*self.model.insert(model))
    }

    /// Trains with the configured number of epochs and batch size, validating
    /// on `valid`.
    pub fn train(&mut self, train: &ImageDataset, valid: &ImageDataset) -> Result<&TrainingHistory> {
        let (num_epochs, batch_size) = (self.config.num_epochs, self.config.batch_size);
        self.train_with(train, valid, num_epochs, batch_size)
    }

    pub fn train_with(
        &mut self,
        train: &ImageDataset,
        valid: &ImageDataset,
        max_epochs: usize,
        batch_size: usize,
    ) -> Result<&TrainingHistory> {
        let model = self.require_model("train")?.clone();
        let optim = self.config.optimizer.init::<B, Classifier<B>>();

        let mut trainer = Trainer::new(model, optim, &self.config, self.device.clone())?;
        let history = trainer.train(train, valid, max_epochs, batch_size)?;
        self.model = Some(trainer.into_model());

        Ok(&*self.history.insert(history))
    }

    pub fn history(&self) -> Result<&TrainingHistory> {
        self.history.as_ref().ok_or(ClassifierError::NoHistory)
    }

    /// Evaluates the model without dropout, using batch norm running statistics.
    pub fn evaluate(&self, test: &ImageDataset) -> Result<EvaluationReport> {
        let model = self.require_model("evaluate")?.valid();
        self.evaluator().evaluate(&model, test)
    }

    pub fn predict(&self, dataset: &ImageDataset) -> Result<Vec<usize>> {
        let model = self.require_model("predict")?.valid();
        self.evaluator().predict(&model, dataset)
    }

    pub fn sample_predictions(
        &self,
        test: &ImageDataset,
        count: usize,
    ) -> Result<Vec<SamplePrediction>> {
        let model = self.require_model("sample_predictions")?.valid();
        self.evaluator().sample_predictions(&model, test, count)
    }

    pub fn plot_training_history(&self, reporter: &Reporter) -> Result<PathBuf> {
        reporter.plot_training_history(self.history.as_ref())
    }

    /// Renders the first `count` test images with their predicted and true labels.
    pub fn display_sample_predictions(
        &self,
        reporter: &Reporter,
        test: &ImageDataset,
        count: usize,
    ) -> Result<PathBuf> {
        let samples = self.sample_predictions(test, count)?;
        reporter.display_sample_predictions(&samples)
    }

    /// Saves the configuration and the model record into `dir`.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let model = self.require_model("save")?;
        std::fs::create_dir_all(dir)?;

        self.config.save(dir.join(CONFIG_FILE))?;
        model
            .clone()
            .save_file(dir.join(MODEL_FILE), &DefaultRecorder::new())?;
        log::info!("Model saved to {}", dir.display());

        Ok(())
    }

    /// Restores a classifier saved with [save](Self::save).
    pub fn load<P: AsRef<Path>>(dir: P, device: B::Device) -> Result<Self> {
        let dir = dir.as_ref();
        let config = TrainingConfig::load(dir.join(CONFIG_FILE))
            .map_err(|err| ClassifierError::Config(format!("{err:?}")))?;
        let model = config
            .model
            .init::<B>(&device)?
            .load_file(dir.join(MODEL_FILE), &DefaultRecorder::new(), &device)?;

        Ok(Self {
            config,
            device,
            model: Some(model),
            history: None,
        })
    }

    fn evaluator(&self) -> Evaluator<B::InnerBackend> {
        Evaluator::new(self.device.clone(), self.config.batch_size)
    }

    fn require_model(&self, operation: &'static str) -> Result<&Classifier<B>> {
        self.model
            .as_ref()
            .ok_or(ClassifierError::ModelNotBuilt(operation))
    }
}
