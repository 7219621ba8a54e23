use std::path::Path;

use anyhow::Context;
use burn::backend::Autodiff;
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;

use cifar_classifier::data::Cifar10Provider;
use cifar_classifier::logging::install_file_logger;
use cifar_classifier::model::ClassifierConfig;
use cifar_classifier::report::Reporter;
use cifar_classifier::training::TrainingConfig;
use cifar_classifier::ImageClassifier;

#[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
use burn::backend::ndarray::{NdArray as Backend, NdArrayDevice as Device};
#[cfg(feature = "wgpu")]
use burn::backend::wgpu::{Wgpu as Backend, WgpuDevice as Device};

#[cfg(not(any(feature = "ndarray", feature = "wgpu")))]
compile_error!("enable a backend feature: `ndarray` or `wgpu`");

const ARTIFACT_DIR: &str = "/tmp/cifar10-classifier";
const NUM_SAMPLES: usize = 5;

/// Train, evaluate and visualize a CNN classifier on CIFAR-10.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Input image height.
    #[arg(long, default_value_t = 32)]
    height: usize,

    /// Input image width.
    #[arg(long, default_value_t = 32)]
    width: usize,
}

// Create the directory to save the model, the reports and the logs
fn create_artifact_dir(artifact_dir: &str) -> anyhow::Result<()> {
    // Remove existing artifacts
    std::fs::remove_dir_all(artifact_dir).ok();
    std::fs::create_dir_all(artifact_dir)
        .with_context(|| format!("failed to create the artifact directory {artifact_dir}"))
}

fn run<B: AutodiffBackend>(config: TrainingConfig, device: B::Device) -> anyhow::Result<()> {
    let mut classifier = ImageClassifier::<B>::new(config, device);

    let (train, test) = classifier
        .load_dataset(&Cifar10Provider::new())
        .context("failed to load CIFAR-10")?;

    classifier.build_model()?;
    // The test split doubles as validation data for early stopping.
    let history = classifier.train(&train, &test)?;
    println!(
        "Trained for {} epochs, best epoch: {}",
        history.len(),
        history
            .best_epoch
            .map_or_else(|| "none".to_string(), |epoch| epoch.to_string())
    );

    let reporter = Reporter::new(ARTIFACT_DIR)?;
    reporter.save_history(classifier.history()?)?;
    let plot = classifier.plot_training_history(&reporter)?;
    println!("Training history plotted to {}", plot.display());

    let report = classifier.evaluate(&test)?;
    println!("{report}");

    let samples = classifier.display_sample_predictions(&reporter, &test, NUM_SAMPLES)?;
    println!("Sample predictions saved to {}", samples.display());

    classifier.save(ARTIFACT_DIR)?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    create_artifact_dir(ARTIFACT_DIR)?;
    install_file_logger(Path::new(ARTIFACT_DIR).join("experiment.log"))?;

    let config = TrainingConfig::new().with_model(
        ClassifierConfig::new()
            .with_height(args.height)
            .with_width(args.width),
    );

    run::<Autodiff<Backend>>(config, Device::default())
}
