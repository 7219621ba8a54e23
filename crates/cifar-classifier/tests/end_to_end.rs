use burn::backend::{Autodiff, NdArray};

use cifar_classifier::augment::AugmentationConfig;
use cifar_classifier::data::{InMemoryProvider, RawDataset, RawImageItem, RawSplit, CHANNELS};
use cifar_classifier::model::ClassifierConfig;
use cifar_classifier::report::Reporter;
use cifar_classifier::training::TrainingConfig;
use cifar_classifier::{ClassifierError, ImageClassifier};

type Backend = Autodiff<NdArray<f32>>;

const SIZE: usize = 8;
const AIRPLANE: usize = 0;
const CAT: usize = 3;

fn image(seed: u8) -> Vec<u8> {
    (0..SIZE * SIZE * CHANNELS)
        .map(|index| (index as u8).wrapping_mul(seed).wrapping_add(seed))
        .collect()
}

fn split(labels: &[usize]) -> RawSplit {
    let items = labels
        .iter()
        .enumerate()
        .map(|(index, &label)| RawImageItem {
            image: image(index as u8 * 31 + label as u8 + 1),
            label,
        })
        .collect();
    RawSplit::new(SIZE, SIZE, items)
}

fn provider() -> InMemoryProvider {
    InMemoryProvider::new(RawDataset {
        train: split(&[AIRPLANE, CAT, AIRPLANE, CAT]),
        test: split(&[CAT, AIRPLANE]),
    })
}

fn config() -> TrainingConfig {
    TrainingConfig::new()
        .with_model(
            ClassifierConfig::new()
                .with_height(SIZE)
                .with_width(SIZE)
                .with_hidden_size(32),
        )
        .with_augmentation(AugmentationConfig::identity())
        .with_batch_size(2)
}

#[test]
fn single_epoch_reports_represented_classes_only() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = Reporter::new(dir.path()).unwrap();
    let mut classifier = ImageClassifier::<Backend>::new(config(), Default::default());

    let (train, test) = classifier.load_dataset(&provider()).unwrap();
    classifier.build_model().unwrap();
    let history = classifier.train_with(&train, &test, 1, 2).unwrap();

    assert_eq!(history.len(), 1);
    assert_eq!(history.best_epoch, Some(1));

    let report = classifier.evaluate(&test).unwrap();
    assert_eq!(report.num_samples, 2);
    assert_eq!(report.per_class.len(), 2);
    assert_eq!(report.per_class[0].name, "airplane");
    assert_eq!(report.per_class[1].name, "cat");
    assert_eq!(report.empty_classes.len(), 8);
    assert!(matches!(
        report.class_accuracy("truck"),
        Err(ClassifierError::EmptyClass("truck"))
    ));

    let plot = classifier.plot_training_history(&reporter).unwrap();
    assert!(plot.exists());
    let samples = classifier
        .display_sample_predictions(&reporter, &test, 5)
        .unwrap();
    assert!(samples.exists());
}

#[test]
fn saved_model_reloads_with_identical_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let mut classifier = ImageClassifier::<Backend>::new(config(), Default::default());
    let (train, test) = classifier.load_dataset(&provider()).unwrap();
    classifier.build_model().unwrap();
    classifier.train_with(&train, &test, 2, 2).unwrap();

    classifier.save(dir.path()).unwrap();
    let loaded = ImageClassifier::<Backend>::load(dir.path(), Default::default()).unwrap();

    assert!(dir.path().join("config.json").exists());
    assert!(dir.path().join("model.mpk").exists());
    assert_eq!(loaded.config().model.height, SIZE);
    assert_eq!(
        loaded.predict(&test).unwrap(),
        classifier.predict(&test).unwrap()
    );
    assert_eq!(
        loaded.evaluate(&test).unwrap().loss,
        classifier.evaluate(&test).unwrap().loss
    );
}

#[test]
fn mismatched_image_size_is_rejected() {
    let config = config().with_model(ClassifierConfig::new().with_height(16).with_width(16));
    let classifier = ImageClassifier::<Backend>::new(config, Default::default());

    let result = classifier.load_dataset(&provider());

    assert!(matches!(result, Err(ClassifierError::InvalidShape(_))));
}
