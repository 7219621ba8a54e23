//! CIFAR-10 dataset acquisition.
//!
//! The binary version of the dataset is used, see
//! <https://www.cs.toronto.edu/~kriz/cifar.html>. Each record is one label byte
//! followed by the 32x32 image stored channel by channel (1024 red bytes, then
//! green, then blue). Records are converted to the channel-last layout used by
//! the rest of the crate.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use burn_common::network::downloader;
use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::{ClassifierError, Result};

/// Number of classes in the class table.
pub const NUM_CLASSES: usize = 10;

/// Number of color channels of every image.
pub const CHANNELS: usize = 3;

/// Class index to name mapping. The order is fixed and never changes.
pub const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

/// Returns the name of the class at `index`.
pub fn class_name(index: usize) -> Option<&'static str> {
    CLASS_NAMES.get(index).copied()
}

/// Returns the index of the class called `name`.
pub fn class_index(name: &str) -> Option<usize> {
    CLASS_NAMES.iter().position(|class| *class == name)
}

// The binary archive from the dataset authors.
const URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
const ARCHIVE_DIR: &str = "cifar-10-batches-bin";
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";

/// Width of a CIFAR-10 image.
pub const WIDTH: usize = 32;
/// Height of a CIFAR-10 image.
pub const HEIGHT: usize = 32;
/// Number of training images.
pub const TRAIN_LEN: usize = 50_000;
/// Number of test images.
pub const TEST_LEN: usize = 10_000;

const BYTES_PER_IMAGE: usize = WIDTH * HEIGHT * CHANNELS;
const BYTES_PER_RECORD: usize = BYTES_PER_IMAGE + 1;

/// Raw labeled image, pixel values as stored on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImageItem {
    /// Pixels in `height x width x 3` row-major channel-last order.
    pub image: Vec<u8>,
    /// Integer class label.
    pub label: usize,
}

/// One split of raw images sharing the same dimensions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawSplit {
    /// Image height in pixels.
    pub height: usize,
    /// Image width in pixels.
    pub width: usize,
    /// Labeled images.
    pub items: Vec<RawImageItem>,
}

impl RawSplit {
    /// Creates a split from its items.
    pub fn new(height: usize, width: usize, items: Vec<RawImageItem>) -> Self {
        Self {
            height,
            width,
            items,
        }
    }
}

/// Training and held-out test splits. The splits never share source samples.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawDataset {
    /// Training split.
    pub train: RawSplit,
    /// Held-out evaluation split.
    pub test: RawSplit,
}

/// Source of raw train/test arrays.
pub trait DatasetProvider {
    /// Loads both splits.
    fn load(&self) -> Result<RawDataset>;
}

/// Provider serving an already loaded dataset.
#[derive(Clone, Debug)]
pub struct InMemoryProvider {
    dataset: RawDataset,
}

impl InMemoryProvider {
    /// Wraps the given dataset.
    pub fn new(dataset: RawDataset) -> Self {
        Self { dataset }
    }
}

impl DatasetProvider for InMemoryProvider {
    fn load(&self) -> Result<RawDataset> {
        Ok(self.dataset.clone())
    }
}

/// CIFAR-10 download lock.
///
/// Only one thread downloads and unpacks the archive at a time.
static DOWNLOAD_LOCK: Mutex<()> = Mutex::new(());

/// The CIFAR-10 dataset: 60,000 32x32 color images in 10 classes, 50,000 for
/// training and 10,000 for testing.
#[derive(Clone, Debug)]
pub struct Cifar10Provider {
    root: Option<PathBuf>,
}

impl Default for Cifar10Provider {
    fn default() -> Self {
        Self::new()
    }
}

impl Cifar10Provider {
    /// Uses the burn-dataset cache directory, downloading the archive when needed.
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Reads the extracted `*.bin` files from `dir` without downloading.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            root: Some(dir.as_ref().to_path_buf()),
        }
    }

    fn download() -> Result<PathBuf> {
        let _lock = DOWNLOAD_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Dataset files are stored in the burn-dataset cache directory
        let cache_dir = dirs::home_dir()
            .ok_or_else(|| {
                ClassifierError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "could not get home directory",
                ))
            })?
            .join(".cache")
            .join("burn-dataset");
        let cifar_dir = cache_dir.join(ARCHIVE_DIR);

        if !is_extracted(&cifar_dir) {
            std::fs::create_dir_all(&cache_dir)?;
            log::info!("Downloading CIFAR-10 into {}", cache_dir.display());

            let bytes = downloader::download_file_as_bytes(URL, "cifar-10-binary.tar.gz");
            let gz_buffer = GzDecoder::new(&bytes[..]);
            let mut archive = Archive::new(gz_buffer);
            archive.unpack(&cache_dir)?;
        }

        Ok(cifar_dir)
    }

    fn root(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => Self::download(),
        }
    }
}

/// Whether every batch file of the archive is present in `dir`.
fn is_extracted(dir: &Path) -> bool {
    TRAIN_FILES
        .iter()
        .chain([TEST_FILE].iter())
        .all(|file| dir.join(file).is_file())
}

impl DatasetProvider for Cifar10Provider {
    fn load(&self) -> Result<RawDataset> {
        let root = self.root()?;

        let mut train = Vec::with_capacity(TRAIN_LEN);
        for file in TRAIN_FILES {
            train.extend(read_batch_file(&root.join(file))?);
        }
        let test = read_batch_file(&root.join(TEST_FILE))?;

        check_len("train", train.len(), TRAIN_LEN)?;
        check_len("test", test.len(), TEST_LEN)?;
        log::info!(
            "Loaded CIFAR-10: {} train and {} test images",
            train.len(),
            test.len()
        );

        Ok(RawDataset {
            train: RawSplit::new(HEIGHT, WIDTH, train),
            test: RawSplit::new(HEIGHT, WIDTH, test),
        })
    }
}

fn check_len(split: &str, found: usize, expected: usize) -> Result<()> {
    if found != expected {
        return Err(ClassifierError::InvalidShape(format!(
            "the {split} split holds {found} images, expected {expected}"
        )));
    }
    Ok(())
}

/// Reads every record of a CIFAR-10 binary batch file.
pub fn read_batch_file(path: &Path) -> Result<Vec<RawImageItem>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;

    decode_records(&data).map_err(|err| match err {
        ClassifierError::InvalidShape(reason) => {
            ClassifierError::InvalidShape(format!("{}: {reason}", path.display()))
        }
        other => other,
    })
}

/// Decodes channel-major records into channel-last items.
pub fn decode_records(data: &[u8]) -> Result<Vec<RawImageItem>> {
    if data.len() % BYTES_PER_RECORD != 0 {
        return Err(ClassifierError::InvalidShape(format!(
            "{} bytes is not a whole number of {BYTES_PER_RECORD}-byte records",
            data.len()
        )));
    }

    let plane = WIDTH * HEIGHT;
    let items = data
        .chunks_exact(BYTES_PER_RECORD)
        .map(|record| {
            let (label, pixels) = record.split_at(1);
            let mut image = vec![0u8; BYTES_PER_IMAGE];
            for (position, rgb) in image.chunks_exact_mut(CHANNELS).enumerate() {
                for (channel, value) in rgb.iter_mut().enumerate() {
                    *value = pixels[channel * plane + position];
                }
            }

            RawImageItem {
                image,
                label: label[0] as usize,
            }
        })
        .collect();

    Ok(items)
}
