use burn::record::RecorderError;
use thiserror::Error;

/// Error type of the classifier pipeline.
///
/// Every variant aborts the operation that raised it; nothing is retried.
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// Image data does not match the expected `height x width x 3` layout.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// A raw label is outside of the class table.
    #[error("invalid label {label} for sample {index}: expected a class index in [0, {max}]")]
    InvalidLabel {
        /// Position of the sample in its split.
        index: usize,
        /// The offending label.
        label: usize,
        /// Largest valid class index.
        max: usize,
    },

    /// An operation needing a model was called before the model was built.
    #[error("model not built: call `build_model` before `{0}`")]
    ModelNotBuilt(&'static str),

    /// Reporting was requested before any training occurred.
    #[error("no training history available: train the model first")]
    NoHistory,

    /// Per-class accuracy is undefined for a class without evaluation samples.
    #[error("class `{0}` has no samples in the evaluation split, its accuracy is undefined")]
    EmptyClass(&'static str),

    /// The class name is not part of the class table.
    #[error("unknown class `{0}`")]
    UnknownClass(String),

    /// A split that must hold samples is empty.
    #[error("the {0} split is empty")]
    EmptySplit(&'static str),

    /// A configuration value is out of its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be read.
    #[error("config error: {0}")]
    Config(String),

    /// Model record could not be saved or loaded.
    #[error("record error: {0}")]
    Record(String),

    /// Tensor data could not be read back from the backend.
    #[error("tensor data error: {0}")]
    Tensor(String),

    /// Chart or image rendering failed.
    #[error("render error: {0}")]
    Render(String),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<RecorderError> for ClassifierError {
    fn from(error: RecorderError) -> Self {
        ClassifierError::Record(format!("{error:?}"))
    }
}

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, ClassifierError>;
