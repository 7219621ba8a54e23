use core::fmt;

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig,
        PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::activation::{log_softmax, softmax},
};

use crate::batcher::ClassificationBatch;
use crate::data::{CHANNELS, NUM_CLASSES};
use crate::error::{self, ClassifierError};
use crate::preprocess::ImageDataset;

/// Output channels of the two convolutional blocks.
pub const BLOCK_CHANNELS: [usize; 2] = [32, 64];

const KERNEL_SIZE: [usize; 2] = [3, 3];
const POOL_SIZE: [usize; 2] = [2, 2];

/// Configuration to create a [classifier](Classifier).
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// Input image height.
    #[config(default = 32)]
    pub height: usize,
    /// Input image width.
    #[config(default = 32)]
    pub width: usize,
    /// Width of the dense layer before the classification head.
    #[config(default = 512)]
    pub hidden_size: usize,
    /// Dropout rate at the end of each convolutional block.
    #[config(default = 0.25)]
    pub conv_dropout: f64,
    /// Dropout rate after the dense layer.
    #[config(default = 0.5)]
    pub dense_dropout: f64,
}

/// Shape of a single sample flowing between stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorShape {
    /// Feature map laid out as `[channels, height, width]`.
    Image {
        /// Number of channels.
        channels: usize,
        /// Height in pixels.
        height: usize,
        /// Width in pixels.
        width: usize,
    },
    /// Flat feature vector.
    Features(usize),
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorShape::Image {
                channels,
                height,
                width,
            } => write!(f, "[{channels}, {height}, {width}]"),
            TensorShape::Features(size) => write!(f, "[{size}]"),
        }
    }
}

/// A named stage of the network with its shape contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stage {
    /// Stage name, e.g. `block1.conv2`.
    pub name: String,
    /// Shape the stage accepts.
    pub input: TensorShape,
    /// Shape the stage produces.
    pub output: TensorShape,
}

/// Ordered stages whose contracts are checked as they are appended.
#[derive(Clone, Debug)]
pub struct StagePlan {
    input: TensorShape,
    stages: Vec<Stage>,
}

impl StagePlan {
    fn new(input: TensorShape) -> Self {
        Self {
            input,
            stages: Vec::new(),
        }
    }

    /// Shape produced by the last stage, or the input shape.
    pub fn output(&self) -> TensorShape {
        self.stages.last().map_or(self.input, |stage| stage.output)
    }

    /// Shape accepted by the first stage.
    pub fn input(&self) -> TensorShape {
        self.input
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn push(
        &mut self,
        name: String,
        input: TensorShape,
        output: TensorShape,
    ) -> error::Result<()> {
        let current = self.output();
        if input != current {
            return Err(ClassifierError::InvalidShape(format!(
                "stage `{name}` expects {input} but receives {current}"
            )));
        }

        let empty = match output {
            TensorShape::Image {
                channels,
                height,
                width,
            } => channels == 0 || height == 0 || width == 0,
            TensorShape::Features(size) => size == 0,
        };
        if empty {
            return Err(ClassifierError::InvalidShape(format!(
                "stage `{name}` maps {input} to the empty shape {output}"
            )));
        }

        self.stages.push(Stage {
            name,
            input,
            output,
        });
        Ok(())
    }

    fn conv(&mut self, name: String, channels: usize) -> error::Result<()> {
        let input = self.output();
        let output = match input {
            // Same padding keeps the spatial size.
            TensorShape::Image { height, width, .. } => TensorShape::Image {
                channels,
                height,
                width,
            },
            TensorShape::Features(_) => {
                return Err(ClassifierError::InvalidShape(format!(
                    "stage `{name}` needs a feature map, got {input}"
                )))
            }
        };
        self.push(name, input, output)
    }

    fn pool(&mut self, name: String) -> error::Result<()> {
        let input = self.output();
        let output = match input {
            TensorShape::Image {
                channels,
                height,
                width,
            } => TensorShape::Image {
                channels,
                height: height / POOL_SIZE[0],
                width: width / POOL_SIZE[1],
            },
            TensorShape::Features(_) => {
                return Err(ClassifierError::InvalidShape(format!(
                    "stage `{name}` needs a feature map, got {input}"
                )))
            }
        };
        self.push(name, input, output)
    }

    fn flatten(&mut self) -> error::Result<()> {
        let input = self.output();
        let output = match input {
            TensorShape::Image {
                channels,
                height,
                width,
            } => TensorShape::Features(channels * height * width),
            TensorShape::Features(size) => TensorShape::Features(size),
        };
        self.push("flatten".to_string(), input, output)
    }

    fn dense(&mut self, name: &str, size: usize) -> error::Result<()> {
        let input = self.output();
        if !matches!(input, TensorShape::Features(_)) {
            return Err(ClassifierError::InvalidShape(format!(
                "stage `{name}` needs flat features, got {input}"
            )));
        }
        self.push(name.to_string(), input, TensorShape::Features(size))
    }

    fn features(&self) -> usize {
        match self.output() {
            TensorShape::Features(size) => size,
            TensorShape::Image {
                channels,
                height,
                width,
            } => channels * height * width,
        }
    }
}

impl ClassifierConfig {
    /// Builds and validates the stage plan for this configuration.
    pub fn stages(&self) -> error::Result<StagePlan> {
        for (name, rate) in [
            ("conv_dropout", self.conv_dropout),
            ("dense_dropout", self.dense_dropout),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ClassifierError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {rate}"
                )));
            }
        }

        let mut plan = StagePlan::new(TensorShape::Image {
            channels: CHANNELS,
            height: self.height,
            width: self.width,
        });
        if self.height == 0 || self.width == 0 {
            return Err(ClassifierError::InvalidShape(format!(
                "input images must not be empty, got {}",
                plan.input()
            )));
        }

        for (block, channels) in BLOCK_CHANNELS.iter().enumerate() {
            let block = block + 1;
            plan.conv(format!("block{block}.conv1"), *channels)?;
            plan.conv(format!("block{block}.conv2"), *channels)?;
            plan.pool(format!("block{block}.pool"))?;
        }
        plan.flatten()?;
        plan.dense("dense", self.hidden_size)?;
        plan.dense("head", NUM_CLASSES)?;

        Ok(plan)
    }

    /// Returns the initialized model after checking every stage contract.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<Classifier<B>> {
        let plan = self.stages()?;
        let flattened = plan
            .stages()
            .iter()
            .find(|stage| stage.name == "flatten")
            .map_or(0, |stage| match stage.output {
                TensorShape::Features(size) => size,
                TensorShape::Image { .. } => 0,
            });

        let [first, second] = BLOCK_CHANNELS;
        let model = Classifier {
            block1: ConvBlock::new(CHANNELS, first, self.conv_dropout, device),
            block2: ConvBlock::new(first, second, self.conv_dropout, device),
            dense: LinearConfig::new(flattened, self.hidden_size).init(device),
            dense_norm: BatchNormConfig::new(self.hidden_size).init(device),
            dense_dropout: DropoutConfig::new(self.dense_dropout).init(),
            head: LinearConfig::new(self.hidden_size, plan.features()).init(device),
            activation: Relu::new(),
            height: self.height,
            width: self.width,
        };

        Ok(model)
    }
}

/// Two same-padded 3x3 convolutions with batch norm and ReLU, then 2x2 max
/// pooling and dropout.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    pool: MaxPool2d,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(channels_in: usize, channels_out: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            conv1: Conv2dConfig::new([channels_in, channels_out], KERNEL_SIZE)
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            norm1: BatchNormConfig::new(channels_out).init(device),
            conv2: Conv2dConfig::new([channels_out, channels_out], KERNEL_SIZE)
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            norm2: BatchNormConfig::new(channels_out).init(device),
            pool: MaxPool2dConfig::new(POOL_SIZE).with_strides(POOL_SIZE).init(),
            dropout: DropoutConfig::new(dropout).init(),
            activation: Relu::new(),
        }
    }

    /// # Shapes
    ///   - input `[batch_size, channels_in, height, width]`
    ///   - output `[batch_size, channels_out, height / 2, width / 2]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(input);
        let x = self.norm1.forward(x);
        let x = self.activation.forward(x);

        let x = self.conv2.forward(x);
        let x = self.norm2.forward(x);
        let x = self.activation.forward(x);

        let x = self.pool.forward(x);
        self.dropout.forward(x)
    }
}

/// Convolutional image classifier.
///
/// Feature extractor of two [conv blocks](ConvBlock) followed by a dense layer
/// with batch norm, ReLU and dropout, and a softmax classification head.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    dense: Linear<B>,
    dense_norm: BatchNorm<B, 0>,
    dense_dropout: Dropout,
    head: Linear<B>,
    activation: Relu,
    height: usize,
    width: usize,
}

/// Loss and predictions of one batch.
#[derive(Debug)]
pub struct ClassificationOutput<B: Backend> {
    /// Mean categorical cross-entropy, `[1]`.
    pub loss: Tensor<B, 1>,
    /// Class probabilities, `[batch_size, 10]`.
    pub probabilities: Tensor<B, 2>,
    /// One-hot targets, `[batch_size, 10]`.
    pub targets: Tensor<B, 2>,
}

impl<B: Backend> Classifier<B> {
    /// Unnormalized class scores.
    ///
    /// # Shapes
    ///   - images `[batch_size, 3, height, width]`
    ///   - output `[batch_size, 10]`
    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.block1.forward(images);
        let x = self.block2.forward(x);

        let [batch_size, channels, height, width] = x.dims();
        let x = x.reshape([batch_size, channels * height * width]);

        let x = self.dense.forward(x);
        let x = self.dense_norm.forward(x);
        let x = self.activation.forward(x);
        let x = self.dense_dropout.forward(x);

        self.head.forward(x)
    }

    /// Probability distribution over the classes for every image.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward_logits(images), 1)
    }

    /// Forward pass with the categorical cross-entropy of the batch.
    pub fn forward_classification(&self, batch: ClassificationBatch<B>) -> ClassificationOutput<B> {
        let logits = self.forward_logits(batch.images);
        let loss = categorical_cross_entropy(logits.clone(), batch.targets.clone());

        ClassificationOutput {
            loss,
            probabilities: softmax(logits, 1),
            targets: batch.targets,
        }
    }

    /// Input image dimensions as `[height, width]`.
    pub fn input_dims(&self) -> [usize; 2] {
        [self.height, self.width]
    }

    /// Rejects a dataset whose images do not match the model input.
    pub fn check_input(&self, dataset: &ImageDataset) -> error::Result<()> {
        if [dataset.height(), dataset.width()] != self.input_dims() {
            return Err(ClassifierError::InvalidShape(format!(
                "the model expects {}x{}x{CHANNELS} images, the dataset holds {}x{}x{CHANNELS} images",
                self.height,
                self.width,
                dataset.height(),
                dataset.width()
            )));
        }
        Ok(())
    }
}

/// Mean over the batch of `-sum(targets * log(softmax(logits)))`.
///
/// # Shapes
///   - logits `[batch_size, num_classes]`
///   - targets `[batch_size, num_classes]`, one-hot
///   - output `[1]`
pub fn categorical_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    log_softmax(logits, 1)
        .mul(targets)
        .sum_dim(1)
        .mean()
        .neg()
}
