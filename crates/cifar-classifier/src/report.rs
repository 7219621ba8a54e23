//! Training curves and prediction previews written to an output directory.

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use plotters::coord::Shift;
use plotters::prelude::*;

use crate::data::CHANNELS;
use crate::error::{ClassifierError, Result};
use crate::evaluation::SamplePrediction;
use crate::history::TrainingHistory;

const HISTORY_PLOT: &str = "training_history.svg";
const HISTORY_FILE: &str = "history.json";
const SAMPLES_IMAGE: &str = "sample_predictions.png";

const PLOT_SIZE: (u32, u32) = (1200, 400);
const SCALE: u32 = 4;
const FRAME: u32 = 3;
const GAP: u32 = 8;

const CORRECT: Rgb<u8> = Rgb([0, 160, 0]);
const WRONG: Rgb<u8> = Rgb([200, 0, 0]);
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// Writes reporting artifacts into a single directory.
#[derive(Clone, Debug)]
pub struct Reporter {
    output_dir: PathBuf,
}

impl Reporter {
    /// Creates the reporter and its output directory.
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Draws the accuracy and loss curves side by side.
    pub fn plot_training_history(&self, history: Option<&TrainingHistory>) -> Result<PathBuf> {
        let history = match history {
            Some(history) if !history.is_empty() => history,
            _ => return Err(ClassifierError::NoHistory),
        };

        let path = self.output_dir.join(HISTORY_PLOT);
        {
            let root = SVGBackend::new(&path, PLOT_SIZE).into_drawing_area();
            root.fill(&WHITE).map_err(render_error)?;
            let areas = root.split_evenly((1, 2));

            draw_metric(
                &areas[0],
                "Model Accuracy",
                "Accuracy",
                &history.train_accuracy(),
                &history.val_accuracy(),
            )?;
            draw_metric(
                &areas[1],
                "Model Loss",
                "Loss",
                &history.train_loss(),
                &history.val_loss(),
            )?;

            root.present().map_err(render_error)?;
        }

        log::info!("Training history plotted to {}", path.display());
        Ok(path)
    }

    /// Saves the raw history next to the plot.
    pub fn save_history(&self, history: &TrainingHistory) -> Result<PathBuf> {
        let path = self.output_dir.join(HISTORY_FILE);
        history.save(&path)?;
        Ok(path)
    }

    /// Renders the samples in a row, each framed green when the prediction is
    /// correct and red otherwise. Captions are logged.
    pub fn display_sample_predictions(&self, samples: &[SamplePrediction]) -> Result<PathBuf> {
        let first = samples
            .first()
            .ok_or(ClassifierError::EmptySplit("sample prediction"))?;
        let (height, width) = (first.height as u32, first.width as u32);
        if let Some(sample) = samples
            .iter()
            .find(|sample| sample.image.len() != sample.height * sample.width * CHANNELS)
        {
            return Err(ClassifierError::InvalidShape(format!(
                "sample holds {} values, expected {}x{}x{CHANNELS}",
                sample.image.len(),
                sample.height,
                sample.width
            )));
        }

        let tile_width = width * SCALE + 2 * FRAME;
        let tile_height = height * SCALE + 2 * FRAME;
        let count = samples.len() as u32;
        let mut canvas = RgbImage::from_pixel(
            count * tile_width + (count + 1) * GAP,
            tile_height + 2 * GAP,
            BACKGROUND,
        );

        for (index, sample) in samples.iter().enumerate() {
            let left = GAP + index as u32 * (tile_width + GAP);
            let color = if sample.is_correct() { CORRECT } else { WRONG };
            draw_tile(&mut canvas, left, GAP, sample, color);

            log::info!(
                "Sample {}: {} (confidence {:.2}){}",
                index + 1,
                sample.caption(),
                sample.confidence,
                if sample.is_correct() { "" } else { " [wrong]" }
            );
        }

        let path = self.output_dir.join(SAMPLES_IMAGE);
        canvas.save(&path).map_err(render_error)?;
        Ok(path)
    }
}

fn draw_tile(canvas: &mut RgbImage, left: u32, top: u32, sample: &SamplePrediction, frame: Rgb<u8>) {
    let width = sample.width as u32 * SCALE;
    let height = sample.height as u32 * SCALE;

    for y in 0..height + 2 * FRAME {
        for x in 0..width + 2 * FRAME {
            let inside = (FRAME..FRAME + width).contains(&x) && (FRAME..FRAME + height).contains(&y);
            let pixel = if inside {
                let row = ((y - FRAME) / SCALE) as usize;
                let col = ((x - FRAME) / SCALE) as usize;
                let offset = (row * sample.width + col) * CHANNELS;
                let rgb = &sample.image[offset..offset + CHANNELS];
                Rgb([to_byte(rgb[0]), to_byte(rgb[1]), to_byte(rgb[2])])
            } else {
                frame
            };
            canvas.put_pixel(left + x, top + y, pixel);
        }
    }
}

fn to_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn draw_metric(
    area: &DrawingArea<SVGBackend<'_>, Shift>,
    title: &str,
    y_desc: &str,
    train: &[f64],
    valid: &[f64],
) -> Result<()> {
    let epochs = train.len().max(valid.len()).max(2) as f64;
    let (min, max) = train
        .iter()
        .chain(valid.iter())
        .filter(|value| value.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &value| {
            (min.min(value), max.max(value))
        });
    let (min, max) = if min > max {
        (0.0, 1.0)
    } else {
        let pad = ((max - min) * 0.05).max(0.01);
        (min - pad, max + pad)
    };

    let mut chart = ChartBuilder::on(area)
        .caption(title, ("sans-serif", 20))
        .margin(15)
        .x_label_area_size(35)
        .y_label_area_size(50)
        .build_cartesian_2d(1f64..epochs, min..max)
        .map_err(render_error)?;

    chart
        .configure_mesh()
        .x_desc("Epoch")
        .y_desc(y_desc)
        .draw()
        .map_err(render_error)?;

    for (label, values, color) in [("Train", train, BLUE), ("Validation", valid, RED)] {
        chart
            .draw_series(LineSeries::new(
                values
                    .iter()
                    .enumerate()
                    .filter(|(_, value)| value.is_finite())
                    .map(|(index, value)| ((index + 1) as f64, *value)),
                &color,
            ))
            .map_err(render_error)?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(render_error)?;

    Ok(())
}

fn render_error<E: core::fmt::Debug>(error: E) -> ClassifierError {
    ClassifierError::Render(format!("{error:?}"))
}
