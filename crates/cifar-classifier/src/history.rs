use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metrics of one completed epoch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// One-based epoch number.
    pub epoch: usize,
    /// Mean loss over the augmented training batches.
    pub train_loss: f64,
    /// Accuracy over the augmented training batches.
    pub train_accuracy: f64,
    /// Loss on the validation split.
    pub val_loss: f64,
    /// Accuracy on the validation split.
    pub val_accuracy: f64,
}

/// Per-epoch metrics of a training run, in epoch order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    records: Vec<EpochRecord>,
    /// Epoch whose parameters were kept at the end of training.
    pub best_epoch: Option<usize>,
    /// Epoch on which early stopping halted training.
    pub stopped_early: Option<usize>,
}

impl TrainingHistory {
    /// Appends the metrics of the next epoch.
    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    /// All epoch records.
    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    /// Number of recorded epochs.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no epoch completed.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn train_loss(&self) -> Vec<f64> {
        self.series(|record| record.train_loss)
    }

    pub fn train_accuracy(&self) -> Vec<f64> {
        self.series(|record| record.train_accuracy)
    }

    pub fn val_loss(&self) -> Vec<f64> {
        self.series(|record| record.val_loss)
    }

    pub fn val_accuracy(&self) -> Vec<f64> {
        self.series(|record| record.val_accuracy)
    }

    fn series(&self, metric: impl Fn(&EpochRecord) -> f64) -> Vec<f64> {
        self.records.iter().map(metric).collect()
    }

    /// Writes the history as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Reads a history written by [save](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: usize, loss: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: loss,
            train_accuracy: 0.5,
            val_loss: loss + 0.1,
            val_accuracy: 0.4,
        }
    }

    #[test]
    fn series_follow_epoch_order() {
        let mut history = TrainingHistory::default();
        history.push(record(1, 2.0));
        history.push(record(2, 1.5));

        assert_eq!(history.len(), 2);
        assert_eq!(history.train_loss(), vec![2.0, 1.5]);
        assert_eq!(history.val_loss(), vec![2.1, 1.6]);
        assert_eq!(history.val_accuracy(), vec![0.4, 0.4]);
    }

    #[test]
    fn history_survives_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let mut history = TrainingHistory::default();
        history.push(record(1, 1.0));
        history.best_epoch = Some(1);

        history.save(&path).unwrap();
        let loaded = TrainingHistory::load(&path).unwrap();

        assert_eq!(loaded, history);
    }
}
