//! Accuracy aggregation for evaluation passes.
//!
//! Predictions and references are accumulated batch by batch; accuracy,
//! macro-F1 and per-class counts are derived once the pass is complete.

use advreg_core::{AdvRegError, Result};

/// Per-class confusion counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts {
    /// References carrying this label.
    pub support: usize,
    /// Predictions of this label.
    pub predicted: usize,
    /// Predictions of this label that were right.
    pub correct: usize,
}

impl ClassCounts {
    pub fn precision(&self) -> f64 {
        ratio(self.correct, self.predicted)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.correct, self.support)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r > 0.0 {
            2.0 * p * r / (p + r)
        } else {
            0.0
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// Final score of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyScore {
    pub accuracy: f64,
    /// Mean F1 over classes that appear in references or predictions.
    pub macro_f1: f64,
    pub total: usize,
    pub correct: usize,
    /// Indexed by label.
    pub per_class: Vec<ClassCounts>,
}

impl std::fmt::Display for AccuracyScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acc={:.4} macro_f1={:.4} ({}/{})",
            self.accuracy, self.macro_f1, self.correct, self.total
        )
    }
}

/// Accumulates predictions and references across batches.
#[derive(Debug, Clone, Default)]
pub struct AccuracyMetric {
    predictions: Vec<i64>,
    references: Vec<i64>,
}

impl AccuracyMetric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one batch. Both slices must have the same length.
    pub fn add_batch(&mut self, predictions: &[i64], references: &[i64]) -> Result<()> {
        if predictions.len() != references.len() {
            return Err(AdvRegError::Data(format!(
                "predictions and references must have same length ({} vs {})",
                predictions.len(),
                references.len()
            )));
        }
        self.predictions.extend_from_slice(predictions);
        self.references.extend_from_slice(references);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Score everything accumulated so far. An empty metric scores 0.
    pub fn compute(&self) -> AccuracyScore {
        let num_classes = self
            .predictions
            .iter()
            .chain(&self.references)
            .copied()
            .filter(|&l| l >= 0)
            .max()
            .map_or(0, |max| max as usize + 1);

        let mut per_class = vec![ClassCounts::default(); num_classes];
        let mut correct = 0usize;
        for (&pred, &label) in self.predictions.iter().zip(&self.references) {
            if let Some(counts) = usize::try_from(label).ok().and_then(|l| per_class.get_mut(l)) {
                counts.support += 1;
            }
            if let Some(counts) = usize::try_from(pred).ok().and_then(|p| per_class.get_mut(p)) {
                counts.predicted += 1;
                if pred == label {
                    counts.correct += 1;
                }
            }
            if pred == label {
                correct += 1;
            }
        }

        let present: Vec<&ClassCounts> = per_class
            .iter()
            .filter(|c| c.support > 0 || c.predicted > 0)
            .collect();
        let macro_f1 = if present.is_empty() {
            0.0
        } else {
            present.iter().map(|c| c.f1()).sum::<f64>() / present.len() as f64
        };

        AccuracyScore {
            accuracy: ratio(correct, self.references.len()),
            macro_f1,
            total: self.references.len(),
            correct,
            per_class,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_predictions() {
        let mut metric = AccuracyMetric::new();
        metric.add_batch(&[0, 1, 2], &[0, 1, 2]).unwrap();
        let score = metric.compute();
        assert!((score.accuracy - 1.0).abs() < 1e-9);
        assert!((score.macro_f1 - 1.0).abs() < 1e-9);
        assert_eq!(score.correct, 3);
    }

    #[test]
    fn test_accumulates_across_batches() {
        let mut metric = AccuracyMetric::new();
        metric.add_batch(&[0, 1], &[0, 0]).unwrap();
        metric.add_batch(&[2, 2], &[2, 1]).unwrap();
        let score = metric.compute();
        assert_eq!(score.total, 4);
        assert_eq!(score.correct, 2);
        assert!((score.accuracy - 0.5).abs() < 1e-9);
        assert_eq!(
            score.per_class[0],
            ClassCounts {
                support: 2,
                predicted: 1,
                correct: 1
            }
        );
        assert_eq!(score.per_class[1].correct, 0);
    }

    #[test]
    fn test_macro_f1() {
        let mut metric = AccuracyMetric::new();
        // class 0: p=1, r=0.5 -> f1=2/3; class 1: p=0.5, r=1 -> f1=2/3
        metric.add_batch(&[0, 1, 1], &[0, 0, 1]).unwrap();
        let score = metric.compute();
        assert!((score.macro_f1 - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_metric_scores_zero() {
        let score = AccuracyMetric::new().compute();
        assert_eq!(score.total, 0);
        assert_eq!(score.accuracy, 0.0);
        assert!(score.per_class.is_empty());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut metric = AccuracyMetric::new();
        assert!(metric.add_batch(&[0, 1], &[0]).is_err());
        assert!(metric.is_empty());
    }

    #[test]
    fn test_display() {
        let mut metric = AccuracyMetric::new();
        metric.add_batch(&[0, 1], &[0, 0]).unwrap();
        let line = metric.compute().to_string();
        assert!(line.contains("acc=0.5000"));
        assert!(line.contains("(1/2)"));
    }
}
