//! Clean-forward evaluation over a held-out split.

use advreg_core::Result;
use advreg_engine::{Batch, SequenceClassifier};
use candle_core::{DType, D};

use crate::metrics::{AccuracyMetric, AccuracyScore};

/// Arg-max class of each row of `batch`, with no perturbation applied.
pub fn predict(model: &dyn SequenceClassifier, batch: &Batch) -> Result<Vec<i64>> {
    let output = model.forward(&batch.input_ids, &batch.attention_mask, None)?;
    let predictions = output
        .logits
        .detach()
        .argmax(D::Minus1)?
        .to_dtype(DType::I64)?
        .to_vec1::<i64>()?;
    Ok(predictions)
}

/// Run every batch through the model and score the predictions.
pub fn evaluate<I>(model: &dyn SequenceClassifier, batches: I) -> Result<AccuracyScore>
where
    I: IntoIterator<Item = Result<Batch>>,
{
    let mut metric = AccuracyMetric::new();
    for batch in batches {
        let batch = batch?;
        let predictions = predict(model, &batch)?;
        let references = batch.labels.to_vec1::<i64>()?;
        metric.add_batch(&predictions, &references)?;
    }
    let score = metric.compute();
    tracing::debug!(accuracy = score.accuracy, samples = score.total, "evaluation done");
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use advreg_core::ModelConfig;
    use advreg_engine::PooledClassifier;
    use candle_core::{Device, Tensor};

    fn batch(labels: &[i64]) -> Batch {
        let device = Device::Cpu;
        let n = labels.len();
        let ids: Vec<u32> = (0..n as u32 * 2).map(|i| i % 7 + 1).collect();
        Batch {
            input_ids: Tensor::from_vec(ids, (n, 2), &device).unwrap(),
            attention_mask: Tensor::ones((n, 2), DType::U32, &device).unwrap(),
            labels: Tensor::new(labels, &device).unwrap(),
        }
    }

    fn model() -> PooledClassifier {
        PooledClassifier::seeded(
            &ModelConfig {
                vocab_size: 8,
                hidden_dim: 4,
                num_labels: 3,
            },
            &Device::Cpu,
            9,
        )
        .unwrap()
    }

    #[test]
    fn test_predict_in_label_range() {
        let model = model();
        let preds = predict(&model, &batch(&[0, 1, 2])).unwrap();
        assert_eq!(preds.len(), 3);
        assert!(preds.iter().all(|&p| (0..3).contains(&p)));
    }

    #[test]
    fn test_evaluate_counts_all_batches() {
        let model = model();
        let batches = vec![Ok(batch(&[0, 1])), Ok(batch(&[2, 2, 1]))];
        let score = evaluate(&model, batches).unwrap();
        assert_eq!(score.total, 5);
        assert!((0.0..=1.0).contains(&score.accuracy));
    }

    #[test]
    fn test_evaluate_matches_predictions() {
        let model = model();
        let b = batch(&[0, 1, 2, 0]);
        let preds = predict(&model, &b).unwrap();
        // Use the model's own predictions as references: accuracy is 1.
        let labels = Tensor::new(preds.as_slice(), &Device::Cpu).unwrap();
        let relabeled = Batch { labels, ..b };
        let score = evaluate(&model, vec![Ok(relabeled)]).unwrap();
        assert!((score.accuracy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_evaluate_does_not_touch_parameters() {
        let model = model();
        let before: Vec<Vec<f32>> = model
            .parameters()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        evaluate(&model, vec![Ok(batch(&[0, 1, 2]))]).unwrap();
        let after: Vec<Vec<f32>> = model
            .parameters()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        assert_eq!(before, after);
    }
}
