//! Losses and metrics over predicted class probabilities

use candle_core::{DType, Tensor, D};

use super::config::{LossFunction, Metric};
use super::{ModelError, ModelResult};

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before taking logs
const EPSILON: f32 = 1e-7;

/// Threshold applied to probabilities by precision and recall
const THRESHOLD: f32 = 0.5;

/// Result of [`evaluate`]
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub loss: f32,
    /// Configured metrics in order; unknown metric names are skipped
    pub metrics: Vec<(String, f32)>,
}

impl Evaluation {
    pub fn metric(&self, name: &str) -> Option<f32> {
        self.metrics
            .iter()
            .find(|(metric, _)| metric == name)
            .map(|(_, value)| *value)
    }
}

/// Score `(batch, classes)` probabilities against integer labels
pub fn evaluate(
    probabilities: &Tensor,
    labels: &[usize],
    loss: LossFunction,
    metrics: &[Metric],
) -> ModelResult<Evaluation> {
    let rows = probabilities.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    if rows.len() != labels.len() {
        return Err(ModelError::InvalidArgument(format!(
            "got {} labels for {} predictions",
            labels.len(),
            rows.len()
        )));
    }
    if rows.is_empty() {
        return Err(ModelError::InvalidArgument("cannot evaluate an empty batch".to_string()));
    }
    let classes = rows[0].len();
    if let Some(label) = labels.iter().find(|&&label| label >= classes) {
        return Err(ModelError::InvalidArgument(format!(
            "label {} out of range for {} classes",
            label, classes
        )));
    }

    let loss = match loss {
        LossFunction::CategoricalCrossentropy | LossFunction::SparseCategoricalCrossentropy => {
            crossentropy(&rows, labels)
        }
        LossFunction::BinaryCrossentropy => binary_crossentropy(&rows, labels),
        LossFunction::MeanSquaredError => mean_squared_error(&rows, labels),
    };

    let metrics = metrics
        .iter()
        .filter_map(|metric| {
            let value = match metric {
                Metric::Accuracy => accuracy(&rows, labels),
                Metric::Precision => precision_recall(&rows, labels).0,
                Metric::Recall => precision_recall(&rows, labels).1,
                Metric::Other(_) => return None,
            };
            Some((metric.to_string(), value))
        })
        .collect();

    Ok(Evaluation { loss, metrics })
}

/// Index and value of the largest probability in each row
pub fn argmax_rows(probabilities: &Tensor) -> ModelResult<Vec<(usize, f32)>> {
    let indices = probabilities.argmax(D::Minus1)?.to_vec1::<u32>()?;
    let values = probabilities.max(D::Minus1)?.to_vec1::<f32>()?;
    Ok(indices
        .into_iter()
        .zip(values)
        .map(|(index, value)| (index as usize, value))
        .collect())
}

fn clip(p: f32) -> f32 {
    p.clamp(EPSILON, 1.0 - EPSILON)
}

fn one_hot(label: usize, class: usize) -> f32 {
    if label == class {
        1.0
    } else {
        0.0
    }
}

fn crossentropy(rows: &[Vec<f32>], labels: &[usize]) -> f32 {
    let total: f32 = rows
        .iter()
        .zip(labels)
        .map(|(row, &label)| -clip(row[label]).ln())
        .sum();
    total / rows.len() as f32
}

fn binary_crossentropy(rows: &[Vec<f32>], labels: &[usize]) -> f32 {
    let mut total = 0.0;
    let mut count = 0usize;
    for (row, &label) in rows.iter().zip(labels) {
        for (class, &p) in row.iter().enumerate() {
            let y = one_hot(label, class);
            let p = clip(p);
            total += -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());
            count += 1;
        }
    }
    total / count as f32
}

fn mean_squared_error(rows: &[Vec<f32>], labels: &[usize]) -> f32 {
    let mut total = 0.0;
    let mut count = 0usize;
    for (row, &label) in rows.iter().zip(labels) {
        for (class, &p) in row.iter().enumerate() {
            total += (p - one_hot(label, class)).powi(2);
            count += 1;
        }
    }
    total / count as f32
}

fn row_argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
        .0
}

fn accuracy(rows: &[Vec<f32>], labels: &[usize]) -> f32 {
    let correct = rows
        .iter()
        .zip(labels)
        .filter(|(row, label)| row_argmax(row) == **label)
        .count();
    correct as f32 / rows.len() as f32
}

/// Thresholded precision and recall over every one-hot entry
fn precision_recall(rows: &[Vec<f32>], labels: &[usize]) -> (f32, f32) {
    let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);
    for (row, &label) in rows.iter().zip(labels) {
        for (class, &p) in row.iter().enumerate() {
            let predicted = p > THRESHOLD;
            let actual = class == label;
            match (predicted, actual) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, true) => fn_ += 1,
                (false, false) => {}
            }
        }
    }
    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f32 / den as f32 };
    (ratio(tp, tp + fp), ratio(tp, tp + fn_))
}
