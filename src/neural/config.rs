//! Model configuration and compile settings

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

use super::{ModelError, ModelResult};

/// Hyperparameters for one model. Missing keys take their defaults; values
/// are not range-checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// `[height, width, channels]` for image models; `input_shape[0]` is
    /// the feature size for sequence models
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub dropout_rate: f64,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub validation_split: f64,
    pub early_stopping_patience: usize,
    /// One of `cnn`, `rnn`, `transformer`, `cnn_rnn_hybrid`
    pub architecture: String,
    pub optimizer: String,
    pub loss_function: String,
    pub metrics: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_shape: [128, 128, 1],
            num_classes: 10,
            dropout_rate: 0.3,
            learning_rate: 0.001,
            batch_size: 32,
            epochs: 50,
            validation_split: 0.2,
            early_stopping_patience: 10,
            architecture: "cnn_rnn_hybrid".to_string(),
            optimizer: "adam".to_string(),
            loss_function: "categorical_crossentropy".to_string(),
            metrics: vec![
                "accuracy".to_string(),
                "precision".to_string(),
                "recall".to_string(),
            ],
        }
    }
}

impl ModelConfig {
    /// Overlay the keys of a JSON object onto this configuration
    pub fn merged_with(&self, overrides: &Value) -> ModelResult<Self> {
        let Value::Object(overrides) = overrides else {
            return Err(ModelError::InvalidArgument(
                "model configuration must be a JSON object".to_string(),
            ));
        };

        let mut base = serde_json::to_value(self)?;
        if let Value::Object(base) = &mut base {
            for (key, value) in overrides {
                base.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::from_value(base)?)
    }

    /// Feature size of one time step for sequence models
    pub fn sequence_features(&self) -> usize {
        self.input_shape[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optimizer {
    Adam,
    Sgd,
    RmsProp,
}

impl Optimizer {
    /// Unknown names fall back to Adam
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "adam" => Optimizer::Adam,
            "sgd" => Optimizer::Sgd,
            "rmsprop" => Optimizer::RmsProp,
            other => {
                warn!("Unknown optimizer '{}', using adam", other);
                Optimizer::Adam
            }
        }
    }
}

impl fmt::Display for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Optimizer::Adam => write!(f, "adam"),
            Optimizer::Sgd => write!(f, "sgd"),
            Optimizer::RmsProp => write!(f, "rmsprop"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossFunction {
    CategoricalCrossentropy,
    SparseCategoricalCrossentropy,
    BinaryCrossentropy,
    MeanSquaredError,
}

impl LossFunction {
    /// Unknown names fall back to categorical cross-entropy
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "categorical_crossentropy" => LossFunction::CategoricalCrossentropy,
            "sparse_categorical_crossentropy" => LossFunction::SparseCategoricalCrossentropy,
            "binary_crossentropy" => LossFunction::BinaryCrossentropy,
            "mse" | "mean_squared_error" => LossFunction::MeanSquaredError,
            other => {
                warn!("Unknown loss function '{}', using categorical_crossentropy", other);
                LossFunction::CategoricalCrossentropy
            }
        }
    }
}

impl fmt::Display for LossFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossFunction::CategoricalCrossentropy => write!(f, "categorical_crossentropy"),
            LossFunction::SparseCategoricalCrossentropy => write!(f, "sparse_categorical_crossentropy"),
            LossFunction::BinaryCrossentropy => write!(f, "binary_crossentropy"),
            LossFunction::MeanSquaredError => write!(f, "mse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metric {
    Accuracy,
    Precision,
    Recall,
    /// Kept so the configured list survives unchanged; not computed
    Other(String),
}

impl Metric {
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "accuracy" | "acc" => Metric::Accuracy,
            "precision" => Metric::Precision,
            "recall" => Metric::Recall,
            _ => {
                warn!("Unknown metric '{}', it will be reported as unavailable", name);
                Metric::Other(name.to_string())
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Accuracy => write!(f, "accuracy"),
            Metric::Precision => write!(f, "precision"),
            Metric::Recall => write!(f, "recall"),
            Metric::Other(name) => write!(f, "{}", name),
        }
    }
}

/// What `compile` attached to the model
#[derive(Debug, Clone, PartialEq)]
pub struct CompileSettings {
    pub optimizer: Optimizer,
    pub learning_rate: f64,
    pub loss: LossFunction,
    pub metrics: Vec<Metric>,
}

impl CompileSettings {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            optimizer: Optimizer::from_name(&config.optimizer),
            learning_rate: config.learning_rate,
            loss: LossFunction::from_name(&config.loss_function),
            metrics: config.metrics.iter().map(|m| Metric::from_name(m)).collect(),
        }
    }
}

impl fmt::Display for CompileSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metrics: Vec<String> = self.metrics.iter().map(|m| m.to_string()).collect();
        write!(
            f,
            "optimizer={} (lr={}), loss={}, metrics=[{}]",
            self.optimizer,
            self.learning_rate,
            self.loss,
            metrics.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_keys_take_defaults() {
        let config: ModelConfig = serde_json::from_value(json!({"num_classes": 3})).unwrap();
        assert_eq!(config.num_classes, 3);
        assert_eq!(config.input_shape, [128, 128, 1]);
        assert_eq!(config.architecture, "cnn_rnn_hybrid");
        assert_eq!(config.metrics.len(), 3);
    }

    #[test]
    fn test_merged_with() {
        let base = ModelConfig::default();
        let merged = base
            .merged_with(&json!({"architecture": "rnn", "dropout_rate": 0.5}))
            .unwrap();
        assert_eq!(merged.architecture, "rnn");
        assert_eq!(merged.dropout_rate, 0.5);
        assert_eq!(merged.batch_size, 32);

        assert!(matches!(
            base.merged_with(&json!([1, 2])),
            Err(ModelError::InvalidArgument(_))
        ));
        assert!(matches!(
            base.merged_with(&json!({"num_classes": "ten"})),
            Err(ModelError::Serde(_))
        ));
    }

    #[test]
    fn test_compile_settings_fallbacks() {
        let config = ModelConfig {
            optimizer: "adagrad".to_string(),
            loss_function: "hinge".to_string(),
            metrics: vec!["accuracy".to_string(), "auc".to_string()],
            ..ModelConfig::default()
        };
        let settings = CompileSettings::from_config(&config);
        assert_eq!(settings.optimizer, Optimizer::Adam);
        assert_eq!(settings.loss, LossFunction::CategoricalCrossentropy);
        assert_eq!(settings.metrics, vec![Metric::Accuracy, Metric::Other("auc".to_string())]);
    }

    #[test]
    fn test_known_names() {
        assert_eq!(Optimizer::from_name("SGD"), Optimizer::Sgd);
        assert_eq!(Optimizer::from_name("rmsprop"), Optimizer::RmsProp);
        assert_eq!(LossFunction::from_name("mse"), LossFunction::MeanSquaredError);
        assert_eq!(
            LossFunction::from_name("sparse_categorical_crossentropy"),
            LossFunction::SparseCategoricalCrossentropy
        );
        let settings = CompileSettings::from_config(&ModelConfig::default());
        assert_eq!(
            settings.to_string(),
            "optimizer=adam (lr=0.001), loss=categorical_crossentropy, metrics=[accuracy, precision, recall]"
        );
    }
}
