use crate::data::ColumnSpec;
use crate::inference::InferenceConfig;
use crate::kernel::PriorConfig;
use crate::network::{NetParams, NetworkConfig, WeightNet};
use crate::train::{EpochRecord, TrainConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable TOML format of a trained model.

/// Every hyperparameter needed to rebuild the prior, the network, and the
/// local solver exactly as they were during training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub network: NetworkConfig,
    pub prior: PriorConfig,
    /// Includes the WLS solver and graph post-processing settings.
    pub train: TrainConfig,
}

impl ModelConfig {
    pub fn inference_config(&self) -> InferenceConfig {
        InferenceConfig {
            prior: self.prior,
            wls: self.train.wls,
            graph: self.train.graph,
        }
    }
}

/// The self-contained trained-model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub config: ModelConfig,
    /// Column names of the training table, in feature-matrix order.
    pub columns: ColumnSpec,
    /// The restored best parameters.
    pub params: NetParams,
    pub best_score: f64,
    #[serde(default)]
    pub history: Vec<EpochRecord>,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The model lists {columns} feature columns, but its encoder expects {encoder}.")]
    FeatureCountMismatch { columns: usize, encoder: usize },
    #[error("Stored network parameters are inconsistent: {0}")]
    CorruptParameters(String),
}

impl TrainedModel {
    /// Rebuilds the weight network after checking the stored shapes.
    pub fn weight_net(&self) -> Result<WeightNet, ModelError> {
        let p = &self.params;
        let encoder = p.input_dim();
        if encoder != self.columns.features.len() {
            return Err(ModelError::FeatureCountMismatch {
                columns: self.columns.features.len(),
                encoder,
            });
        }
        let hidden = p.w1.ncols();
        if p.b1.len() != hidden || p.w2.nrows() != hidden || p.b2.len() != p.w2.ncols() {
            return Err(ModelError::CorruptParameters(format!(
                "w1 {:?}, b1 {}, w2 {:?}, b2 {}",
                p.w1.dim(),
                p.b1.len(),
                p.w2.dim(),
                p.b2.len()
            )));
        }
        Ok(WeightNet::from_params(self.params.clone()))
    }

    /// Saves the trained model to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a trained model from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}
