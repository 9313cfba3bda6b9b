//! The persisted per-metric surrogate.
//!
//! A `SurrogateModel` is everything needed to reproduce predictions and
//! attributions for new parameter samples: the fitted ensemble, the ordered
//! parameter names it was trained on and the settings that produced it. It
//! is stored as human-readable TOML.

use crate::attribution::{self, Attribution, AttributionError, AttributionMode};
use crate::data::Table;
use crate::forest::{Forest, ForestError};
use crate::search::Hyperparameters;
use crate::tree::SplitRule;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// File extension of persisted models.
pub const MODEL_EXTENSION: &str = "model";

/// A fitted surrogate for one outcome metric.
///
/// Field order matters for TOML: plain values must precede tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurrogateModel {
    pub metric: String,
    /// Run seed the metric's random stream was derived from.
    pub seed: u64,
    pub split_rule: SplitRule,
    /// Parameter names in the column order the ensemble expects.
    pub feature_names: Vec<String>,
    pub hyperparameters: Hyperparameters,
    pub forest: Forest,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The model for '{metric}' is corrupt: {reason}")]
    Corrupt { metric: String, reason: String },
    #[error("The samples lack the parameter column '{0}' the model was trained on.")]
    MissingFeature(String),
    #[error("Prediction failed: {0}")]
    Forest(#[from] ForestError),
    #[error("Attribution failed: {0}")]
    Attribution(#[from] AttributionError),
}

impl SurrogateModel {
    /// Saves the model to a file in TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file and checks its structure.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ModelError> {
        let corrupt = |reason: String| ModelError::Corrupt {
            metric: self.metric.clone(),
            reason,
        };
        if self.forest.n_features() != self.feature_names.len() {
            return Err(corrupt(format!(
                "{} feature names for an ensemble over {} columns",
                self.feature_names.len(),
                self.forest.n_features()
            )));
        }
        if !self.forest.is_well_formed() {
            return Err(corrupt("the tree structure is inconsistent".to_string()));
        }
        Ok(())
    }

    /// Predicts the metric for every row of `samples`.
    ///
    /// Columns are matched by name; extra columns are ignored and the order
    /// of the table's columns does not matter.
    pub fn predict(&self, samples: &Table) -> Result<Array1<f64>, ModelError> {
        let x = self.design_matrix(samples)?;
        Ok(self.forest.predict(x.view())?)
    }

    /// Attributes every row of `samples` to the model's parameters.
    pub fn explain(
        &self,
        samples: &Table,
        mode: AttributionMode,
        pool: &rayon::ThreadPool,
    ) -> Result<Attribution, ModelError> {
        let x = self.design_matrix(samples)?;
        Ok(attribution::attribute(&self.forest, x.view(), mode, pool)?)
    }

    fn design_matrix(&self, samples: &Table) -> Result<Array2<f64>, ModelError> {
        let mut x = Array2::zeros((samples.n_rows(), self.feature_names.len()));
        for (j, name) in self.feature_names.iter().enumerate() {
            let column = samples
                .column(name)
                .map_err(|_| ModelError::MissingFeature(name.clone()))?;
            x.column_mut(j).assign(&column);
        }
        Ok(x)
    }
}
