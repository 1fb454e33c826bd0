//! Explicit run configuration, applying the same collapse-to-one-entry-
//! point redesign `Tiling::build(params)` uses one level up: every input
//! the CLI driver parses lands in one `Config` struct, validated once, and
//! threaded explicitly into `Net::new`.

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    DataXData,
    DataXModel,
}

impl std::str::FromStr for Parallelism {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "data_x_data" | "dataxdata" | "data-x-data" => Ok(Parallelism::DataXData),
            "data_x_model" | "dataxmodel" | "data-x-model" => Ok(Parallelism::DataXModel),
            other => Err(EngineError::ConfigInvalid(format!(
                "unknown parallelism strategy '{other}', expected data_x_data or data_x_model"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Text,
    Binary,
}

impl std::str::FromStr for InputType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" | "tsv" => Ok(InputType::Text),
            "binary" | "bin" => Ok(InputType::Binary),
            other => Err(EngineError::ConfigInvalid(format!(
                "unknown input type '{other}', expected text or binary"
            ))),
        }
    }
}

impl InputType {
    pub fn extension(self) -> &'static str {
        match self {
            InputType::Text => "tsv",
            InputType::Binary => "bin",
        }
    }
}

const VALID_NNEURONS: [u32; 4] = [1024, 4096, 16384, 65536];
const VALID_NLAYERS: [u32; 3] = [120, 480, 1920];
const BIAS_TABLE: [(u32, f64); 4] = [
    (1024, -0.3),
    (4096, -0.35),
    (16384, -0.4),
    (65536, -0.45),
];

/// ReLU_cap's upper clamp, fixed by the benchmark contract.
pub const RELU_CAP: f64 = 32.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub n_neurons: u32,
    pub n_layers: u32,
    pub input_prefix: String,
    pub layer_prefix: String,
    pub parallelism: Parallelism,
    pub input_type: InputType,
}

impl Config {
    pub fn new(
        n_neurons: u32,
        n_layers: u32,
        input_prefix: impl Into<String>,
        layer_prefix: impl Into<String>,
        parallelism: Parallelism,
        input_type: InputType,
    ) -> Result<Self> {
        let cfg = Config {
            n_neurons,
            n_layers,
            input_prefix: input_prefix.into(),
            layer_prefix: layer_prefix.into(),
            parallelism,
            input_type,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !VALID_NNEURONS.contains(&self.n_neurons) {
            return Err(EngineError::ConfigInvalid(format!(
                "Nneurons must be one of {VALID_NNEURONS:?}, got {}",
                self.n_neurons
            )));
        }
        if !VALID_NLAYERS.contains(&self.n_layers) {
            return Err(EngineError::ConfigInvalid(format!(
                "Nlayers must be one of {VALID_NLAYERS:?}, got {}",
                self.n_layers
            )));
        }
        Ok(())
    }

    /// The fixed per-layer bias for this run's neuron count.
    pub fn bias_value(&self) -> Result<f64> {
        Self::bias_of(self.n_neurons)
    }

    pub fn bias_of(n_neurons: u32) -> Result<f64> {
        BIAS_TABLE
            .iter()
            .find(|(n, _)| *n == n_neurons)
            .map(|(_, b)| *b)
            .ok_or_else(|| {
                EngineError::ConfigInvalid(format!("no bias defined for Nneurons={n_neurons}"))
            })
    }

    pub fn feature_file(&self) -> String {
        format!(
            "{}/sparse-images-{}.{}",
            self.input_prefix,
            self.n_neurons,
            self.input_type.extension()
        )
    }

    pub fn category_file(&self) -> String {
        format!(
            "{}/neuron{}-l{}-categories.{}",
            self.layer_prefix,
            self.n_neurons,
            self.n_layers,
            self.input_type.extension()
        )
    }

    pub fn layer_file(&self, layer_index: u32) -> String {
        format!(
            "{}/neuron{}/n{}-l{}.{}",
            self.layer_prefix,
            self.n_neurons,
            self.n_neurons,
            layer_index + 1,
            self.input_type.extension()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_neuron_count() {
        let err = Config::new(2000, 120, "in", "layers", Parallelism::DataXData, InputType::Text);
        assert!(matches!(err, Err(EngineError::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_unknown_layer_count() {
        let err = Config::new(1024, 100, "in", "layers", Parallelism::DataXData, InputType::Text);
        assert!(matches!(err, Err(EngineError::ConfigInvalid(_))));
    }

    #[test]
    fn bias_table_matches_benchmark_contract() {
        assert_eq!(Config::bias_of(1024).unwrap(), -0.3);
        assert_eq!(Config::bias_of(4096).unwrap(), -0.35);
        assert_eq!(Config::bias_of(16384).unwrap(), -0.4);
        assert_eq!(Config::bias_of(65536).unwrap(), -0.45);
    }

    #[test]
    fn file_paths_follow_directory_layout() {
        let cfg = Config::new(1024, 120, "inputs", "layers", Parallelism::DataXData, InputType::Binary)
            .unwrap();
        assert_eq!(cfg.feature_file(), "inputs/sparse-images-1024.bin");
        assert_eq!(cfg.category_file(), "layers/neuron1024-l120-categories.bin");
        assert_eq!(cfg.layer_file(0), "layers/neuron1024/n1024-l1.bin");
    }
}
