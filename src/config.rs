//! Configuration management with serde integration
//!
//! A [`RuntimeConfig`] can be built in code, read from a JSON file, or taken
//! from `ECHOLLAMA_*` environment variables. [`RuntimeConfig::to_parameters`]
//! turns it into the named parameter list that model loading consumes.
//!
//! ## Example
//!
//! ```rust
//! use echollama::config::RuntimeConfig;
//!
//! let mut config = RuntimeConfig::default();
//! config.model.path = Some("model.gguf".into());
//! config.sampling.temperature = 0.7;
//! assert!(config.validate().is_ok());
//!
//! let json = serde_json::to_string_pretty(&config).unwrap();
//! let loaded: RuntimeConfig = serde_json::from_str(&json).unwrap();
//! assert_eq!(loaded.sampling.temperature, 0.7);
//! ```

use crate::{
    error::{EchoError, Result},
    model::ModelParameter,
    vision::VisionConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub vision: VisionConfig,
}

/// Model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the model file
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Number of layers to offload to the GPU
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            gpu_layers: default_gpu_layers(),
        }
    }
}

/// Per-session context configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context size (cells per session)
    #[serde(default = "default_context_size")]
    pub n_ctx: u32,
    /// Prompt batch size, defaults to the context size
    #[serde(default)]
    pub n_batch: Option<u32>,
    /// Worker threads, 0 lets the backend decide
    #[serde(default)]
    pub n_threads: i32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            n_ctx: default_context_size(),
            n_batch: None,
            n_threads: 0,
        }
    }
}

/// Sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = deterministic, higher = more random)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Top-k sampling (0 = disabled)
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    /// Top-p (nucleus) sampling (1.0 = disabled)
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Minimum probability for a token to be considered
    #[serde(default = "default_min_p")]
    pub min_p: f32,
    /// Repetition penalty (1.0 = no penalty)
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default)]
    pub seed: Option<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            repeat_penalty: default_repeat_penalty(),
            seed: None,
        }
    }
}

fn default_gpu_layers() -> i32 {
    99
}
fn default_context_size() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.8
}
fn default_top_k() -> i32 {
    40
}
fn default_top_p() -> f32 {
    1.0
}
fn default_min_p() -> f32 {
    0.05
}
fn default_repeat_penalty() -> f32 {
    1.0
}

impl RuntimeConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EchoError::ConfigurationError(format!("Failed to read config file: {}", e))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            EchoError::ConfigurationError(format!("Failed to parse JSON config: {}", e))
        })
    }

    /// Save configuration to a JSON file
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            EchoError::ConfigurationError(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            EchoError::ConfigurationError(format!("Failed to write config file: {}", e))
        })
    }

    /// Defaults overridden by environment variables
    ///
    /// - `ECHOLLAMA_MODEL_PATH`
    /// - `ECHOLLAMA_CONTEXT_SIZE`
    /// - `ECHOLLAMA_TEMPERATURE`
    /// - `ECHOLLAMA_TOP_K`
    /// - `ECHOLLAMA_TOP_P`
    /// - `ECHOLLAMA_REPETITION_PENALTY`
    /// - `ECHOLLAMA_GPU_LAYERS`
    /// - `ECHOLLAMA_MMPROJ_PATH`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `ECHOLLAMA_*` variables that are set
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("ECHOLLAMA_MODEL_PATH") {
            self.model.path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("ECHOLLAMA_MMPROJ_PATH") {
            self.vision.mmproj_path = Some(PathBuf::from(path));
        }
        if let Some(v) = env_parse("ECHOLLAMA_GPU_LAYERS", "GPU layers")? {
            self.model.gpu_layers = v;
        }
        if let Some(v) = env_parse("ECHOLLAMA_CONTEXT_SIZE", "context size")? {
            self.context.n_ctx = v;
        }
        if let Some(v) = env_parse("ECHOLLAMA_TEMPERATURE", "temperature")? {
            self.sampling.temperature = v;
        }
        if let Some(v) = env_parse("ECHOLLAMA_TOP_K", "top_k")? {
            self.sampling.top_k = v;
        }
        if let Some(v) = env_parse("ECHOLLAMA_TOP_P", "top_p")? {
            self.sampling.top_p = v;
        }
        if let Some(v) = env_parse("ECHOLLAMA_REPETITION_PENALTY", "repetition penalty")? {
            self.sampling.repeat_penalty = v;
        }
        Ok(())
    }

    /// Merge with another configuration, overriding values
    pub fn merge(&mut self, other: Self) {
        if other.model.path.is_some() {
            self.model = other.model;
        }
        if other.vision.mmproj_path.is_some() {
            self.vision = other.vision;
        }
        self.context = other.context;
        self.sampling = other.sampling;
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match &self.model.path {
            Some(path) if !path.as_os_str().is_empty() => {}
            _ => {
                return Err(EchoError::ConfigurationError(
                    "Model path cannot be empty".to_string(),
                ))
            }
        }

        if self.context.n_ctx == 0 {
            return Err(EchoError::ConfigurationError(
                "Context size must be greater than 0".to_string(),
            ));
        }

        if self.context.n_batch == Some(0) {
            return Err(EchoError::ConfigurationError(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.sampling.temperature < 0.0 {
            return Err(EchoError::ConfigurationError(
                "Temperature cannot be negative".to_string(),
            ));
        }

        if self.sampling.top_p <= 0.0 || self.sampling.top_p > 1.0 {
            return Err(EchoError::ConfigurationError(
                "Top-p must be between 0 and 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.sampling.min_p) {
            return Err(EchoError::ConfigurationError(
                "Min-p must be between 0 and 1".to_string(),
            ));
        }

        if self.sampling.repeat_penalty <= 0.0 {
            return Err(EchoError::ConfigurationError(
                "Repeat penalty must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Named parameters for [`crate::Runtime::load_model`]
    pub fn to_parameters(&self) -> Vec<ModelParameter> {
        let mut params = vec![
            ModelParameter::float("temperature", self.sampling.temperature),
            ModelParameter::int("top_k", self.sampling.top_k as i64),
            ModelParameter::float("top_p", self.sampling.top_p),
            ModelParameter::float("min_p", self.sampling.min_p),
            ModelParameter::float("repetition_penalty", self.sampling.repeat_penalty),
            ModelParameter::int("context_size", self.context.n_ctx as i64),
            ModelParameter::int("gpu_layers", self.model.gpu_layers as i64),
        ];
        if let Some(n_batch) = self.context.n_batch {
            params.push(ModelParameter::int("n_batch", n_batch as i64));
        }
        if self.context.n_threads > 0 {
            params.push(ModelParameter::int("threads", self.context.n_threads as i64));
        }
        if let Some(seed) = self.sampling.seed {
            params.push(ModelParameter::int("seed", seed as i64));
        }
        params
    }
}

fn env_parse<T>(name: &str, what: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| EchoError::ConfigurationError(format!("Invalid {}: {}", what, e))),
        Err(_) => Ok(None),
    }
}

/// Preset configurations for common use cases
pub mod presets {
    use super::*;

    /// Balanced conversational settings
    pub fn chat() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.sampling.temperature = 0.7;
        config.sampling.top_p = 0.9;
        config
    }

    /// Near-deterministic answers
    pub fn precise() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.sampling.temperature = 0.1;
        config.sampling.top_k = 10;
        config.sampling.top_p = 0.9;
        config.sampling.repeat_penalty = 1.05;
        config
    }

    pub fn creative() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.sampling.temperature = 1.0;
        config.sampling.top_k = 60;
        config.sampling.top_p = 0.95;
        config.sampling.repeat_penalty = 1.1;
        config
    }

    /// Room for a 256-row image plus a conversation
    pub fn vision() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.context.n_ctx = 8192;
        config.sampling.temperature = 0.4;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoadParams, ParamValue};

    #[test]
    fn test_default_config() {
        let mut config = RuntimeConfig::default();
        assert!(config.validate().is_err());
        config.model.path = Some("model.gguf".into());
        assert!(config.validate().is_ok());
        assert_eq!(config.model.gpu_layers, 99);
        assert_eq!(config.context.n_ctx, 4096);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"sampling": {"temperature": 0.2}}"#).unwrap();
        assert_eq!(config.sampling.temperature, 0.2);
        assert_eq!(config.sampling.top_k, 40);
        assert_eq!(config.context.n_ctx, 4096);
        assert_eq!(config.vision.start_marker, "<start_of_image>");
    }

    #[test]
    fn test_presets() {
        assert!(presets::creative().sampling.temperature > 0.8);
        assert!(presets::precise().sampling.temperature < 0.2);
        assert!(presets::vision().context.n_ctx > 4096);
    }

    #[test]
    fn test_validation() {
        let mut config = RuntimeConfig::default();
        config.model.path = Some("model.gguf".into());
        config.sampling.temperature = -1.0;
        assert!(config.validate().is_err());

        config.sampling.temperature = 0.5;
        config.sampling.top_p = 0.0;
        assert!(config.validate().is_err());

        config.sampling.top_p = 1.0;
        config.context.n_batch = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parameters_round_trip_through_load_params() {
        let mut config = presets::precise();
        config.context.n_ctx = 1024;
        config.context.n_batch = Some(256);
        config.sampling.seed = Some(42);

        let params = config.to_parameters();
        assert!(params
            .iter()
            .any(|p| p.key == "top_k" && p.value == ParamValue::Int(10)));

        let settings = LoadParams::from_parameters(&params);
        assert_eq!(settings.context.n_ctx, 1024);
        assert_eq!(settings.context.n_batch, 256);
        assert_eq!(settings.sampling.top_k, 10);
        assert_eq!(settings.sampling.seed, 42);
        assert_eq!(settings.sampling.temperature, 0.1);
    }

    #[test]
    fn test_merge() {
        let mut base = RuntimeConfig::default();
        base.model.path = Some("base.gguf".into());

        let mut other = presets::creative();
        other.model.path = None;
        base.merge(other);
        assert_eq!(base.model.path, Some(PathBuf::from("base.gguf")));
        assert_eq!(base.sampling.top_k, 60);
    }
}
