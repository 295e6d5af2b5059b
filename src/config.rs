//! Classification run configuration

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::backend::BackendOptions;
use crate::engine::labels::default_label_path;
use crate::engine::scheduler::InferenceScheduler;
use crate::error::PipelineError;
use crate::utils::image::ChannelOrder;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    pub input: InputConfig,
    pub copy: CopyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Target device, e.g. `CPU`, `GPU`, `HETERO:FPGA,CPU` or `REFERENCE`
    pub device: String,
    /// Asynchronous executions of the batch
    pub iterations: usize,
    pub top_k: usize,
    /// Bound on the whole run; unbounded when absent
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub model: PathBuf,
    /// Defaults to the model path with a `.labels` extension
    pub labels: Option<PathBuf>,
    /// Custom plugins xml file
    pub plugins: Option<PathBuf>,
    /// Architecture (.arch) file for FPGA devices
    pub arch_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub channel_order: ChannelOrder,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// `fallback`, `fast-aligned` or `checksummed`
    pub strategy: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }

    pub fn labels_path(&self) -> PathBuf {
        self.models
            .labels
            .clone()
            .unwrap_or_else(|| default_label_path(&self.models.model))
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            plugins: self.models.plugins.clone(),
            arch_file: self.models.arch_file.clone(),
        }
    }

    /// Reject settings that would fail the run, before anything is loaded
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.models.model.as_os_str().is_empty() {
            return Err(PipelineError::configuration(
                "model is required but not set",
            ));
        }
        if self.inference.iterations == 0 {
            return Err(PipelineError::configuration(
                "iterations must be at least 1",
            ));
        }
        if self.inference.top_k == 0 {
            return Err(PipelineError::configuration("top_k must be at least 1"));
        }
        if let Some(plugins) = &self.models.plugins {
            if !plugins.exists() {
                return Err(PipelineError::configuration(format!(
                    "plugins xml file {} does not exist",
                    plugins.display()
                )));
            }
        }
        if let Some(arch) = &self.models.arch_file {
            if !arch.exists() {
                return Err(PipelineError::configuration(format!(
                    "architecture file {} does not exist",
                    arch.display()
                )));
            }
        }
        Ok(())
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "CPU".to_string(),
            iterations: InferenceScheduler::DEFAULT_ITERATIONS,
            top_k: 10,
            timeout_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [inference]
            device = "REFERENCE"
            top_k = 3

            [models]
            model = "models/alexnet.xml"
            "#,
        )
        .unwrap();

        assert_eq!(config.inference.device, "REFERENCE");
        assert_eq!(config.inference.top_k, 3);
        assert_eq!(config.inference.iterations, 10);
        assert_eq!(config.input.channel_order, ChannelOrder::Bgr);
        assert!(config.copy.strategy.is_none());
        assert_eq!(config.labels_path(), PathBuf::from("models/alexnet.labels"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [inference]
            device = "CPU"
            iterations = 4
            top_k = 5
            timeout_secs = 30

            [models]
            model = "m.xml"
            labels = "imagenet.labels"

            [input]
            channel_order = "rgb"

            [copy]
            strategy = "fallback"
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.inference.iterations, 4);
        assert_eq!(config.inference.timeout_secs, Some(30));
        assert_eq!(config.input.channel_order, ChannelOrder::Rgb);
        assert_eq!(config.copy.strategy.as_deref(), Some("fallback"));
        assert_eq!(config.labels_path(), PathBuf::from("imagenet.labels"));
    }

    #[test]
    fn test_missing_plugins_file_rejected() {
        let mut config = Config::default();
        config.models.model = PathBuf::from("m.xml");
        config.models.plugins = Some(PathBuf::from("/nonexistent/plugins.xml"));

        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_backend_options_carry_device_files() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins.xml");
        let arch = dir.path().join("A10.arch");
        std::fs::write(&plugins, "<ie/>").unwrap();
        std::fs::write(&arch, "arch").unwrap();

        let mut config = Config::default();
        config.models.model = PathBuf::from("m.xml");
        config.models.plugins = Some(plugins.clone());
        config.models.arch_file = Some(arch.clone());

        assert!(config.validate().is_ok());
        let options = config.backend_options();
        assert_eq!(options.plugins, Some(plugins));
        assert_eq!(options.arch_file, Some(arch));
    }

    #[test]
    fn test_missing_model_and_zero_values_rejected() {
        assert!(Config::default().validate().is_err());

        let mut config = Config::default();
        config.models.model = PathBuf::from("m.xml");
        config.inference.top_k = 0;
        assert!(config.validate().is_err());
    }
}
