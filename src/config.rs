use crate::core::aggregate::AggregateSettings;
use crate::core::classifier::ClassifierSettings;
use crate::core::fetcher::RetryPolicy;
use crate::core::hash::FingerprintMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid setting {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Every tunable of the triage pipeline. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub fetch_concurrency: usize,
    pub classify_concurrency: usize,
    pub hash_workers: usize,
    pub fetch_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub max_labels: usize,
    pub service_min_confidence: f32,
    pub label_confidence_floor: f32,
    pub cluster_threshold: u32,
    pub fingerprint_mode: FingerprintMode,
    pub low_sample_threshold: usize,
    pub max_representative_images: usize,
    pub labels_endpoint: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 15,
            classify_concurrency: 5,
            hash_workers: 2,
            fetch_attempts: 3,
            retry_delay_ms: 300,
            request_timeout_secs: 10,
            max_labels: 15,
            service_min_confidence: 30.0,
            label_confidence_floor: 50.0,
            cluster_threshold: 3,
            fingerprint_mode: FingerprintMode::ContentDigest,
            low_sample_threshold: 3,
            max_representative_images: 3,
            labels_endpoint: None,
        }
    }
}

impl PipelineConfig {
    /// `<config_dir>/claimcull/config.json`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("claimcull").join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: PipelineConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `explicit` if given, else the default path if it exists, else defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                log::info!("Using config {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("fetch_concurrency", self.fetch_concurrency),
            ("classify_concurrency", self.classify_concurrency),
            ("hash_workers", self.hash_workers),
            ("max_labels", self.max_labels),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if self.fetch_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "fetch_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        for (field, value) in [
            ("service_min_confidence", self.service_min_confidence),
            ("label_confidence_floor", self.label_confidence_floor),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    message: format!("{} is outside 0-100", value),
                });
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.fetch_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn classifier_settings(&self) -> ClassifierSettings {
        ClassifierSettings {
            max_labels: self.max_labels,
            service_min_confidence: self.service_min_confidence,
            decision_floor: self.label_confidence_floor,
        }
    }

    pub fn aggregate_settings(&self) -> AggregateSettings {
        AggregateSettings {
            max_representative_images: self.max_representative_images,
            low_sample_threshold: self.low_sample_threshold,
        }
    }
}
