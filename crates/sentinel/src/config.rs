//! Daemon configuration
//!
//! Loaded from the environment. The inference endpoints and the gateway URL
//! are required; everything else has defaults.

use std::time::Duration;

use serde::Deserialize;

use sentinel_lib::errors::SentinelError;
use sentinel_lib::inference::InferenceEndpoint;

#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    /// Fast classifier endpoint
    pub fast_classifier_url: String,
    pub fast_classifier_key: String,
    #[serde(default = "default_classifier_model")]
    pub fast_classifier_model: String,

    /// Deep analyzer endpoint
    pub deep_analyzer_url: String,
    pub deep_analyzer_key: String,
    #[serde(default = "default_analyzer_model")]
    pub deep_analyzer_model: String,

    /// Base URL of the remediation tool gateway
    pub tool_gateway_url: String,

    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// When false, incidents halt at unresolved and no tools run
    #[serde(default = "default_auto_heal")]
    pub auto_heal_enabled: bool,

    /// Log window size
    #[serde(default = "default_window_size")]
    pub log_lines_per_check: usize,

    /// Metrics sampling period in seconds
    #[serde(default = "default_check_interval")]
    pub log_check_interval: u64,

    /// Queue capacity for lossy bus subscribers (dashboard websockets)
    #[serde(default = "default_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Event history ring size, 0 disables
    #[serde(default = "default_bus_history")]
    pub event_bus_history: usize,
}

fn default_classifier_model() -> String {
    "llama-3.1-8b-instruct".to_string()
}

fn default_analyzer_model() -> String {
    "llama-4-scout".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_auto_heal() -> bool {
    true
}

fn default_window_size() -> usize {
    20
}

fn default_check_interval() -> u64 {
    5
}

fn default_bus_capacity() -> usize {
    256
}

fn default_bus_history() -> usize {
    1000
}

impl SentinelConfig {
    /// Load from environment variables; missing required endpoints are a
    /// startup failure
    pub fn load() -> Result<Self, SentinelError> {
        let source = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .map_err(|e| SentinelError::Config(e.to_string()))?;

        source
            .try_deserialize()
            .map_err(|e| SentinelError::Config(e.to_string()))
    }

    pub fn classifier_endpoint(&self) -> InferenceEndpoint {
        InferenceEndpoint {
            url: self.fast_classifier_url.clone(),
            api_key: self.fast_classifier_key.clone(),
            model: self.fast_classifier_model.clone(),
        }
    }

    pub fn analyzer_endpoint(&self) -> InferenceEndpoint {
        InferenceEndpoint {
            url: self.deep_analyzer_url.clone(),
            api_key: self.deep_analyzer_key.clone(),
            model: self.deep_analyzer_model.clone(),
        }
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.log_check_interval.max(1))
    }
}
