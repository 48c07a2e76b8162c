//! TOML configuration for a controller deployment.
//!
//! One file describes the broker endpoint, session tuning and the pin/topic
//! wiring. Everything except the broker identity has a default, so a minimal
//! file is three lines.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::QoS;
use crate::pins::PinPumpOptions;
use crate::session::{RetryPolicy, SessionOptions};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub client_id: String,
    pub broker_addr: String,
    pub broker_port: u16,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pins: PinsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub connect_attempts: u32,
    pub retry_pause_ms: u64,
    pub cooldown_ms: u64,
    pub connack_timeout_ms: u64,
    pub input_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            connect_attempts: policy.connect_attempts,
            retry_pause_ms: policy.retry_pause.as_millis() as u64,
            cooldown_ms: policy.cooldown.as_millis() as u64,
            connack_timeout_ms: policy.connack_timeout.as_millis() as u64,
            input_timeout_ms: policy.input_timeout.as_millis() as u64,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            connect_attempts: config.connect_attempts,
            retry_pause: Duration::from_millis(config.retry_pause_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
            connack_timeout: Duration::from_millis(config.connack_timeout_ms),
            input_timeout: Duration::from_millis(config.input_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PinsConfig {
    pub inputs: Vec<InputPinConfig>,
    pub outputs: Vec<OutputPinConfig>,
    /// QoS for published pin state messages.
    pub publish_qos: QoS,
    /// Whether pin state messages are retained by the broker.
    pub retain: bool,
}

impl Default for PinsConfig {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            publish_qos: QoS::AtLeastOnce,
            retain: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputPinConfig {
    pub pin: u8,
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputPinConfig {
    pub pin: u8,
    pub topic: String,
}

impl SessionConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::new(
            self.client_id.clone(),
            self.broker_addr.clone(),
            self.broker_port,
        )
        .with_keep_alive(Duration::from_secs(self.keep_alive_secs))
        .with_buffer_capacity(self.buffer_capacity)
        .with_retry(RetryPolicy::from(&self.retry))
    }

    /// Input pin number to publish topic.
    pub fn input_topic_map(&self) -> HashMap<u8, String> {
        self.pins
            .inputs
            .iter()
            .map(|input| (input.pin, input.topic.clone()))
            .collect()
    }

    /// Output pin number to command topic, for registering output handlers.
    pub fn output_topic_map(&self) -> HashMap<u8, String> {
        self.pins
            .outputs
            .iter()
            .map(|output| (output.pin, output.topic.clone()))
            .collect()
    }

    pub fn pump_options(&self) -> PinPumpOptions {
        PinPumpOptions {
            qos: self.pins.publish_qos,
            retain: self.pins.retain,
        }
    }
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_buffer_capacity() -> usize {
    256
}
