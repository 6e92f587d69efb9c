//! JSON configuration, loaded with `serde_json` and validated by hand
//! into a typed [`ClientConfig`]. Unknown keys are ignored (serde's
//! default behavior); a missing key with no default is a
//! [`ConfigError::MissingKey`] — a fatal configuration error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use defl_aggregate::AggregatorKind;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing required config key: {0}")]
    MissingKey(&'static str),
    #[error("invalid value for `host`: {0:?} (expected \"host:port\")")]
    InvalidHost(String),
    #[error("unknown aggregator: {0:?}")]
    UnknownAggregator(String),
    #[error("unknown attack: {0:?}")]
    UnknownAttack(String),
    #[error("unknown task: {0:?}")]
    UnknownTask(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Cifar10,
    Sentiment140,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attack {
    None,
    Gaussian,
    Sign,
    Label,
}

/// Parsed, validated client configuration. Built by [`ClientConfig::load`]
/// from the raw JSON document (`RawConfig`); every field here is either
/// required (and therefore present) or has the documented default.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_host: String,
    pub consensus_port: u16,
    pub obsido_port: u16,
    pub task: Task,
    pub batch_size: u32,
    pub local_train_steps: u32,
    pub aggregator: AggregatorKind,
    pub num_byzantine: usize,
    pub attack: Attack,
    pub gaussian_attack_factor: Option<f32>,
    pub signflip_attack_factor: Option<f32>,
    pub fetch_ms: u64,
    pub gst_ms: u64,
    pub save_freq: u64,
    pub init_model_path: Option<PathBuf>,
    pub data_config: serde_json::Value,
    pub env: HashMap<String, String>,
    pub client_name: Option<String>,
}

/// Mirrors the JSON document's keys one-for-one so `serde_json` can parse
/// it before hand-validation maps it onto [`ClientConfig`]. Every field is
/// `Option` here regardless of whether it's ultimately required — that
/// distinction is `ClientConfig::load`'s job, not serde's.
#[derive(Debug, Deserialize)]
struct RawConfig {
    host: Option<String>,
    obsido_port: Option<u16>,
    task: Option<String>,
    batch_size: Option<u32>,
    local_train_steps: Option<u32>,
    aggregator: Option<String>,
    multikrum_factor: Option<usize>,
    num_byzantine: Option<usize>,
    #[serde(default)]
    attack: Option<String>,
    gaussian_attack_factor: Option<f32>,
    signflip_attack_factor: Option<f32>,
    fetch: Option<u64>,
    gst: Option<u64>,
    #[serde(default)]
    save_freq: Option<u64>,
    init_model_path: Option<PathBuf>,
    #[serde(default)]
    data_config: Option<serde_json::Value>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    client_name: Option<String>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = serde_json::from_str(&text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let host_field = raw.host.ok_or(ConfigError::MissingKey("host"))?;
        let (server_host, consensus_port) = host_field
            .rsplit_once(':')
            .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
            .ok_or_else(|| ConfigError::InvalidHost(host_field.clone()))?;

        let task = match raw.task.ok_or(ConfigError::MissingKey("task"))?.as_str() {
            "cifar10" => Task::Cifar10,
            "sentiment140" => Task::Sentiment140,
            other => return Err(ConfigError::UnknownTask(other.to_string())),
        };

        let aggregator_name = raw.aggregator.ok_or(ConfigError::MissingKey("aggregator"))?;
        let aggregator = match aggregator_name.as_str() {
            "fedavg" => AggregatorKind::Mean,
            "median" => AggregatorKind::Median,
            "trimmedmean" => AggregatorKind::TrimmedMean,
            "krum" => AggregatorKind::MultiKrum { m: 1 },
            "multikrum" => AggregatorKind::MultiKrum {
                m: raw
                    .multikrum_factor
                    .ok_or(ConfigError::MissingKey("multikrum_factor"))?,
            },
            other => return Err(ConfigError::UnknownAggregator(other.to_string())),
        };

        let attack = match raw.attack.as_deref().unwrap_or("none") {
            "none" => Attack::None,
            "gaussian" => Attack::Gaussian,
            "sign" => Attack::Sign,
            "label" => Attack::Label,
            other => return Err(ConfigError::UnknownAttack(other.to_string())),
        };
        if attack == Attack::Gaussian && raw.gaussian_attack_factor.is_none() {
            return Err(ConfigError::MissingKey("gaussian_attack_factor"));
        }
        if attack == Attack::Sign && raw.signflip_attack_factor.is_none() {
            return Err(ConfigError::MissingKey("signflip_attack_factor"));
        }

        Ok(ClientConfig {
            server_host,
            consensus_port,
            obsido_port: raw.obsido_port.ok_or(ConfigError::MissingKey("obsido_port"))?,
            task,
            batch_size: raw.batch_size.ok_or(ConfigError::MissingKey("batch_size"))?,
            local_train_steps: raw
                .local_train_steps
                .ok_or(ConfigError::MissingKey("local_train_steps"))?,
            aggregator,
            num_byzantine: raw
                .num_byzantine
                .ok_or(ConfigError::MissingKey("num_byzantine"))?,
            attack,
            gaussian_attack_factor: raw.gaussian_attack_factor,
            signflip_attack_factor: raw.signflip_attack_factor,
            fetch_ms: raw.fetch.ok_or(ConfigError::MissingKey("fetch"))?,
            gst_ms: raw.gst.ok_or(ConfigError::MissingKey("gst"))?,
            save_freq: raw.save_freq.unwrap_or(0),
            init_model_path: raw.init_model_path,
            data_config: raw.data_config.unwrap_or(serde_json::Value::Null),
            env: raw.env.unwrap_or_default(),
            client_name: raw.client_name,
        })
    }
}
