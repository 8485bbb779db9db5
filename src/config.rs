//! JSON configuration, mirroring every key in spec §6's configuration
//! table. Grounded on `original_source/src/common/conf.hh`/`conf.cc` for
//! the key set, loaded with the same `config` crate the teacher crate
//! depends on.

use std::path::Path;

use serde::Deserialize;

use crate::errors::{InferflowError, Result};

fn default_backup_num() -> u32 {
    2
}
fn default_k() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_capacity() -> usize {
    16
}
fn default_batch_size() -> usize {
    32
}
fn default_max_batch_size() -> usize {
    64
}
fn default_inc_value() -> usize {
    8
}
fn default_dec_value() -> f64 {
    0.1
}
fn default_cdc_ratio() -> f64 {
    80.0
}
fn default_update_interval() -> u32 {
    10
}
fn default_recovery_time() -> u32 {
    10
}
fn default_to_vul_num() -> u32 {
    1
}
fn default_top_k() -> usize {
    1
}
fn default_history_length() -> usize {
    16
}
fn default_alpha() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncodeConfig {
    #[serde(default = "default_backup_num")]
    pub backup_num: u32,
    #[serde(default = "default_encoder_type")]
    pub encoder_type: String,
}

fn default_encoder_type() -> String {
    "linear".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecodeConfig {
    #[serde(default = "default_decoder_type")]
    pub decoder_type: String,
    pub decoder_ckpt: Option<String>,
    #[serde(default)]
    pub decoder_simulate: bool,
    #[serde(default)]
    pub decoder_simulate_ms: u64,
}

fn default_decoder_type() -> String {
    "linear".to_string()
}

impl DecodeConfig {
    pub fn validate(&self) -> Result<()> {
        match self.decoder_type.as_str() {
            "linear" | "distill" => Ok(()),
            other => Err(InferflowError::ConfigInvalid(format!(
                "decode_config.decoder_type: unknown value {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TritonConfig {
    pub scale: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessConfig {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    #[serde(default)]
    pub channel: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub width: u32,
}

fn default_format() -> String {
    "NHWC".to_string()
}
fn default_dtype() -> String {
    "uint8".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_filter_type")]
    pub r#type: String,
    #[serde(default = "default_cdc_ratio")]
    pub cdc_ratio: f64,
    #[serde(default = "default_feedback")]
    pub feedback: String,
}

fn default_filter_type() -> String {
    "manual".to_string()
}
fn default_feedback() -> String {
    "combinatorial".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_mode")]
    pub mode: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub batch_size_1: Option<usize>,
    pub batch_size_2: Option<usize>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_inc_value")]
    pub inc_value: usize,
    #[serde(default = "default_dec_value")]
    pub dec_value: f64,
}

fn default_batch_mode() -> String {
    "fixed".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub trace: String,
    #[serde(default)]
    pub start_time_slice: usize,
    pub region_id: u32,
    pub ip_list: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_update_mode")]
    pub update_mode: String,
    #[serde(default = "default_update_interval")]
    pub update_interval: u32,
    #[serde(default)]
    pub update_time_gap: u64,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_recovery_time")]
    pub recovery_time: u32,
    #[serde(default = "default_to_vul_num")]
    pub to_vul_num: u32,
    #[serde(default)]
    pub cee: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_history_length")]
    pub history_length: usize,
    #[serde(default = "default_alpha")]
    pub alpha_decrease: f64,
    #[serde(default = "default_alpha")]
    pub alpha_increase: f64,
    #[serde(default = "default_alpha")]
    pub eta_1: f64,
    #[serde(default = "default_alpha")]
    pub eta_2: f64,
    #[serde(default = "default_selection")]
    pub selection: String,
}

fn default_update_mode() -> String {
    "query".to_string()
}
fn default_algorithm() -> String {
    "baseline".to_string()
}
fn default_selection() -> String {
    "uniform".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArimaConfig {
    #[serde(default)]
    pub max_p: u32,
    #[serde(default)]
    pub max_d: u32,
    #[serde(default)]
    pub max_q: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub query_rate: f64,
    #[serde(default = "default_distribution")]
    pub query_arrival_distribution: String,
    pub workload_path: Option<String>,
}

fn default_distribution() -> String {
    "poisson".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_strategy() -> String {
    "lru".to_string()
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.use_cache && self.strategy != "lru" {
            return Err(InferflowError::ConfigInvalid(format!(
                "cache_config.strategy: unsupported strategy {:?}",
                self.strategy
            )));
        }
        if self.use_cache && self.capacity == 0 {
            return Err(InferflowError::ConfigInvalid(
                "cache_config.capacity must be greater than 0 when use_cache is set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration document, shared by the frontend and backend
/// binaries (each reads only the sections it needs).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node_number: u32,
    #[serde(default)]
    pub frontend_id: u32,
    #[serde(default = "default_k")]
    pub k: u32,
    pub encode_config: EncodeConfig,
    pub decode_config: DecodeConfig,
    pub triton_config: TritonConfig,
    pub preprocess_config: PreprocessConfig,
    pub filter_config: FilterConfig,
    pub batch_config: BatchConfig,
    #[serde(default)]
    pub backend_ips: Vec<ZoneConfig>,
    #[serde(default)]
    pub frontend_ips: Vec<String>,
    pub monitor_config: MonitorConfig,
    #[serde(default)]
    pub arima_config: ArimaConfig,
    #[serde(default)]
    pub client_config: ClientConfig,
    pub cache_config: CacheConfig,
}

impl Default for ArimaConfig {
    fn default() -> Self {
        ArimaConfig {
            max_p: 0,
            max_d: 0,
            max_q: 0,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            query_rate: 0.0,
            query_arrival_distribution: default_distribution(),
            workload_path: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InferflowError::ConfigInvalid(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Config> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Json))
            .build()
            .map_err(|e| InferflowError::ConfigInvalid(e.to_string()))?;
        let cfg: Config = settings
            .try_deserialize()
            .map_err(|e| InferflowError::ConfigInvalid(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        self.decode_config.validate()?;
        self.cache_config.validate()?;
        if !matches!(self.filter_config.r#type.as_str(), "manual" | "auto") {
            return Err(InferflowError::ConfigInvalid(format!(
                "filter_config.type: unknown value {:?}",
                self.filter_config.r#type
            )));
        }
        if crate::message::Scale::parse(&self.triton_config.scale).is_none() {
            return Err(InferflowError::ConfigInvalid(format!(
                "triton_config.scale: unknown value {:?}",
                self.triton_config.scale
            )));
        }
        if !matches!(self.preprocess_config.format.as_str(), "NHWC" | "NCHW") {
            return Err(InferflowError::ConfigInvalid(format!(
                "preprocess_config.format: unknown value {:?}",
                self.preprocess_config.format
            )));
        }
        Ok(())
    }
}

/// Per-zone trace file: `{ "data": [n0, n1, ...] }`, per spec §6.
#[derive(Debug, Clone, Deserialize)]
pub struct Trace {
    pub data: Vec<u32>,
}

impl Trace {
    pub fn load(path: impl AsRef<Path>) -> Result<Trace> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InferflowError::ConfigInvalid(format!("failed to read trace {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| InferflowError::ConfigInvalid(format!("invalid trace file: {}", e)))
    }
}
