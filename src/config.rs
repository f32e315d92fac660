use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "voicedesk.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    /// Host the carrier can reach from the outside, used when answering the
    /// incoming-call webhook with the media-stream URL.
    pub public_host: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub realtime: RealtimeConfig,
    pub transfer: TransferConfig,
    pub callrecord: Option<CallRecordConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Falls back to OPENAI_API_KEY when unset.
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub temperature: Option<f32>,
}

/// Tuning constants for the transfer state machine. The defaults are
/// empirical, validate them against real carrier callback latency.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConfig {
    /// Delay between arming a transfer and closing the media socket, so the
    /// agent's announcement can finish playing.
    pub drain_grace_ms: u64,
    /// How long to wait for the carrier to acknowledge the socket close
    /// before proceeding anyway.
    pub close_ack_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum CallRecordConfig {
    Local { root: String },
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
            temperature: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            drain_grace_ms: 3000,
            close_ack_timeout_ms: 3000,
        }
    }
}

impl Default for CallRecordConfig {
    fn default() -> Self {
        #[cfg(target_os = "windows")]
        let root = "./callrecords".to_string();
        #[cfg(not(target_os = "windows"))]
        let root = "/tmp/callrecords".to_string();
        Self::Local { root }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            public_host: "localhost:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            realtime: RealtimeConfig::default(),
            transfer: TransferConfig::default(),
            callrecord: Some(CallRecordConfig::default()),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
