//! Runtime configuration
//!
//! Everything is read from environment variables at startup. A `.env` file
//! in the working directory is honored for local development.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::connectivity::ProbeConfig;
use crate::live_client::ClientConfig;
use crate::recorder::RecorderConfig;
use crate::router::{RouterConfig, SmsLinkStyle, DEFAULT_SENDER_ID, DEFAULT_SUPPORT_PHONE};
use crate::streamer::StreamerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub server_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub playback_buffer_chunks: usize,
    pub audio_scratch_dir: PathBuf,
    pub recordings_dir: PathBuf,
    pub chat_endpoint_url: Option<String>,
    pub chat_sender_id: String,
    pub support_phone: String,
    pub sms_link_style: SmsLinkStyle,
    pub connectivity_probe_url: String,
    pub connectivity_probe_interval: Duration,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// The `.env` file is skipped under test so tests stay hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let tmp = std::env::temp_dir();

        let server_url = var("LIVE_SERVER_URL").unwrap_or_else(|| ClientConfig::default().url);
        if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "LIVE_SERVER_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", server_url),
            ));
        }

        let max_reconnect_attempts = parse_or(&var, "MAX_RECONNECT_ATTEMPTS", 5u32)?;
        let reconnect_delay = Duration::from_millis(parse_or(&var, "RECONNECT_DELAY_MS", 2000u64)?);
        let playback_buffer_chunks = parse_or(&var, "PLAYBACK_BUFFER_CHUNKS", 5usize)?;
        if playback_buffer_chunks == 0 {
            return Err(ConfigError::InvalidValue(
                "PLAYBACK_BUFFER_CHUNKS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let audio_scratch_dir = var("AUDIO_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| tmp.join("kisan_live_audio"));
        let recordings_dir = var("RECORDINGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| tmp.join("kisan_live_recordings"));

        let chat_endpoint_url = var("CHAT_ENDPOINT_URL");
        let chat_sender_id = var("CHAT_SENDER_ID").unwrap_or_else(|| DEFAULT_SENDER_ID.to_string());
        let support_phone = var("SUPPORT_PHONE").unwrap_or_else(|| DEFAULT_SUPPORT_PHONE.to_string());
        let sms_link_style = match var("SMS_LINK_STYLE") {
            Some(style) => style
                .parse::<SmsLinkStyle>()
                .map_err(|e| ConfigError::InvalidValue("SMS_LINK_STYLE".to_string(), e))?,
            None => SmsLinkStyle::default(),
        };

        let connectivity_probe_url = var("CONNECTIVITY_PROBE_URL")
            .unwrap_or_else(|| "http://clients3.google.com/generate_204".to_string());
        let connectivity_probe_interval =
            Duration::from_secs(parse_or(&var, "CONNECTIVITY_PROBE_SECS", 15u64)?.max(1));

        Ok(Self {
            server_url,
            max_reconnect_attempts,
            reconnect_delay,
            playback_buffer_chunks,
            audio_scratch_dir,
            recordings_dir,
            chat_endpoint_url,
            chat_sender_id,
            support_phone,
            sms_link_style,
            connectivity_probe_url,
            connectivity_probe_interval,
        })
    }

    /// The chat endpoint, which only the text chat needs.
    pub fn chat_endpoint(&self) -> Result<&str, ConfigError> {
        self.chat_endpoint_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("CHAT_ENDPOINT_URL".to_string()))
    }

    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            url: self.server_url.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            base_reconnect_delay: self.reconnect_delay,
        }
    }

    pub fn streamer(&self) -> StreamerConfig {
        StreamerConfig {
            buffer_threshold: self.playback_buffer_chunks,
            scratch_dir: self.audio_scratch_dir.clone(),
            ..StreamerConfig::default()
        }
    }

    pub fn recorder(&self) -> RecorderConfig {
        RecorderConfig::default()
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig {
            support_phone: self.support_phone.clone(),
            sms_style: self.sms_link_style,
        }
    }

    pub fn probe(&self) -> ProbeConfig {
        ProbeConfig {
            url: self.connectivity_probe_url.clone(),
            interval: self.connectivity_probe_interval,
            timeout: Duration::from_secs(5),
        }
    }
}

fn parse_or<T, V>(var: &V, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{}': {}", raw, e))),
        None => Ok(default),
    }
}
