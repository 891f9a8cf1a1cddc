use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_FPS: u32 = 10;
const DEFAULT_QUALITY: u8 = 80;
const DEFAULT_MAX_WIDTH: u32 = 1280;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 30;
const DEFAULT_RECONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_REAP_INTERVAL_SECS: u64 = 5;

/// One configured source. Identified by `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub url: String,
    pub name: String,
}

impl StreamDescriptor {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
        }
    }
}

/// Pipeline tunables shared by every session.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub fps: u32,
    /// JPEG quality, 1..=100.
    pub quality: u8,
    /// Frames wider than this are downsampled. 0 disables downsampling.
    pub max_width: u32,
    /// Consecutive open failures before a session enters cooldown.
    pub max_retries: u32,
    pub retry_interval: Duration,
    /// Passed to transports as their connect/read timeout.
    pub reconnect_timeout: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            quality: DEFAULT_QUALITY,
            max_width: DEFAULT_MAX_WIDTH,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            reconnect_timeout: Duration::from_secs(DEFAULT_RECONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            reap_interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
        }
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.quality) {
            return Err(anyhow!("quality must be between 1 and 100"));
        }
        if self.fps == 0 {
            return Err(anyhow!("fps must be greater than zero"));
        }
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be at least 1"));
        }
        if self.idle_timeout.is_zero() {
            return Err(anyhow!("idle timeout must be greater than zero"));
        }
        if self.reap_interval.is_zero() {
            return Err(anyhow!("reap interval must be greater than zero"));
        }
        Ok(())
    }

    /// Minimum spacing between pulls for the configured frame rate.
    pub fn frame_interval(&self) -> Duration {
        if self.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1000 / self.fps).max(1) as u64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub addr: String,
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct StillframeConfig {
    pub streams: Vec<StreamDescriptor>,
    pub tunables: Tunables,
    pub api: ApiSettings,
}

// The original deployment format is a bare array of streams; both shapes load.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConfigFileShape {
    Full(StillframeConfigFile),
    Streams(Vec<StreamDescriptor>),
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StillframeConfigFile {
    streams: Option<Vec<StreamDescriptor>>,
    capture: Option<CaptureConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    fps: Option<u32>,
    quality: Option<u8>,
    max_width: Option<u32>,
    max_retries: Option<u32>,
    retry_interval_secs: Option<u64>,
    reconnect_timeout_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    reap_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    login: Option<String>,
    password: Option<String>,
}

impl StillframeConfig {
    /// Load from `STILLFRAME_CONFIG` (or `./config.json` when present), then
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var("STILLFRAME_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Same as [`StillframeConfig::load`] with an explicit file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                read_config_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                log::warn!("no config file found; starting with an empty stream list");
                StillframeConfigFile::default()
            }
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StillframeConfigFile) -> Self {
        let defaults = Tunables::default();
        let capture = file.capture.unwrap_or_default();
        let tunables = Tunables {
            fps: capture.fps.unwrap_or(defaults.fps),
            quality: capture.quality.unwrap_or(defaults.quality),
            max_width: capture.max_width.unwrap_or(defaults.max_width),
            max_retries: capture.max_retries.unwrap_or(defaults.max_retries),
            retry_interval: capture
                .retry_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_interval),
            reconnect_timeout: capture
                .reconnect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_timeout),
            idle_timeout: capture
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            reap_interval: capture
                .reap_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.reap_interval),
        };
        let api = file.api.unwrap_or_default();
        Self {
            streams: file.streams.unwrap_or_default(),
            tunables,
            api: ApiSettings {
                addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
                login: api.login.unwrap_or_default(),
                password: api.password.unwrap_or_default(),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_string("STILLFRAME_API_ADDR") {
            self.api.addr = addr;
        } else if env_string("STILLFRAME_HOST").is_some() || env_string("STILLFRAME_PORT").is_some()
        {
            let (host, port) = self
                .api
                .addr
                .rsplit_once(':')
                .map(|(h, p)| (h.to_string(), p.to_string()))
                .unwrap_or_else(|| (self.api.addr.clone(), "8080".to_string()));
            let host = env_string("STILLFRAME_HOST").unwrap_or(host);
            let port = match env_parse::<u16>("STILLFRAME_PORT")? {
                Some(port) => port.to_string(),
                None => port,
            };
            self.api.addr = format!("{}:{}", host, port);
        }
        if let Some(login) = env_string("STILLFRAME_LOGIN") {
            self.api.login = login;
        }
        if let Some(password) = env_string("STILLFRAME_PASSWORD") {
            self.api.password = password;
        }
        if let Some(quality) = env_parse("STILLFRAME_QUALITY")? {
            self.tunables.quality = quality;
        }
        if let Some(fps) = env_parse("STILLFRAME_FPS")? {
            self.tunables.fps = fps;
        }
        if let Some(max_width) = env_parse("STILLFRAME_MAX_WIDTH")? {
            self.tunables.max_width = max_width;
        }
        if let Some(max_retries) = env_parse("STILLFRAME_MAX_RETRIES")? {
            self.tunables.max_retries = max_retries;
        }
        if let Some(secs) = env_parse("STILLFRAME_RETRY_INTERVAL_SECS")? {
            self.tunables.retry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("STILLFRAME_RECONNECT_TIMEOUT_SECS")? {
            self.tunables.reconnect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("STILLFRAME_IDLE_TIMEOUT_SECS")? {
            self.tunables.idle_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.tunables.validate()?;
        for (index, stream) in self.streams.iter_mut().enumerate() {
            stream.url = stream.url.trim().to_string();
            if stream.url.is_empty() {
                return Err(anyhow!("stream {} has an empty url", index));
            }
            if stream.name.trim().is_empty() {
                return Err(anyhow!("stream {} ({}) has an empty name", index, stream.url));
            }
        }
        if self.api.login.is_empty() || self.api.password.is_empty() {
            return Err(anyhow!(
                "api login and password must be configured (STILLFRAME_LOGIN / STILLFRAME_PASSWORD)"
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<StillframeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let shape: ConfigFileShape = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(match shape {
        ConfigFileShape::Full(file) => file,
        ConfigFileShape::Streams(streams) => StillframeConfigFile {
            streams: Some(streams),
            ..StillframeConfigFile::default()
        },
    })
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tunables_are_valid() {
        Tunables::default().validate().unwrap();
    }

    #[test]
    fn tunables_reject_out_of_range_quality() {
        let tunables = Tunables {
            quality: 0,
            ..Tunables::default()
        };
        assert!(tunables.validate().is_err());
    }

    #[test]
    fn frame_interval_follows_fps() {
        let tunables = Tunables {
            fps: 4,
            ..Tunables::default()
        };
        assert_eq!(tunables.frame_interval(), Duration::from_millis(250));
    }

    #[test]
    fn file_defaults_fill_missing_sections() {
        let cfg = StillframeConfig::from_file(StillframeConfigFile::default());
        assert!(cfg.streams.is_empty());
        assert_eq!(cfg.tunables, Tunables::default());
        assert_eq!(cfg.api.addr, DEFAULT_API_ADDR);
    }
}
