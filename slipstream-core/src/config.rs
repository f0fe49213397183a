//! Configuration for Slipstream.
//!
//! Settings live in a JSON file (`config.json`) that is created with defaults
//! on first use. Every façade operation re-reads it through [`ConfigSource`],
//! so edits apply to the next race without a restart. Directory locations come
//! from environment variables with XDG style fallbacks.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ledger::EligibilityCriteria;

pub const CONFIG_FILENAME: &str = "config.json";
pub const DATABASE_FILENAME: &str = "paused_events.sqlite";

const APP_DIR: &str = "slipstream";

/// Upper bound for `racing.reannounce_frequency`, one day in seconds.
pub const MAX_REANNOUNCE_FREQUENCY: f64 = 86_400.0;

static DURATION_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<w>\d+)w)?(?:(?P<d>\d+)d)?(?:(?P<h>\d+)h)?(?:(?P<m>\d+)m)?(?:(?P<s>\d+)s)?$")
});

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },

    #[error("Cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Editor failed: {reason}")]
    Editor { reason: String },
}

impl ConfigError {
    pub fn invalid(reason: impl fmt::Display) -> Self {
        ConfigError::Invalid {
            reason: reason.to_string(),
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Duration written as `1w2d3h4m5s`; every unit is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn as_duration(self) -> Duration {
        self.0
    }
}

impl FromStr for HumanDuration {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let pattern = DURATION_RE.as_ref().map_err(ConfigError::invalid)?;
        let captures = pattern
            .captures(value.trim())
            .filter(|_| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::invalid(format!("invalid duration {value:?}")))?;

        let mut seconds: u64 = 0;
        for (unit, scale) in [("w", 604_800), ("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
            if let Some(amount) = captures.name(unit) {
                let amount: u64 = amount
                    .as_str()
                    .parse()
                    .map_err(|e| ConfigError::invalid(format!("invalid duration {value:?}: {e}")))?;
                seconds = amount
                    .checked_mul(scale)
                    .and_then(|part| seconds.checked_add(part))
                    .ok_or_else(|| ConfigError::invalid(format!("duration {value:?} overflows")))?;
            }
        }
        Ok(Self(Duration::from_secs(seconds)))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut remaining = self.0.as_secs();
        if remaining == 0 {
            return f.write_str("0s");
        }
        for (unit, scale) in [("w", 604_800), ("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
            if remaining >= scale {
                write!(f, "{}{unit}", remaining / scale)?;
                remaining %= scale;
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for HumanDuration {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HumanDuration> for String {
    fn from(value: HumanDuration) -> Self {
        value.to_string()
    }
}

/// Connection to the managed qBittorrent instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QbittorrentConfig {
    /// Hostname or URL; `http://` is assumed without a scheme
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
}

impl Default for QbittorrentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: Some(8080),
            username: "admin".to_string(),
            password: "adminadmin".to_string(),
        }
    }
}

impl QbittorrentConfig {
    /// Web UI base URL.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - Host and port do not form a URL
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let raw = if self.host.contains("://") {
            self.host.clone()
        } else {
            format!("http://{}", self.host)
        };
        let mut url = Url::parse(&raw).map_err(|e| ConfigError::invalid(format!("qbittorrent.host: {e}")))?;
        if let Some(port) = self.port {
            url.set_port(Some(port))
                .map_err(|()| ConfigError::invalid("qbittorrent.port cannot be set on this host"))?;
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }
}

/// Ratio ceiling used when pausing for races.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RacePausingConfig {
    /// Race-category torrents with at least this ratio are paused too
    pub ratio: f64,
}

impl Default for RacePausingConfig {
    fn default() -> Self {
        Self { ratio: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RacingConfig {
    pub race_categories: Vec<String>,
    /// Attempt budget; absent or 0 means unlimited
    pub max_reannounce: Option<u32>,
    /// Seconds between reannounce attempts
    pub reannounce_frequency: f64,
    /// Pausing for races is enabled when present
    pub pausing: Option<RacePausingConfig>,
}

impl Default for RacingConfig {
    fn default() -> Self {
        Self {
            race_categories: Vec::new(),
            max_reannounce: None,
            reannounce_frequency: 5.0,
            pausing: Some(RacePausingConfig::default()),
        }
    }
}

/// Activity limits for manual pauses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PausingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_since_active: Option<HumanDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_active: Option<HumanDuration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Top-level configuration file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlipstreamConfig {
    pub qbittorrent: QbittorrentConfig,
    pub debug_logging: bool,
    /// Torrents in these categories are never paused
    pub ignore_categories: Vec<String>,
    pub racing: RacingConfig,
    pub pausing: PausingConfig,
    pub server: ServerConfig,
    /// How long finished tasks stay listable
    pub task_retention: HumanDuration,
}

impl Default for SlipstreamConfig {
    fn default() -> Self {
        Self {
            qbittorrent: QbittorrentConfig::default(),
            debug_logging: false,
            ignore_categories: Vec::new(),
            racing: RacingConfig::default(),
            pausing: PausingConfig::default(),
            server: ServerConfig::default(),
            task_retention: HumanDuration(crate::tasks::DEFAULT_RETENTION),
        }
    }
}

impl SlipstreamConfig {
    /// Parses and validates JSON config text.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - Malformed JSON or out-of-range values
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(ConfigError::invalid)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// - `ConfigError::Invalid` - Value could not be serialized
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(ConfigError::invalid)
    }

    /// Checks values serde cannot constrain.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - First offending value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qbittorrent.host.trim().is_empty() {
            return Err(ConfigError::invalid("qbittorrent.host must not be empty"));
        }
        self.qbittorrent.base_url()?;

        let frequency = self.racing.reannounce_frequency;
        if !frequency.is_finite() || frequency <= 0.0 || frequency > MAX_REANNOUNCE_FREQUENCY {
            return Err(ConfigError::invalid(format!(
                "racing.reannounce_frequency must be between 0 and {MAX_REANNOUNCE_FREQUENCY} seconds, got {frequency}"
            )));
        }
        if let Some(pausing) = &self.racing.pausing
            && (!pausing.ratio.is_finite() || pausing.ratio < 0.0)
        {
            return Err(ConfigError::invalid(format!(
                "racing.pausing.ratio must be >= 0, got {}",
                pausing.ratio
            )));
        }
        if self.task_retention.as_duration().is_zero() {
            return Err(ConfigError::invalid("task_retention must be longer than 0s"));
        }
        Ok(())
    }

    /// Criteria for manual pauses.
    pub fn pause_criteria(&self) -> EligibilityCriteria {
        EligibilityCriteria::activity(
            self.ignore_categories.iter().cloned(),
            self.pausing.time_since_active.map(HumanDuration::as_duration),
            self.pausing.time_active.map(HumanDuration::as_duration),
        )
    }
}

/// Where config, state and logs live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl ConfigPaths {
    /// Resolves directories from `SLIPSTREAM_CONFIG_DIR`, `SLIPSTREAM_STATE_DIR`
    /// and `SLIPSTREAM_LOGS_DIR`, falling back to XDG locations under `$HOME`.
    pub fn from_env() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let xdg = |var: &str, fallback: &str| {
            std::env::var_os(var)
                .map(PathBuf::from)
                .or_else(|| home.as_ref().map(|home| home.join(fallback)))
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
        };

        let config_dir = std::env::var_os("SLIPSTREAM_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| xdg("XDG_CONFIG_HOME", ".config"));
        let state_dir = std::env::var_os("SLIPSTREAM_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| xdg("XDG_STATE_HOME", ".local/state"));
        let logs_dir = std::env::var_os("SLIPSTREAM_LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("logs"));

        Self {
            config_dir,
            state_dir,
            logs_dir,
        }
    }

    /// Everything under one base directory.
    pub fn in_dir(base: &Path) -> Self {
        Self {
            config_dir: base.join("config"),
            state_dir: base.join("state"),
            logs_dir: base.join("logs"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILENAME)
    }

    pub fn database_file(&self) -> PathBuf {
        self.state_dir.join(DATABASE_FILENAME)
    }
}

/// Source of the current configuration.
pub trait ConfigSource: Send + Sync {
    /// Current configuration, validated.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - Stored configuration is malformed
    /// - `ConfigError::Io` - Storage could not be read
    fn load(&self) -> Result<SlipstreamConfig, ConfigError>;

    /// Replaces the stored configuration after validating it.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - `config` fails validation
    /// - `ConfigError::Io` - Storage could not be written
    fn save(&self, config: &SlipstreamConfig) -> Result<(), ConfigError>;

    /// Human readable location, for display.
    fn location(&self) -> String;
}

/// JSON config file on disk.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the default configuration if the file does not exist yet.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Io` - Directory or file could not be created
    pub fn ensure_exists(&self) -> Result<(), ConfigError> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        }
        let text = SlipstreamConfig::default().to_json_pretty()?;
        fs::write(&self.path, text).map_err(|e| ConfigError::io(&self.path, e))?;
        tracing::info!("Created default config at {}", self.path.display());
        Ok(())
    }

    /// Raw file contents, creating the default file first if needed.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Io` - File could not be created or read
    pub fn read_raw(&self) -> Result<String, ConfigError> {
        self.ensure_exists()?;
        fs::read_to_string(&self.path).map_err(|e| ConfigError::io(&self.path, e))
    }

    /// Opens the file in `$EDITOR` (`vi`, or `notepad` on Windows) and
    /// validates the result.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Editor` - Editor could not be started or exited with failure
    /// - `ConfigError::Invalid` - Edited file no longer validates
    pub fn edit(&self) -> Result<SlipstreamConfig, ConfigError> {
        self.ensure_exists()?;
        let default_editor = if cfg!(windows) { "notepad" } else { "vi" };
        let editor = std::env::var("EDITOR").unwrap_or_else(|_| default_editor.to_string());

        let status = std::process::Command::new(&editor)
            .arg(&self.path)
            .status()
            .map_err(|e| ConfigError::Editor {
                reason: format!("{editor}: {e}"),
            })?;
        if !status.success() {
            return Err(ConfigError::Editor {
                reason: format!("{editor} exited with {status}"),
            });
        }
        self.load()
    }
}

impl ConfigSource for ConfigFile {
    fn load(&self) -> Result<SlipstreamConfig, ConfigError> {
        let text = self.read_raw()?;
        let config = SlipstreamConfig::from_json(&text)?;
        tracing::debug!("Loaded config from {}", self.path.display());
        Ok(config)
    }

    fn save(&self, config: &SlipstreamConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        }
        fs::write(&self.path, config.to_json_pretty()?).map_err(|e| ConfigError::io(&self.path, e))?;
        tracing::info!("Saved config to {}", self.path.display());
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process configuration, used by tests and embedded setups.
impl ConfigSource for RwLock<SlipstreamConfig> {
    fn load(&self) -> Result<SlipstreamConfig, ConfigError> {
        Ok(self.read().clone())
    }

    fn save(&self, config: &SlipstreamConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.write() = config.clone();
        Ok(())
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_parsing() {
        let parse = |text: &str| text.parse::<HumanDuration>().map(HumanDuration::as_duration);

        assert_eq!(parse("1w2d3h4m5s").unwrap(), Duration::from_secs(788_645));
        assert_eq!(parse("90m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse("0s").unwrap(), Duration::ZERO);
        assert!(parse("").is_err());
        assert!(parse("5x").is_err());
        assert!(parse("3s4m").is_err());
    }

    #[test]
    fn test_duration_display_is_canonical() {
        assert_eq!(HumanDuration(Duration::from_secs(788_645)).to_string(), "1w2d3h4m5s");
        assert_eq!(HumanDuration(Duration::from_secs(3600)).to_string(), "1h");
        assert_eq!(HumanDuration(Duration::ZERO).to_string(), "0s");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SlipstreamConfig::from_json(
            r#"{"racing": {"race_categories": ["race"], "max_reannounce": 50}, "pausing": {"time_since_active": "1d"}}"#,
        )
        .unwrap();

        assert_eq!(config.racing.race_categories, vec!["race"]);
        assert_eq!(config.racing.max_reannounce, Some(50));
        assert_eq!(config.racing.reannounce_frequency, 5.0);
        assert_eq!(config.server.port, 8081);
        assert_eq!(
            config.pausing.time_since_active,
            Some(HumanDuration(Duration::from_secs(86_400)))
        );
        assert_eq!(config.task_retention.as_duration(), Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SlipstreamConfig::from_json("{not json"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            SlipstreamConfig::from_json(r#"{"racing": {"reannounce_frequency": 0}}"#),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            SlipstreamConfig::from_json(r#"{"racing": {"pausing": {"ratio": -1}}}"#),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            SlipstreamConfig::from_json(r#"{"pausing": {"time_active": "forever"}}"#),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_reannounce_frequency_upper_bound() {
        assert!(matches!(
            SlipstreamConfig::from_json(r#"{"racing": {"reannounce_frequency": 1e30}}"#),
            Err(ConfigError::Invalid { .. })
        ));

        let mut config = SlipstreamConfig::default();
        config.racing.reannounce_frequency = MAX_REANNOUNCE_FREQUENCY;
        assert!(config.validate().is_ok());
        config.racing.reannounce_frequency = MAX_REANNOUNCE_FREQUENCY + 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_base_url_adds_scheme_and_port() {
        let config = QbittorrentConfig::default();
        assert_eq!(config.base_url().unwrap().as_str(), "http://localhost:8080/");

        let https = QbittorrentConfig {
            host: "https://qbit.example/ui".to_string(),
            port: None,
            ..QbittorrentConfig::default()
        };
        assert_eq!(https.base_url().unwrap().as_str(), "https://qbit.example/ui/");
    }

    #[test]
    fn test_config_file_created_with_defaults_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::in_dir(dir.path());
        let file = ConfigFile::new(paths.config_file());

        let loaded = file.load().unwrap();
        assert_eq!(loaded, SlipstreamConfig::default());
        assert!(paths.config_file().exists());

        let mut changed = loaded;
        changed.racing.max_reannounce = Some(3);
        file.save(&changed).unwrap();
        assert_eq!(file.load().unwrap().racing.max_reannounce, Some(3));

        let mut broken = changed;
        broken.racing.reannounce_frequency = -1.0;
        assert!(file.save(&broken).is_err());
        assert_eq!(file.load().unwrap().racing.reannounce_frequency, 5.0);
    }

    #[test]
    fn test_pause_criteria_from_config() {
        let mut config = SlipstreamConfig::default();
        config.ignore_categories = vec!["keep".to_string()];
        config.pausing.time_active = Some(HumanDuration(Duration::from_secs(60)));

        let criteria = config.pause_criteria();
        assert!(criteria.ignore_categories.contains("keep"));
        assert_eq!(
            criteria,
            EligibilityCriteria::activity(
                vec!["keep".to_string()],
                None,
                Some(Duration::from_secs(60))
            )
        );
    }

    #[test]
    fn test_paths_in_dir() {
        let paths = ConfigPaths::in_dir(Path::new("/tmp/slip"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/slip/config/config.json"));
        assert_eq!(
            paths.database_file(),
            PathBuf::from("/tmp/slip/state/paused_events.sqlite")
        );
    }
}
