//! Configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/prealigner.toml`)
//! 2. environment variables prefixed with `PREALIGNER_`, nested with `__`
//!
//! Every section has defaults, so an empty file (or no file at all) gives a
//! usable configuration apart from the device addresses.
//!
//! # Example
//! ```no_run
//! use prealigner::config::PrealignerConfig;
//!
//! // PREALIGNER_SERIAL__PORT=/dev/ttyUSB0 overrides [serial] port
//! let config = PrealignerConfig::load()?;
//! config.validate()?;
//! println!("cycles: {}", config.sequence.default_cycles);
//! # Ok::<(), prealigner::error::PrealignError>(())
//! ```

use crate::alarms::{AlarmCatalog, EmptyCatalog, TableCatalog};
use crate::error::{AppResult, PrealignError};
use crate::hardware::{Parity, SerialSettings, VisionEndpoint};
use crate::protocol::{CommandTable, ReplyTimeoutPolicy};
use crate::sequence::ControllerSettings;
use crate::tracing_init::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/prealigner.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PREALIGNER_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrealignerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Prealigner serial port
    #[serde(default)]
    pub serial: SerialConfig,
    /// Vision system connection
    #[serde(default)]
    pub vision: VisionConfig,
    /// Cycle defaults and timeouts
    #[serde(default)]
    pub sequence: SequenceConfig,
    /// Alarm description catalog
    #[serde(default)]
    pub alarms: AlarmConfig,
    /// Command payload overrides, by symbolic name
    #[serde(default)]
    pub commands: HashMap<String, String>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM1`
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
        }
    }
}

impl SerialConfig {
    /// Port settings, or `None` when no port is configured.
    pub fn settings(&self) -> Option<SerialSettings> {
        self.port.as_ref().map(|port| {
            SerialSettings::new(port.clone())
                .with_baud_rate(self.baud_rate)
                .with_data_bits(self.data_bits)
                .with_parity(self.parity)
                .with_stop_bits(self.stop_bits)
        })
    }
}

/// Vision system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Host name or address
    #[serde(default)]
    pub host: Option<String>,
    /// TCP port
    #[serde(default = "default_vision_port")]
    pub port: u16,
    /// Connection timeout in milliseconds
    #[serde(default = "default_vision_timeout")]
    pub connect_timeout_ms: u64,
    /// Trigger reply timeout in milliseconds
    #[serde(default = "default_vision_timeout")]
    pub reply_timeout_ms: u64,
    /// What a missing trigger reply means
    #[serde(default)]
    pub on_reply_timeout: ReplyTimeoutPolicy,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_vision_port(),
            connect_timeout_ms: default_vision_timeout(),
            reply_timeout_ms: default_vision_timeout(),
            on_reply_timeout: ReplyTimeoutPolicy::default(),
        }
    }
}

impl VisionConfig {
    /// Endpoint, or `None` when no host is configured.
    pub fn endpoint(&self) -> Option<VisionEndpoint> {
        self.host.as_ref().map(|host| VisionEndpoint {
            host: host.clone(),
            port: self.port,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        })
    }
}

/// Sequence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Cycles run when the caller does not say
    #[serde(default = "default_cycles")]
    pub default_cycles: u32,
    /// Serial completion timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            default_cycles: default_cycles(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

/// Alarm catalog configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// TOML catalog of alarm descriptions
    #[serde(default)]
    pub catalog: Option<PathBuf>,
}

// Default value functions
fn default_name() -> String {
    "Prealigner".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_vision_port() -> u16 {
    80
}

fn default_vision_timeout() -> u64 {
    5000
}

fn default_cycles() -> u32 {
    10
}

fn default_command_timeout() -> u64 {
    30_000
}

impl PrealignerConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file is not an error; the defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(PrealignError::from)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(PrealignError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 {
            return Err(PrealignError::Configuration(
                "serial.baud_rate must be greater than zero".to_string(),
            ));
        }

        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(PrealignError::Configuration(format!(
                "Invalid serial.data_bits {}. Must be 5-8",
                self.serial.data_bits
            )));
        }

        if !matches!(self.serial.stop_bits, 1 | 2) {
            return Err(PrealignError::Configuration(format!(
                "Invalid serial.stop_bits {}. Must be 1 or 2",
                self.serial.stop_bits
            )));
        }

        for (key, value) in [
            ("vision.connect_timeout_ms", self.vision.connect_timeout_ms),
            ("vision.reply_timeout_ms", self.vision.reply_timeout_ms),
            ("sequence.command_timeout_ms", self.sequence.command_timeout_ms),
        ] {
            if value == 0 {
                return Err(PrealignError::Configuration(format!(
                    "{key} must be greater than zero"
                )));
            }
        }

        if self.sequence.default_cycles == 0 {
            return Err(PrealignError::Configuration(
                "sequence.default_cycles must be at least 1".to_string(),
            ));
        }

        self.command_table()?;
        Ok(())
    }

    /// Timeouts and reply policy for the controller.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            command_timeout: Duration::from_millis(self.sequence.command_timeout_ms),
            reply_timeout: Duration::from_millis(self.vision.reply_timeout_ms),
            on_reply_timeout: self.vision.on_reply_timeout,
        }
    }

    /// The standard command table with `[commands]` overrides applied.
    pub fn command_table(&self) -> AppResult<CommandTable> {
        CommandTable::standard().with_overrides(&self.commands)
    }

    /// The configured alarm catalog, or an empty one.
    pub fn alarm_catalog(&self) -> AppResult<Arc<dyn AlarmCatalog>> {
        match &self.alarms.catalog {
            Some(path) => Ok(Arc::new(TableCatalog::load(path)?)),
            None => Ok(Arc::new(EmptyCatalog)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = PrealignerConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.sequence.default_cycles, 10);
        assert_eq!(config.sequence.command_timeout_ms, 30_000);
        assert_eq!(config.vision.reply_timeout_ms, 5000);
        assert_eq!(
            config.vision.on_reply_timeout,
            ReplyTimeoutPolicy::CountAsAcknowledged
        );
        assert!(config.serial.settings().is_none());
        assert!(config.vision.endpoint().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_values_are_used() {
        let file = write_config(
            r#"
[application]
log_level = "debug"
log_format = "json"

[serial]
port = "/dev/ttyUSB0"
baud_rate = 19200
parity = "even"

[vision]
host = "192.168.0.1"
port = 8500
on_reply_timeout = "halt"

[sequence]
default_cycles = 3

[commands]
MALN = "$2MALN1009000B5"
"#,
        );
        let config = PrealignerConfig::load_from(file.path()).unwrap();
        config.validate().unwrap();

        assert!(matches!(config.application.log_format, OutputFormat::Json));
        let serial = config.serial.settings().unwrap();
        assert_eq!(serial.port, "/dev/ttyUSB0");
        assert_eq!(serial.baud_rate, 19200);
        assert_eq!(serial.parity, Parity::Even);

        let endpoint = config.vision.endpoint().unwrap();
        assert_eq!(endpoint.address(), "192.168.0.1:8500");
        assert_eq!(endpoint.connect_timeout, Duration::from_secs(5));

        let settings = config.controller_settings();
        assert_eq!(settings.on_reply_timeout, ReplyTimeoutPolicy::Halt);
        assert_eq!(settings.command_timeout, Duration::from_secs(30));

        let table = config.command_table().unwrap();
        assert_eq!(table.entry("MALN").unwrap().payload, "$2MALN1009000B5");
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut config = PrealignerConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(PrealignError::Configuration(_))
        ));
    }

    #[test]
    fn serial_framing_is_checked() {
        let mut config = PrealignerConfig::default();
        config.serial.data_bits = 9;
        assert!(config.validate().is_err());

        let mut config = PrealignerConfig::default();
        config.serial.stop_bits = 3;
        assert!(config.validate().is_err());

        let mut config = PrealignerConfig::default();
        config.serial.baud_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeouts_and_cycles_are_rejected() {
        let mut config = PrealignerConfig::default();
        config.sequence.command_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = PrealignerConfig::default();
        config.vision.reply_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = PrealignerConfig::default();
        config.sequence.default_cycles = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_command_override_is_rejected() {
        let mut config = PrealignerConfig::default();
        config
            .commands
            .insert("LEVITATE".to_string(), "$2LEV".to_string());
        assert!(matches!(
            config.validate(),
            Err(PrealignError::UnknownCommand(_))
        ));
    }

    #[test]
    fn alarm_catalog_defaults_to_empty() {
        let config = PrealignerConfig::default();
        let catalog = config.alarm_catalog().unwrap();
        assert!(catalog.describe("0005").is_none());
    }

    #[test]
    fn alarm_catalog_is_loaded_from_path() {
        let file = write_config(
            r#"
[alarms."0005"]
message = "Vacuum error"
"#,
        );
        let mut config = PrealignerConfig::default();
        config.alarms.catalog = Some(file.path().to_path_buf());
        let catalog = config.alarm_catalog().unwrap();
        assert_eq!(catalog.describe("0005").unwrap().message, "Vacuum error");
    }
}
