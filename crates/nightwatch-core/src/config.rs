//! JSON configuration.
//!
//! Every value has a built-in default taken from [`crate::memory::layout`], so
//! an empty object (or a missing file, at the host's discretion) describes the
//! known game build. Offsets may be written either as JSON numbers or as
//! `"0x..."` strings.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::instrument::{ChannelConfig, InjectorConfig};
use crate::memory::layout::{self, direct, player, timing};
use crate::memory::{ProcessTarget, Width};
use crate::pinner::PinnerConfig;
use crate::resolver::FieldSpec;
use crate::retry::ExponentialBackoff;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub process_name: String,
    pub offsets: OffsetsConfig,
    pub pinner: PinnerSettings,
    /// Reconnect policy of the pinner
    pub reconnect: BackoffSettings,
    pub instrumentation: InstrumentationSettings,
    /// Minimum spacing of repeated reconnect status lines
    pub status_log_window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetsConfig {
    /// Module-relative location of the player data pointer
    #[serde(with = "hex")]
    pub base_pointer: u64,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinnerSettings {
    pub interval_ms: u64,
    /// Names of the pinned fields; the first is the primary field
    pub fields: Vec<String>,
}

/// Missing keys take the pinner's reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub ceiling_ms: u64,
    pub attempts_before_cooldown: u32,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationSettings {
    pub library: PathBuf,
    pub start_export: String,
    pub port: u16,
    pub healthy_tick_ms: u64,
    pub connect_timeout_ms: u64,
    /// Missing keys take the fast instrumentation policy
    #[serde(deserialize_with = "fast_retry")]
    pub retry: BackoffSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            process_name: layout::PROCESS_NAME.to_string(),
            offsets: OffsetsConfig::default(),
            pinner: PinnerSettings::default(),
            reconnect: BackoffSettings::from(&ExponentialBackoff::reconnect()),
            instrumentation: InstrumentationSettings::default(),
            status_log_window_ms: timing::RECONNECT_LOG_WINDOW_MS,
        }
    }
}

impl Default for OffsetsConfig {
    fn default() -> Self {
        Self {
            base_pointer: player::BASE_POINTER,
            fields: vec![
                FieldSpec::pointer("anhen", player::ANHEN, Width::I32),
                FieldSpec::pointer("wangzheng", player::WANGZHENG, Width::I32),
                FieldSpec::direct("quantity", direct::QUANTITY, Width::I64),
            ],
        }
    }
}

impl Default for PinnerSettings {
    fn default() -> Self {
        Self {
            interval_ms: timing::PIN_INTERVAL_MS,
            fields: vec!["anhen".to_string(), "wangzheng".to_string()],
        }
    }
}

impl Default for InstrumentationSettings {
    fn default() -> Self {
        let injector = InjectorConfig::default();
        Self {
            library: injector.library,
            start_export: injector.start_export,
            port: injector.port,
            healthy_tick_ms: timing::HEALTHY_TICK_MS,
            connect_timeout_ms: injector.connect_timeout.as_millis() as u64,
            retry: BackoffSettings::from(&ExponentialBackoff::fast()),
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self::from(&ExponentialBackoff::reconnect())
    }
}

impl From<&ExponentialBackoff> for BackoffSettings {
    fn from(policy: &ExponentialBackoff) -> Self {
        Self {
            initial_ms: policy.initial.as_millis() as u64,
            ceiling_ms: policy.ceiling.as_millis() as u64,
            attempts_before_cooldown: policy.attempts_before_cooldown,
            cooldown_ms: policy.cooldown.as_millis() as u64,
        }
    }
}

impl BackoffSettings {
    pub fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial: Duration::from_millis(self.initial_ms),
            ceiling: Duration::from_millis(self.ceiling_ms),
            attempts_before_cooldown: self.attempts_before_cooldown,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.initial_ms == 0 {
            return Err(Error::InvalidConfig(format!(
                "{section}: initial delay must be positive"
            )));
        }
        if self.ceiling_ms < self.initial_ms {
            return Err(Error::InvalidConfig(format!(
                "{section}: ceiling {}ms is below initial delay {}ms",
                self.ceiling_ms, self.initial_ms
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.process_name.trim().is_empty() {
            return Err(Error::InvalidConfig("process_name is empty".to_string()));
        }
        if self.pinner.interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "pinner.interval_ms must be positive".to_string(),
            ));
        }
        if self.instrumentation.healthy_tick_ms == 0 {
            return Err(Error::InvalidConfig(
                "instrumentation.healthy_tick_ms must be positive".to_string(),
            ));
        }
        self.reconnect.validate("reconnect")?;
        self.instrumentation.retry.validate("instrumentation.retry")?;

        let mut names = HashSet::new();
        for field in &self.offsets.fields {
            if field.name.is_empty() {
                return Err(Error::InvalidConfig("field with empty name".to_string()));
            }
            if !names.insert(field.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "field '{}' defined twice",
                    field.name
                )));
            }
        }
        if self.pinner.fields.is_empty() {
            return Err(Error::InvalidConfig("pinner.fields is empty".to_string()));
        }
        if let Some(unknown) = self.pinner.fields.iter().find(|n| !names.contains(n.as_str())) {
            return Err(Error::InvalidConfig(format!(
                "pinner.fields names unknown field '{unknown}'"
            )));
        }
        Ok(())
    }

    pub fn process_target(&self) -> ProcessTarget {
        ProcessTarget::name(&self.process_name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.offsets.fields.iter().find(|f| f.name == name)
    }

    /// Pinned fields in configured order, primary first.
    pub fn pinned_fields(&self) -> Vec<FieldSpec> {
        self.pinner
            .fields
            .iter()
            .filter_map(|name| self.field(name).cloned())
            .collect()
    }

    fn log_window(&self) -> Duration {
        Duration::from_millis(self.status_log_window_ms)
    }

    pub fn pinner_config(&self) -> PinnerConfig {
        PinnerConfig {
            interval: Duration::from_millis(self.pinner.interval_ms),
            backoff: self.reconnect.policy(),
            log_window: self.log_window(),
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            healthy_tick: Duration::from_millis(self.instrumentation.healthy_tick_ms),
            backoff: self.instrumentation.retry.policy(),
            log_window: self.log_window(),
        }
    }

    pub fn injector_config(&self) -> InjectorConfig {
        let settings = &self.instrumentation;
        InjectorConfig {
            library: settings.library.clone(),
            start_export: settings.start_export.clone(),
            port: settings.port,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
        }
    }
}

/// Offsets as `"0x..."` strings, also accepting plain numbers on input.
#[derive(Deserialize)]
struct PartialBackoff {
    initial_ms: Option<u64>,
    ceiling_ms: Option<u64>,
    attempts_before_cooldown: Option<u32>,
    cooldown_ms: Option<u64>,
}

fn fast_retry<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BackoffSettings, D::Error> {
    let partial = PartialBackoff::deserialize(deserializer)?;
    let base = BackoffSettings::from(&ExponentialBackoff::fast());
    Ok(BackoffSettings {
        initial_ms: partial.initial_ms.unwrap_or(base.initial_ms),
        ceiling_ms: partial.ceiling_ms.unwrap_or(base.ceiling_ms),
        attempts_before_cooldown: partial
            .attempts_before_cooldown
            .unwrap_or(base.attempts_before_cooldown),
        cooldown_ms: partial.cooldown_ms.unwrap_or(base.cooldown_ms),
    })
}

pub(crate) mod hex {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#X}"))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => parse(&s).ok_or_else(|| de::Error::custom(format!("invalid offset '{s}'"))),
        }
    }

    fn parse(s: &str) -> Option<u64> {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(digits) => u64::from_str_radix(&digits.replace('_', ""), 16).ok(),
            None => s.parse().ok(),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::FieldKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_match_layout() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.process_name, "nightreign.exe");
        assert_eq!(config.offsets.base_pointer, 0x03C0_78D0);
        assert_eq!(config.field("anhen").unwrap().offset, 0x530);
        assert_eq!(config.field("wangzheng").unwrap().offset, 0x4BC);

        let quantity = config.field("quantity").unwrap();
        assert_eq!(quantity.offset, 0x039A_A448);
        assert_eq!(quantity.kind, FieldKind::Direct);
        assert_eq!(quantity.width, Width::I64);

        assert_eq!(config.pinner_config().interval, Duration::from_millis(50));
        assert_eq!(config.channel_config().healthy_tick, Duration::from_secs(1));
        assert_eq!(
            config.channel_config().backoff.initial,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_pinned_fields_primary_first() {
        let names: Vec<_> = Config::default()
            .pinned_fields()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["anhen", "wangzheng"]);
    }

    #[test]
    fn test_empty_object_is_default() {
        assert_eq!(Config::from_json("{}").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_override_with_hex_offsets() {
        let config = Config::from_json(
            r#"{
                "offsets": {
                    "base_pointer": "0x03C07A00",
                    "fields": [
                        { "name": "anhen", "offset": "0x538" },
                        { "name": "wangzheng", "offset": 1216, "width": "i32" }
                    ]
                },
                "pinner": { "interval_ms": 100 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.offsets.base_pointer, 0x03C0_7A00);
        assert_eq!(config.field("anhen").unwrap().offset, 0x538);
        assert_eq!(config.field("anhen").unwrap().kind, FieldKind::Pointer);
        assert_eq!(config.field("wangzheng").unwrap().offset, 0x4C0);
        assert_eq!(config.pinner.interval_ms, 100);
        assert_eq!(config.pinner.fields, vec!["anhen", "wangzheng"]);
        assert_eq!(config.process_name, "nightreign.exe");
    }

    #[test]
    fn test_partial_backoff_sections() {
        let config = Config::from_json(
            r#"{
                "reconnect": { "initial_ms": 500 },
                "instrumentation": { "retry": { "ceiling_ms": 8000 } }
            }"#,
        )
        .unwrap();

        let reconnect = ExponentialBackoff::reconnect();
        assert_eq!(config.reconnect.initial_ms, 500);
        assert_eq!(config.reconnect.ceiling_ms, reconnect.ceiling.as_millis() as u64);
        assert_eq!(config.reconnect.cooldown_ms, reconnect.cooldown.as_millis() as u64);

        let fast = ExponentialBackoff::fast();
        let retry = &config.instrumentation.retry;
        assert_eq!(retry.ceiling_ms, 8000);
        assert_eq!(retry.initial_ms, fast.initial.as_millis() as u64);
        assert_eq!(retry.attempts_before_cooldown, fast.attempts_before_cooldown);
        config.validate().unwrap();
    }

    #[test]
    fn test_offsets_serialize_as_hex() {
        let json = Config::default().to_json().unwrap();
        assert!(json.contains("\"base_pointer\": \"0x3C078D0\""));
        assert_eq!(Config::from_json(&json).unwrap(), Config::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.process_name = "  ".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.pinner.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnect.ceiling_ms = config.reconnect.initial_ms - 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pinner.fields = vec!["runes".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.offsets.fields.push(FieldSpec::direct("anhen", 0, Width::I32));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "process_name": "NightReign.exe" }}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.process_name, "NightReign.exe");
        assert_eq!(
            config.process_target(),
            ProcessTarget::name("NightReign.exe")
        );
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(Config::load(file.path()), Err(Error::Json(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("config.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
