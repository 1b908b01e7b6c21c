//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `gateway.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: where the HTTP listener binds.
//!     - SpreadsheetConfig: backend, data directory, timezone, template names.
//!     - ProvisioningConfig: lock wait and the marker's property key.
//!     - LoggingConfig: filter level and output format.
//!
//! every section and field has a default, so a partial file is fine.
//!
//! ==============================================================================

use anyhow::{anyhow, Context};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::provision::SheetLayout;

/// env var naming an explicit config file
pub const CONFIG_ENV: &str = "GREENHOUSE_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub spreadsheet: SpreadsheetConfig,
    pub provisioning: ProvisioningConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Csv,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SpreadsheetConfig {
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    pub timezone: String,
    pub raw_template: String,
    pub summary_template: String,
    pub summary_header_rows: usize,
    pub seed_templates: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub lock_wait_ms: u64,
    pub marker_key: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for SpreadsheetConfig {
    fn default() -> Self {
        let layout = SheetLayout::default();
        Self {
            backend: BackendKind::Csv,
            data_dir: PathBuf::from("data"),
            timezone: "UTC".to_string(),
            raw_template: layout.raw_template,
            summary_template: layout.summary_template,
            summary_header_rows: layout.summary_header_rows,
            seed_templates: true,
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: 5000,
            marker_key: SheetLayout::default().marker_key,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// where the running configuration came from
#[derive(Debug, Clone)]
pub enum ConfigOrigin {
    File(PathBuf),
    /// no usable file; `skipped` lists files that failed to load and why
    Defaults { skipped: Vec<(PathBuf, String)> },
}

impl GatewayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig =
            toml::from_str(content).map_err(|e| anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback.
    ///
    /// `GREENHOUSE_CONFIG` wins if set; otherwise config/gateway.toml and
    /// ../config/gateway.toml are tried in order.
    pub fn load_or_default() -> (Self, ConfigOrigin) {
        let paths = match std::env::var_os(CONFIG_ENV) {
            Some(explicit) => vec![PathBuf::from(explicit)],
            None => vec![
                PathBuf::from("config").join("gateway.toml"),
                PathBuf::from("..").join("config").join("gateway.toml"),
            ],
        };

        let mut skipped = Vec::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::load(&path) {
                Ok(config) => return (config, ConfigOrigin::File(path)),
                Err(e) => skipped.push((path, format!("{:#}", e))),
            }
        }

        (Self::default(), ConfigOrigin::Defaults { skipped })
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.timezone()?;
        if self.spreadsheet.raw_template == self.spreadsheet.summary_template {
            anyhow::bail!("raw_template and summary_template must differ");
        }
        Ok(())
    }

    pub fn timezone(&self) -> anyhow::Result<Tz> {
        self.spreadsheet
            .timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("unknown timezone '{}': {}", self.spreadsheet.timezone, e))
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.provisioning.lock_wait_ms)
    }

    pub fn layout(&self) -> SheetLayout {
        SheetLayout {
            raw_template: self.spreadsheet.raw_template.clone(),
            summary_template: self.spreadsheet.summary_template.clone(),
            summary_header_rows: self.spreadsheet.summary_header_rows,
            marker_key: self.provisioning.marker_key.clone(),
        }
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!("┌─────────────────────────────────────────┐");
        tracing::info!("│          GATEWAY CONFIGURATION          │");
        tracing::info!("├─────────────────────────────────────────┤");
        tracing::info!("│ Bind: {}", self.server.bind);
        tracing::info!("│ Backend: {:?}", self.spreadsheet.backend);
        tracing::info!("│ Data dir: {}", self.spreadsheet.data_dir.display());
        tracing::info!("│ Timezone: {}", self.spreadsheet.timezone);
        tracing::info!("│ Lock wait: {}ms", self.provisioning.lock_wait_ms);
        tracing::info!("│ Log Level: {}", self.logging.level);
        tracing::info!("└─────────────────────────────────────────┘");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = GatewayConfig::parse("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.spreadsheet.backend, BackendKind::Csv);
        assert_eq!(config.lock_wait(), Duration::from_secs(5));
        assert_eq!(config.layout().marker_key, "last_setup_date");
        assert_eq!(config.layout().summary_template, "YYYY-MM-DD SUMMARY");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = GatewayConfig::parse(
            r#"
            [spreadsheet]
            backend = "memory"
            timezone = "America/Chicago"

            [provisioning]
            lock_wait_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.spreadsheet.backend, BackendKind::Memory);
        assert_eq!(config.timezone().unwrap(), chrono_tz::America::Chicago);
        assert_eq!(config.lock_wait(), Duration::from_millis(250));
        assert_eq!(config.spreadsheet.summary_header_rows, 1);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(GatewayConfig::parse("[spreadsheet]\ntimezone = \"Mars/Olympus\"").is_err());
        assert!(GatewayConfig::parse("[spreadsheet]\nbackend = \"sqlite\"").is_err());
        assert!(GatewayConfig::parse(
            "[spreadsheet]\nraw_template = \"T\"\nsummary_template = \"T\""
        )
        .is_err());
    }
}
