//! Scanner Configuration
//!
//! Layered sources: built-in defaults, then an optional `scanner.toml` (path
//! from `SCANNER_CONFIG`), then `SCANNER__*` environment variables such as
//! `SCANNER__SCAN__VOLUME_FLOOR=500000`.

use serde::{Deserialize, Serialize};

use crate::confluence::derived::{self, DerivedColumn};
use crate::confluence::SortOrder;
use crate::rules::{ConfluenceRule, RulePreset, RuleSet};
use crate::types::{Result, Timeframe};

/// Top-level service settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub export: ExportSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: default_port(),
            provider: ProviderSettings::default(),
            scan: ScanSettings::default(),
            export: ExportSettings::default(),
        }
    }
}

impl Settings {
    /// Load from file and environment; `PORT` overrides the listener port
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("SCANNER_CONFIG").unwrap_or_else(|_| "scanner".to_string());
        let builder = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("SCANNER")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut settings = Self::build(builder)?;
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            settings.port = port;
        }
        Ok(settings)
    }

    /// Parse settings from a TOML document
    pub fn from_toml(toml: &str) -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Self::build(builder)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> anyhow::Result<Self> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        // Fail at startup rather than on the first scan
        settings.scan.rule_set()?;
        Ok(settings)
    }
}

/// Market data provider connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Session cookie for real-time data; delayed data without it
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            session_id: None,
            timeout_secs: default_timeout_secs(),
            max_concurrent_requests: default_max_concurrent_requests(),
            min_request_interval_ms: default_min_request_interval_ms(),
        }
    }
}

/// How timeframe data is requested from the provider
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// One query with timeframe-suffixed columns
    #[default]
    Wide,
    /// One query per timeframe, joined locally
    PerTimeframe,
}

/// What to scan and how to judge it
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanSettings {
    #[serde(default = "default_market")]
    pub market: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    #[serde(default)]
    pub preset: RulePreset,
    /// Explicit rules replacing the preset; must still hold the trend rules
    #[serde(default)]
    pub rules: Option<Vec<ConfluenceRule>>,
    #[serde(default)]
    pub volume_floor: Option<f64>,
    #[serde(default)]
    pub relative_volume_floor: Option<f64>,
    /// Timeframe whose MACD pair drives the momentum column (and rule)
    #[serde(default = "default_momentum_timeframe")]
    pub momentum_timeframe: Timeframe,
    /// Send rules to the provider as server-side filters too
    #[serde(default = "default_pushdown")]
    pub pushdown: bool,
    #[serde(default = "default_sort")]
    pub sort: SortOrder,
    /// Metrics fetched for display even when no rule reads them
    #[serde(default = "default_display_fields")]
    pub display_fields: Vec<String>,
    #[serde(default)]
    pub derived: Option<Vec<DerivedColumn>>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            market: default_market(),
            limit: default_limit(),
            fetch_mode: FetchMode::default(),
            preset: RulePreset::default(),
            rules: None,
            volume_floor: None,
            relative_volume_floor: None,
            momentum_timeframe: default_momentum_timeframe(),
            pushdown: default_pushdown(),
            sort: default_sort(),
            display_fields: default_display_fields(),
            derived: None,
        }
    }
}

impl ScanSettings {
    /// Preset (or explicit rules) plus the configured floors
    pub fn rule_set(&self) -> Result<RuleSet> {
        let mut set = match &self.rules {
            Some(rules) => RuleSet::from_rules(rules.clone())?,
            None => self.preset.build(self.momentum_timeframe),
        };
        if let Some(floor) = self.volume_floor {
            set = set.with_rule(ConfluenceRule::floor("volume", floor));
        }
        if let Some(floor) = self.relative_volume_floor {
            set = set.with_rule(ConfluenceRule::floor("relative_volume_10d_calc", floor));
        }
        Ok(set)
    }

    pub fn derived_columns(&self) -> Vec<DerivedColumn> {
        self.derived
            .clone()
            .unwrap_or_else(|| derived::default_columns(self.momentum_timeframe))
    }
}

/// CSV export layout
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportSettings {
    #[serde(default = "crate::export::default_columns")]
    pub columns: Vec<String>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            columns: crate::export::default_columns(),
        }
    }
}

fn default_port() -> u16 { 8080 }
fn default_base_url() -> String { "https://scanner.tradingview.com".to_string() }
fn default_timeout_secs() -> u64 { 30 }
fn default_max_concurrent_requests() -> usize { 2 }
fn default_min_request_interval_ms() -> u64 { 250 }
fn default_market() -> String { "america".to_string() }
fn default_limit() -> usize { 4000 }
fn default_momentum_timeframe() -> Timeframe { Timeframe::Daily }
fn default_pushdown() -> bool { true }
fn default_sort() -> SortOrder { SortOrder::PercentChangeDesc }
fn default_display_fields() -> Vec<String> {
    ["close", "change", "volume", "relative_volume_10d_calc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
