use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::normalizers;
use crate::rules::{Operand, Operator};

/// Chart aggregation period a metric is computed over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    Weekly,
    Daily,
    FourHour,
    OneHour,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Weekly => "1w",
            Timeframe::Daily => "1d",
            Timeframe::FourHour => "4h",
            Timeframe::OneHour => "1h",
        }
    }

    /// Suffix carried by metric names of this timeframe in a wide table
    /// (`close_1W`, `EMA20_240`). Daily metrics are unsuffixed.
    pub fn suffix(&self) -> &'static str {
        match self {
            Timeframe::Weekly => "1W",
            Timeframe::Daily => "",
            Timeframe::FourHour => "240",
            Timeframe::OneHour => "60",
        }
    }

    /// Metric name `base` scoped to this timeframe
    pub fn metric(&self, base: &str) -> String {
        match self.suffix() {
            "" => base.to_string(),
            suffix => format!("{}_{}", base, suffix),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation for a symbol: metric name -> value (null when the
/// provider had nothing)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub symbol: String,
    pub metrics: BTreeMap<String, Option<f64>>,
}

impl MetricRow {
    /// Row keyed by the canonical form of `symbol`
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: normalizers::normalize_symbol(symbol),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), Some(value));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Option<f64>) {
        self.metrics.insert(name.into(), value);
    }

    /// Usable value of a metric. Missing columns, nulls and NaN all read as `None`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics
            .get(name)
            .copied()
            .flatten()
            .filter(|v| !v.is_nan())
    }
}

/// Provider response normalized at the boundary
///
/// In per-timeframe form metric names are bare and scoped by `timeframe`.
/// In wide form the table is daily and names carry timeframe suffixes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTable {
    pub timeframe: Timeframe,
    pub rows: Vec<MetricRow>,
}

impl MetricTable {
    pub fn new(timeframe: Timeframe, rows: Vec<MetricRow>) -> Self {
        Self { timeframe, rows }
    }

    pub fn empty(timeframe: Timeframe) -> Self {
        Self::new(timeframe, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, symbol: &str) -> Option<&MetricRow> {
        self.rows.iter().find(|r| r.symbol == symbol)
    }
}

/// Server-side filter pushed down to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderFilter {
    pub field: String,
    pub operator: Operator,
    pub value: Operand,
}

/// One query against a market data provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub market: String,
    pub timeframe: Timeframe,
    pub fields: Vec<String>,
    pub filters: Vec<ProviderFilter>,
    pub limit: usize,
}

/// Data source health/status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: String,
    pub is_healthy: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub success_rate: f64,
    pub avg_latency_ms: u64,
}

/// Error types for scanning
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Rate limit exceeded for {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("Invalid watchlist file: {0}")]
    InvalidWatchlistFile(String),

    #[error("Invalid rule set: {0}")]
    InvalidRuleSet(String),

    #[error("Export failed: {0}")]
    Export(String),
}

impl ScanError {
    /// Provider-side failures are recovered by substituting an empty result
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            ScanError::ProviderUnavailable(_)
                | ScanError::RateLimited { .. }
                | ScanError::MalformedResponse(_)
        )
    }

    /// Text shown to the person running the scan
    pub fn user_message(&self) -> String {
        match self {
            ScanError::ProviderUnavailable(cause) => {
                format!("No market data right now, try again ({})", cause)
            }
            ScanError::RateLimited { retry_after, .. } => match retry_after {
                Some(secs) => format!(
                    "Market data provider is rate limiting us, try again in {}s",
                    secs
                ),
                None => "Market data provider is rate limiting us, try again shortly".to_string(),
            },
            ScanError::MalformedResponse(cause) => format!(
                "Market data provider returned unexpected data, try again ({})",
                cause
            ),
            ScanError::InvalidWatchlistFile(cause) => format!(
                "Could not read the watchlist ({}); showing market-wide results",
                cause
            ),
            other => other.to_string(),
        }
    }
}

/// Result type for scan operations
pub type Result<T> = std::result::Result<T, ScanError>;

/// Source of per-symbol indicator tables
#[async_trait::async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Run one query. An empty table is a valid answer.
    async fn fetch(&self, request: &ProviderRequest) -> Result<MetricTable>;

    /// Get source health status
    async fn health(&self) -> SourceHealth;

    /// Source name
    fn name(&self) -> &str;
}
