//! In-memory MarketDataProvider for pipeline tests

use async_trait::async_trait;
use confluence_scanner::{
    MarketDataProvider, MetricRow, MetricTable, ProviderRequest, ScanError, SourceHealth,
    Timeframe,
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Serves fixed tables by timeframe; optionally fails one timeframe
pub struct StaticProvider {
    tables: Vec<MetricTable>,
    fail_on: Option<(Timeframe, fn() -> ScanError)>,
    pub calls: AtomicUsize,
}

impl StaticProvider {
    pub fn new(tables: Vec<MetricTable>) -> Self {
        Self {
            tables,
            fail_on: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, timeframe: Timeframe, f: fn() -> ScanError) -> Self {
        self.fail_on = Some((timeframe, f));
        self
    }
}

#[async_trait]
impl MarketDataProvider for StaticProvider {
    async fn fetch(&self, request: &ProviderRequest) -> Result<MetricTable, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((timeframe, f)) = self.fail_on {
            if timeframe == request.timeframe {
                return Err(f());
            }
        }
        Ok(self
            .tables
            .iter()
            .find(|t| t.timeframe == request.timeframe)
            .cloned()
            .unwrap_or_else(|| MetricTable::empty(request.timeframe)))
    }

    async fn health(&self) -> SourceHealth {
        SourceHealth {
            source: "static".to_string(),
            is_healthy: self.fail_on.is_none(),
            last_success: None,
            last_error: None,
            success_rate: 1.0,
            avg_latency_ms: 0,
        }
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Wide row with all three trend rules passing and the given volume/change
pub fn passing_row(symbol: &str, volume: f64, change: f64) -> MetricRow {
    MetricRow::new(symbol)
        .with_metric("close", 105.0)
        .with_metric("change", change)
        .with_metric("EMA20", 100.0)
        .with_metric("close_1W", 55.0)
        .with_metric("EMA20_1W", 50.0)
        .with_metric("close_240", 106.0)
        .with_metric("EMA20_240", 100.0)
        .with_metric("volume", volume)
}

/// Per-timeframe table where every symbol sits above its EMA20
pub fn trend_table(timeframe: Timeframe, symbols: &[&str]) -> MetricTable {
    MetricTable::new(
        timeframe,
        symbols
            .iter()
            .map(|s| {
                MetricRow::new(s)
                    .with_metric("close", 110.0)
                    .with_metric("EMA20", 100.0)
            })
            .collect(),
    )
}
