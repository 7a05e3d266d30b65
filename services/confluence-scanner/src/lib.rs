pub mod types;
pub mod sources {
    pub mod tradingview;
}
pub mod normalizers;
pub mod rules;
pub mod confluence;
pub mod watchlist;
pub mod export;
pub mod config;

pub use crate::config::{FetchMode, ScanSettings, Settings};
pub use crate::confluence::derived::{DerivedColumn, DerivedValue};
pub use crate::confluence::{ConfluenceFilter, ScanRow, SortOrder};
pub use crate::rules::{ConfluenceRule, Operand, Operator, RulePreset, RuleSet};
pub use crate::sources::tradingview::TradingViewClient;
pub use crate::types::*;
pub use crate::watchlist::{ScanScope, Watchlist};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::normalizers::{canonical_metric, split_metric};

/// How a scan ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanStatus {
    Matches,
    /// The provider answered but nothing passed every rule
    NoMatches,
    /// No usable data; rows are empty and `reason` is fit for display
    ProviderUnavailable { reason: String },
}

/// Result of one scan, owned by the caller for display, refinement and export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    pub scope: ScanScope,
    pub rows: Vec<ScanRow>,
    /// Rows that passed the rules before watchlist narrowing
    pub candidates: usize,
    #[serde(default)]
    pub watchlist_warning: Option<String>,
    pub scanned_at: DateTime<Utc>,
}

impl ScanOutcome {
    fn from_rows(rows: Vec<ScanRow>, scope: ScanScope, candidates: usize) -> Self {
        let status = if rows.is_empty() {
            ScanStatus::NoMatches
        } else {
            ScanStatus::Matches
        };
        Self {
            status,
            scope,
            rows,
            candidates,
            watchlist_warning: None,
            scanned_at: Utc::now(),
        }
    }

    /// Empty outcome carrying the user-facing cause of a provider failure
    pub fn unavailable(err: &ScanError, scope: ScanScope) -> Self {
        Self {
            status: ScanStatus::ProviderUnavailable {
                reason: err.user_message(),
            },
            scope,
            rows: Vec::new(),
            candidates: 0,
            watchlist_warning: None,
            scanned_at: Utc::now(),
        }
    }

    pub fn with_warning(mut self, warning: Option<String>) -> Self {
        self.watchlist_warning = warning;
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.symbol()).collect()
    }

    /// One line for logs and responses
    pub fn summary(&self) -> String {
        match (&self.status, &self.scope) {
            (ScanStatus::ProviderUnavailable { reason }, _) => reason.clone(),
            (ScanStatus::NoMatches, ScanScope::MarketWide) => {
                "No symbols passed every confluence rule".to_string()
            }
            (ScanStatus::NoMatches, ScanScope::WatchlistFiltered { watchlist_size }) => format!(
                "None of the {} watchlist symbols passed ({} market-wide matches)",
                watchlist_size, self.candidates
            ),
            (ScanStatus::Matches, ScanScope::MarketWide) => {
                format!("Found {} matches market-wide", self.rows.len())
            }
            (ScanStatus::Matches, ScanScope::WatchlistFiltered { watchlist_size }) => format!(
                "Found {} matches in a watchlist of {} ({} market-wide)",
                self.rows.len(),
                watchlist_size,
                self.candidates
            ),
        }
    }
}

/// Narrow and re-sort a previous outcome without fetching again.
///
/// Without a watchlist the previous scope is kept. Failed scans come back
/// unchanged.
pub fn refine(previous: &ScanOutcome, watchlist: Option<&Watchlist>, sort: SortOrder) -> ScanOutcome {
    if matches!(previous.status, ScanStatus::ProviderUnavailable { .. }) {
        return previous.clone();
    }

    let (mut rows, scope) = match watchlist.filter(|w| !w.is_empty()) {
        Some(_) => watchlist::intersect(previous.rows.clone(), watchlist),
        None => (previous.rows.clone(), previous.scope),
    };
    confluence::sort_rows(&mut rows, sort);

    let mut outcome = ScanOutcome::from_rows(rows, scope, previous.candidates);
    outcome.scanned_at = previous.scanned_at;
    outcome
}

/// Fetches provider data, applies the confluence filter and narrows to a watchlist
pub struct ConfluenceScanner {
    provider: Arc<dyn MarketDataProvider>,
    filter: ConfluenceFilter,
    settings: ScanSettings,
}

impl ConfluenceScanner {
    pub fn new(provider: Arc<dyn MarketDataProvider>, settings: ScanSettings) -> Result<Self> {
        let rules = settings.rule_set()?;
        let filter = ConfluenceFilter::new(rules, settings.derived_columns());
        Ok(Self {
            provider,
            filter,
            settings,
        })
    }

    pub fn filter(&self) -> &ConfluenceFilter {
        &self.filter
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Every metric a scan needs: rule operands, derived-column inputs and
    /// display fields, canonically suffixed, first-seen order
    pub fn requested_fields(&self) -> Vec<String> {
        let rule_fields = self.filter.rules().metrics();
        let derived_fields = self.filter.columns().iter().flat_map(|c| c.inputs());
        let display_fields = self.settings.display_fields.iter().cloned();

        let mut fields: Vec<String> = Vec::new();
        for field in rule_fields.into_iter().chain(derived_fields).chain(display_fields) {
            let field = canonical_metric(&field);
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        fields
    }

    /// Provider queries for the configured fetch mode
    pub fn build_requests(&self) -> Vec<ProviderRequest> {
        let fields = self.requested_fields();
        let pushdown = |timeframe: Option<Timeframe>| -> Vec<ProviderFilter> {
            if !self.settings.pushdown {
                return Vec::new();
            }
            self.filter
                .rules()
                .rules()
                .iter()
                .filter(|rule| {
                    timeframe.map_or(true, |tf| {
                        rule.metrics().all(|m| split_metric(m).1 == tf)
                    })
                })
                .map(|rule| {
                    let bare = |name: &str| match timeframe {
                        Some(_) => split_metric(name).0.to_string(),
                        None => name.to_string(),
                    };
                    ProviderFilter {
                        field: bare(&rule.left),
                        operator: rule.operator,
                        value: match &rule.right {
                            Operand::Metric(m) => Operand::Metric(bare(m)),
                            constant => constant.clone(),
                        },
                    }
                })
                .collect()
        };

        match self.settings.fetch_mode {
            FetchMode::Wide => vec![ProviderRequest {
                market: self.settings.market.clone(),
                timeframe: Timeframe::Daily,
                fields,
                filters: pushdown(None),
                limit: self.settings.limit,
            }],
            FetchMode::PerTimeframe => {
                // Daily first so result order follows the daily query
                [
                    Timeframe::Daily,
                    Timeframe::Weekly,
                    Timeframe::FourHour,
                    Timeframe::OneHour,
                ]
                .into_iter()
                .filter_map(|timeframe| {
                    let bare: Vec<String> = fields
                        .iter()
                        .map(|f| split_metric(f))
                        .filter(|(_, tf)| *tf == timeframe)
                        .map(|(base, _)| base.to_string())
                        .collect();
                    if bare.is_empty() {
                        return None;
                    }
                    Some(ProviderRequest {
                        market: self.settings.market.clone(),
                        timeframe,
                        fields: bare,
                        filters: pushdown(Some(timeframe)),
                        limit: self.settings.limit,
                    })
                })
                .collect()
            }
        }
    }

    async fn fetch_rows(&self) -> Result<Vec<ScanRow>> {
        let requests = self.build_requests();

        // Timeframe queries are independent of each other
        let results = futures::future::join_all(
            requests.iter().map(|request| self.provider.fetch(request)),
        )
        .await;

        let mut tables = Vec::with_capacity(results.len());
        for (request, result) in requests.iter().zip(results) {
            match result {
                Ok(table) => {
                    debug!(
                        "{} returned {} rows for {}",
                        self.provider.name(),
                        table.len(),
                        request.timeframe
                    );
                    tables.push(table);
                }
                Err(e) => {
                    warn!(
                        "{} failed for {} timeframe: {}",
                        self.provider.name(),
                        request.timeframe,
                        e
                    );
                    return Err(e);
                }
            }
        }

        Ok(match self.settings.fetch_mode {
            FetchMode::Wide => tables
                .first()
                .map(|table| self.filter.apply_wide(table))
                .unwrap_or_default(),
            FetchMode::PerTimeframe => self.filter.apply_timeframes(&tables),
        })
    }

    /// Run a scan. Provider failures come back as an empty outcome with a
    /// displayable reason, never as an error.
    pub async fn scan(&self, watchlist: Option<&Watchlist>, sort: Option<SortOrder>) -> ScanOutcome {
        let started = Instant::now();

        let rows = match self.fetch_rows().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Scan of {} failed: {}", self.settings.market, e);
                return ScanOutcome::unavailable(&e, ScanScope::for_watchlist(watchlist));
            }
        };

        let candidates = rows.len();
        let (mut rows, scope) = watchlist::intersect(rows, watchlist);
        confluence::sort_rows(&mut rows, sort.unwrap_or(self.settings.sort));

        let outcome = ScanOutcome::from_rows(rows, scope, candidates);
        info!(
            "{} ({} rules, {:.1}s)",
            outcome.summary(),
            self.filter.rules().len(),
            started.elapsed().as_secs_f64()
        );
        outcome
    }

    pub async fn health(&self) -> SourceHealth {
        self.provider.health().await
    }
}
