// Multi-timeframe confluence filtering
pub mod derived;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::normalizers::split_metric;
use crate::rules::RuleSet;
use crate::types::{MetricRow, MetricTable, Timeframe};
use derived::{DerivedColumn, DerivedValue};

/// A row that passed every rule, plus its display columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRow {
    #[serde(flatten)]
    pub row: MetricRow,
    #[serde(default)]
    pub derived: BTreeMap<String, DerivedValue>,
}

impl ScanRow {
    pub fn symbol(&self) -> &str {
        &self.row.symbol
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.row.get(name)
    }

    pub fn derived(&self, name: &str) -> Option<&DerivedValue> {
        self.derived.get(name)
    }

    pub fn percent_change(&self) -> Option<f64> {
        self.derived("percent_change").and_then(|v| v.as_f64())
    }
}

/// Result ordering requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Keep provider order
    #[default]
    None,
    PercentChangeDesc,
}

/// Stable sort; rows without a percent change go last
pub fn sort_rows(rows: &mut [ScanRow], order: SortOrder) {
    match order {
        SortOrder::None => {}
        SortOrder::PercentChangeDesc => rows.sort_by(|a, b| {
            let a = a.percent_change().unwrap_or(f64::NEG_INFINITY);
            let b = b.percent_change().unwrap_or(f64::NEG_INFINITY);
            b.total_cmp(&a)
        }),
    }
}

/// Applies a rule set to provider tables and decorates the survivors
#[derive(Debug, Clone)]
pub struct ConfluenceFilter {
    rules: RuleSet,
    columns: Vec<DerivedColumn>,
}

impl ConfluenceFilter {
    pub fn new(rules: RuleSet, columns: Vec<DerivedColumn>) -> Self {
        Self { rules, columns }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn columns(&self) -> &[DerivedColumn] {
        &self.columns
    }

    /// Rows satisfying every rule, in input order
    pub fn filter_rows(&self, rows: &[MetricRow]) -> Vec<MetricRow> {
        rows.iter()
            .filter(|row| {
                if row.symbol.is_empty() {
                    return false;
                }
                match self.rules.first_failure(row) {
                    Some(rule) => {
                        debug!("{} dropped: {} not satisfied", row.symbol, rule);
                        false
                    }
                    None => true,
                }
            })
            .cloned()
            .collect()
    }

    /// Filter one wide table whose columns carry timeframe suffixes
    pub fn apply_wide(&self, table: &MetricTable) -> Vec<ScanRow> {
        let survivors = self.filter_rows(&table.rows);
        self.decorate(survivors)
    }

    /// Filter one table per timeframe: existence intersection first, then rules
    /// on the merged rows
    pub fn apply_timeframes(&self, tables: &[MetricTable]) -> Vec<ScanRow> {
        let symbols = intersect_symbols(tables, &self.rules);
        debug!(
            "{} symbols present on every rule timeframe ({} tables)",
            symbols.len(),
            tables.len()
        );
        let merged = merge_tables(tables, &symbols);
        let survivors = self.filter_rows(&merged);
        self.decorate(survivors)
    }

    fn decorate(&self, rows: Vec<MetricRow>) -> Vec<ScanRow> {
        rows.into_iter()
            .map(|row| {
                let derived = self
                    .columns
                    .iter()
                    .map(|c| (c.name(), c.compute(&row)))
                    .collect();
                ScanRow { row, derived }
            })
            .collect()
    }
}

/// Symbols present in every table with non-null values for the metrics the
/// rules need on that table's timeframe. Tables on timeframes no rule reads
/// (display-only data) do not gate. Ordered as in the first gating table.
pub fn intersect_symbols(tables: &[MetricTable], rules: &RuleSet) -> Vec<String> {
    let gating_timeframes = rules.timeframes();
    let gating: Vec<&MetricTable> = tables
        .iter()
        .filter(|t| gating_timeframes.contains(&t.timeframe))
        .collect();
    let Some(first) = gating.first() else {
        return Vec::new();
    };

    let eligible: Vec<HashSet<&str>> = gating
        .iter()
        .map(|table| {
            let required = rules.metrics_for(table.timeframe);
            table
                .rows
                .iter()
                .filter(|row| !row.symbol.is_empty())
                .filter(|row| required.iter().all(|m| row.get(m).is_some()))
                .map(|row| row.symbol.as_str())
                .collect()
        })
        .collect();

    let mut out: Vec<String> = Vec::new();
    for row in &first.rows {
        let symbol = row.symbol.as_str();
        if eligible.iter().all(|set| set.contains(symbol))
            && !out.iter().any(|s| s == symbol)
        {
            out.push(symbol.to_string());
        }
    }
    out
}

/// Join per-timeframe tables into wide rows for `symbols`, suffixing bare
/// metric names with their table's timeframe
pub fn merge_tables(tables: &[MetricTable], symbols: &[String]) -> Vec<MetricRow> {
    let indexed: Vec<(Timeframe, HashMap<&str, &MetricRow>)> = tables
        .iter()
        .map(|table| {
            let mut by_symbol = HashMap::new();
            for row in &table.rows {
                by_symbol.entry(row.symbol.as_str()).or_insert(row);
            }
            (table.timeframe, by_symbol)
        })
        .collect();

    symbols
        .iter()
        .map(|symbol| {
            let mut merged = MetricRow::new(symbol);
            for (timeframe, by_symbol) in &indexed {
                let Some(row) = by_symbol.get(symbol.as_str()) else {
                    continue;
                };
                for (name, value) in &row.metrics {
                    let key = match split_metric(name) {
                        (_, Timeframe::Daily) => timeframe.metric(name),
                        _ => name.clone(),
                    };
                    merged.insert(key, *value);
                }
            }
            merged
        })
        .collect()
}
