//! Display columns computed on rows that survived the rule filter.
//!
//! None of these affect pass/fail. The 1-hour dip flag in particular only
//! marks pullback entries inside an otherwise bullish multi-timeframe trend.

use serde::{Deserialize, Serialize};

use crate::types::{MetricRow, Timeframe};

/// A derived column, expressed as data so deployments can pick their own set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivedColumn {
    /// `change / (close - change) * 100`, two decimals
    PercentChange,
    /// "up" when the MACD line is above its signal on `timeframe`
    MomentumDirection { timeframe: Timeframe },
    /// "dip" when close is below `ema` on `timeframe`
    DipStatus { timeframe: Timeframe, ema: String },
    /// Raw field shown as 0 when the provider has no value
    DisplayDefault { field: String },
}

impl DerivedColumn {
    /// Key the value is stored under on a `ScanRow`
    pub fn name(&self) -> String {
        match self {
            DerivedColumn::PercentChange => "percent_change".to_string(),
            DerivedColumn::MomentumDirection { .. } => "momentum".to_string(),
            DerivedColumn::DipStatus { .. } => "dip_status".to_string(),
            DerivedColumn::DisplayDefault { field } => field.clone(),
        }
    }

    /// Metrics that must be fetched to compute this column
    pub fn inputs(&self) -> Vec<String> {
        match self {
            DerivedColumn::PercentChange => vec!["close".to_string(), "change".to_string()],
            DerivedColumn::MomentumDirection { timeframe } => vec![
                timeframe.metric("MACD.macd"),
                timeframe.metric("MACD.signal"),
            ],
            DerivedColumn::DipStatus { timeframe, ema } => {
                vec![timeframe.metric("close"), timeframe.metric(ema)]
            }
            DerivedColumn::DisplayDefault { field } => vec![field.clone()],
        }
    }

    pub fn compute(&self, row: &MetricRow) -> DerivedValue {
        match self {
            DerivedColumn::PercentChange => {
                let pct = match (row.get("close"), row.get("change")) {
                    (Some(close), Some(change)) => percent_change(close, change),
                    _ => 0.0,
                };
                DerivedValue::Number(pct)
            }
            DerivedColumn::MomentumDirection { timeframe } => {
                let line = row.get(&timeframe.metric("MACD.macd"));
                let signal = row.get(&timeframe.metric("MACD.signal"));
                let momentum = match (line, signal) {
                    (Some(l), Some(s)) if l > s => Momentum::Up,
                    _ => Momentum::Down,
                };
                DerivedValue::Label(momentum.as_str().to_string())
            }
            DerivedColumn::DipStatus { timeframe, ema } => {
                let close = row.get(&timeframe.metric("close"));
                let average = row.get(&timeframe.metric(ema));
                let status = match (close, average) {
                    (Some(c), Some(a)) if c < a => DipStatus::Dip,
                    _ => DipStatus::Up,
                };
                DerivedValue::Label(status.as_str().to_string())
            }
            DerivedColumn::DisplayDefault { field } => {
                DerivedValue::Number(row.get(field).unwrap_or(0.0))
            }
        }
    }
}

/// Percentage change against the previous close, rounded to 2 decimals.
///
/// Returns 0 when the previous close (`close - change`) is zero.
pub fn percent_change(close: f64, change: f64) -> f64 {
    let previous = close - change;
    if previous == 0.0 {
        return 0.0;
    }
    let pct = change / previous * 100.0;
    if !pct.is_finite() {
        return 0.0;
    }
    (pct * 100.0).round() / 100.0
}

/// Computed column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DerivedValue {
    Number(f64),
    Label(String),
}

impl DerivedValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DerivedValue::Number(v) => Some(*v),
            DerivedValue::Label(_) => None,
        }
    }

    pub fn as_label(&self) -> Option<&str> {
        match self {
            DerivedValue::Label(s) => Some(s),
            DerivedValue::Number(_) => None,
        }
    }
}

impl std::fmt::Display for DerivedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DerivedValue::Number(v) => write!(f, "{}", v),
            DerivedValue::Label(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Momentum {
    Up,
    Down,
}

impl Momentum {
    pub fn as_str(&self) -> &'static str {
        match self {
            Momentum::Up => "up",
            Momentum::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DipStatus {
    Dip,
    Up,
}

impl DipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DipStatus::Dip => "dip",
            DipStatus::Up => "up",
        }
    }
}

/// Percent change, momentum on `momentum_timeframe`, 1-hour EMA20 dip flag
/// and zero-defaulted pre-market quotes
pub fn default_columns(momentum_timeframe: Timeframe) -> Vec<DerivedColumn> {
    vec![
        DerivedColumn::PercentChange,
        DerivedColumn::MomentumDirection {
            timeframe: momentum_timeframe,
        },
        DerivedColumn::DipStatus {
            timeframe: Timeframe::OneHour,
            ema: "EMA20".to_string(),
        },
        DerivedColumn::DisplayDefault {
            field: "premarket_close".to_string(),
        },
        DerivedColumn::DisplayDefault {
            field: "premarket_change".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_change_guard() {
        assert_eq!(percent_change(10.0, 0.0), 0.0);
        assert_eq!(percent_change(10.0, 10.0), 0.0);
        assert_eq!(percent_change(0.0, 0.0), 0.0);

        let no_close = MetricRow::new("AAPL").with_metric("change", 5.0);
        let no_change = MetricRow::new("AAPL").with_metric("close", 105.0);
        assert_eq!(DerivedColumn::PercentChange.compute(&no_close), DerivedValue::Number(0.0));
        assert_eq!(DerivedColumn::PercentChange.compute(&no_change), DerivedValue::Number(0.0));
    }

    #[test]
    fn test_percent_change_rounding() {
        // previous close 100 -> +5%
        assert_eq!(percent_change(105.0, 5.0), 5.0);
        // previous close 30 -> 3.333..%
        assert_eq!(percent_change(31.0, 1.0), 3.33);
        assert_eq!(percent_change(97.0, -3.0), -3.0);
    }

    #[test]
    fn test_momentum_direction() {
        let column = DerivedColumn::MomentumDirection {
            timeframe: Timeframe::FourHour,
        };
        let up = MetricRow::new("AAPL")
            .with_metric("MACD.macd_240", 1.2)
            .with_metric("MACD.signal_240", 0.8);
        let down = MetricRow::new("AAPL")
            .with_metric("MACD.macd_240", 0.5)
            .with_metric("MACD.signal_240", 0.8);
        let missing = MetricRow::new("AAPL").with_metric("MACD.macd_240", 0.5);

        assert_eq!(column.compute(&up).as_label(), Some("up"));
        assert_eq!(column.compute(&down).as_label(), Some("down"));
        assert_eq!(column.compute(&missing).as_label(), Some("down"));
        assert_eq!(column.name(), "momentum");
    }

    #[test]
    fn test_dip_status() {
        let column = DerivedColumn::DipStatus {
            timeframe: Timeframe::OneHour,
            ema: "EMA20".to_string(),
        };
        let dip = MetricRow::new("TSLA")
            .with_metric("close_60", 240.0)
            .with_metric("EMA20_60", 245.0);
        let above = MetricRow::new("TSLA")
            .with_metric("close_60", 250.0)
            .with_metric("EMA20_60", 245.0);

        assert_eq!(column.compute(&dip).as_label(), Some("dip"));
        assert_eq!(column.compute(&above).as_label(), Some("up"));
        assert_eq!(column.compute(&MetricRow::new("TSLA")).as_label(), Some("up"));
    }

    #[test]
    fn test_premarket_defaults_to_zero() {
        let column = DerivedColumn::DisplayDefault {
            field: "premarket_close".to_string(),
        };
        let mut row = MetricRow::new("MSFT");
        row.insert("premarket_close", None);
        assert_eq!(column.compute(&row), DerivedValue::Number(0.0));

        let row = MetricRow::new("MSFT").with_metric("premarket_close", 411.5);
        assert_eq!(column.compute(&row).as_f64(), Some(411.5));
    }

    #[test]
    fn test_columns_deserialize_from_config() {
        let columns: Vec<DerivedColumn> = serde_json::from_str(
            r#"[{"kind":"percent_change"},{"kind":"momentum_direction","timeframe":"four_hour"}]"#,
        )
        .unwrap();
        assert_eq!(columns[0], DerivedColumn::PercentChange);
        assert_eq!(
            columns[1].inputs(),
            vec!["MACD.macd_240".to_string(), "MACD.signal_240".to_string()]
        );
    }
}
