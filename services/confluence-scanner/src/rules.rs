//! Confluence rules
//!
//! A rule set is a plain conjunction of comparisons between provider metrics
//! (or a metric and a constant). Evaluation is null-safe: a missing operand
//! makes the rule fail, never pass.

use serde::{Deserialize, Serialize};

use crate::normalizers::{canonical_metric, split_metric};
use crate::types::{MetricRow, Result, ScanError, Timeframe};

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    GreaterThan,
}

impl Operator {
    pub fn apply(&self, left: f64, right: f64) -> bool {
        match self {
            Operator::GreaterThan => left > right,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::GreaterThan => ">",
        }
    }
}

/// Right-hand side of a rule: another metric or a fixed number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Constant(f64),
    Metric(String),
}

impl Operand {
    pub fn resolve(&self, row: &MetricRow) -> Option<f64> {
        match self {
            Operand::Constant(v) if !v.is_nan() => Some(*v),
            Operand::Constant(_) => None,
            Operand::Metric(name) => row.get(name),
        }
    }

    pub fn metric(&self) -> Option<&str> {
        match self {
            Operand::Metric(name) => Some(name),
            Operand::Constant(_) => None,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Constant(v) => write!(f, "{}", v),
            Operand::Metric(name) => f.write_str(name),
        }
    }
}

/// One comparison condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfluenceRule {
    pub left: String,
    #[serde(default)]
    pub operator: Operator,
    pub right: Operand,
}

impl ConfluenceRule {
    pub fn greater_than(left: &str, right: Operand) -> Self {
        let right = match right {
            Operand::Metric(name) => Operand::Metric(canonical_metric(&name)),
            constant => constant,
        };
        Self {
            left: canonical_metric(left),
            operator: Operator::GreaterThan,
            right,
        }
    }

    /// Close above EMA{period} on `timeframe`
    pub fn trend(timeframe: Timeframe, ema_period: u32) -> Self {
        Self::greater_than(
            &timeframe.metric("close"),
            Operand::Metric(timeframe.metric(&format!("EMA{}", ema_period))),
        )
    }

    /// MACD line above its signal line on `timeframe`
    pub fn momentum(timeframe: Timeframe) -> Self {
        Self::greater_than(
            &timeframe.metric("MACD.macd"),
            Operand::Metric(timeframe.metric("MACD.signal")),
        )
    }

    /// `metric` strictly above a constant floor
    pub fn floor(metric: &str, value: f64) -> Self {
        Self::greater_than(metric, Operand::Constant(value))
    }

    /// True only when both operands are present and the comparison holds
    pub fn evaluate(&self, row: &MetricRow) -> bool {
        match (row.get(&self.left), self.right.resolve(row)) {
            (Some(left), Some(right)) => self.operator.apply(left, right),
            _ => false,
        }
    }

    /// Metric names this rule reads
    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.left.as_str()).chain(self.right.metric())
    }

    pub fn timeframe(&self) -> Timeframe {
        split_metric(&self.left).1
    }

    /// Whether this is the `close > EMA*` trend rule for `timeframe`
    pub fn is_trend_rule(&self, timeframe: Timeframe) -> bool {
        let Some(right) = self.right.metric() else {
            return false;
        };
        let (left_base, left_tf) = split_metric(&self.left);
        let (right_base, right_tf) = split_metric(right);

        self.operator == Operator::GreaterThan
            && left_base == "close"
            && left_tf == timeframe
            && right_tf == timeframe
            && right_base.starts_with("EMA")
    }
}

impl std::fmt::Display for ConfluenceRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.left, self.operator.symbol(), self.right)
    }
}

/// Conjunction of rules; a triple-confluence set always holds the weekly,
/// daily and 4-hour trend rules
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSet {
    rules: Vec<ConfluenceRule>,
}

impl RuleSet {
    /// Timeframes whose trend rule is mandatory
    pub const TREND_TIMEFRAMES: [Timeframe; 3] =
        [Timeframe::Weekly, Timeframe::Daily, Timeframe::FourHour];

    /// Close above EMA{ema_period} on weekly, daily and 4-hour charts
    pub fn triple_confluence(ema_period: u32) -> Self {
        Self {
            rules: Self::TREND_TIMEFRAMES
                .iter()
                .map(|tf| ConfluenceRule::trend(*tf, ema_period))
                .collect(),
        }
    }

    /// Build from explicit rules, rejecting sets without the three trend rules
    pub fn from_rules(rules: Vec<ConfluenceRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|r| ConfluenceRule::greater_than(&r.left, r.right))
            .collect();
        let set = Self { rules };
        set.validate()?;
        Ok(set)
    }

    /// Add a rule. Extra rules only ever narrow the result.
    pub fn with_rule(mut self, rule: ConfluenceRule) -> Self {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        for timeframe in Self::TREND_TIMEFRAMES {
            if !self.rules.iter().any(|r| r.is_trend_rule(timeframe)) {
                return Err(ScanError::InvalidRuleSet(format!(
                    "missing close > EMA trend rule for the {} timeframe",
                    timeframe
                )));
            }
        }
        Ok(())
    }

    pub fn rules(&self) -> &[ConfluenceRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, row: &MetricRow) -> bool {
        self.rules.iter().all(|r| r.evaluate(row))
    }

    /// First rule the row fails, if any
    pub fn first_failure(&self, row: &MetricRow) -> Option<&ConfluenceRule> {
        self.rules.iter().find(|r| !r.evaluate(row))
    }

    /// Every metric the rules read, suffixed, in first-seen order
    pub fn metrics(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for name in self.rules.iter().flat_map(|r| r.metrics()) {
            if !out.iter().any(|m| m == name) {
                out.push(name.to_string());
            }
        }
        out
    }

    /// Bare metric names the rules read on `timeframe`
    pub fn metrics_for(&self, timeframe: Timeframe) -> Vec<String> {
        self.metrics()
            .iter()
            .map(|m| split_metric(m))
            .filter(|(_, tf)| *tf == timeframe)
            .map(|(base, _)| base.to_string())
            .collect()
    }

    /// Timeframes the rules touch, in canonical order
    pub fn timeframes(&self) -> Vec<Timeframe> {
        let mut out: Vec<Timeframe> = self
            .metrics()
            .iter()
            .map(|m| split_metric(m).1)
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// Named rule configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RulePreset {
    #[default]
    TripleEma20,
    TripleEma26,
    TripleEma20Macd,
}

impl RulePreset {
    pub fn ema_period(&self) -> u32 {
        match self {
            RulePreset::TripleEma20 | RulePreset::TripleEma20Macd => 20,
            RulePreset::TripleEma26 => 26,
        }
    }

    pub fn build(&self, momentum_timeframe: Timeframe) -> RuleSet {
        let set = RuleSet::triple_confluence(self.ema_period());
        match self {
            RulePreset::TripleEma20Macd => {
                set.with_rule(ConfluenceRule::momentum(momentum_timeframe))
            }
            _ => set,
        }
    }
}
