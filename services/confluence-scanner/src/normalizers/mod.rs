// Normalization of symbols and metric names coming from providers and watchlists
use crate::types::Timeframe;

/// Timeframe suffixes accepted on metric names, canonical spellings first
pub static TIMEFRAME_SUFFIXES: phf::Map<&'static str, Timeframe> = phf::phf_map! {
    "1W" => Timeframe::Weekly,
    "W" => Timeframe::Weekly,
    "1D" => Timeframe::Daily,
    "D" => Timeframe::Daily,
    "240" => Timeframe::FourHour,
    "4H" => Timeframe::FourHour,
    "60" => Timeframe::OneHour,
    "1H" => Timeframe::OneHour,
};

/// Canonical ticker: trimmed, upper-case, exchange prefix ("NASDAQ:") stripped
pub fn normalize_symbol(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    match upper.rsplit_once(':') {
        Some((_, ticker)) => ticker.trim().to_string(),
        None => upper,
    }
}

/// Split a metric name into its base name and timeframe.
///
/// Only a trailing `_<suffix>` naming a known timeframe counts, so names such
/// as `premarket_close` stay whole and read as daily.
pub fn split_metric(name: &str) -> (&str, Timeframe) {
    if let Some((base, suffix)) = name.rsplit_once('_') {
        if let Some(timeframe) = TIMEFRAME_SUFFIXES.get(suffix.to_uppercase().as_str()) {
            if !base.is_empty() {
                return (base, *timeframe);
            }
        }
    }
    (name, Timeframe::Daily)
}

/// Rewrite a metric name into its canonical suffix spelling
pub fn canonical_metric(name: &str) -> String {
    let (base, timeframe) = split_metric(name);
    timeframe.metric(base)
}
