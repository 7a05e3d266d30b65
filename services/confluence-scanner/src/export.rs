//! CSV export of scan results

use tracing::debug;

use crate::confluence::ScanRow;
use crate::types::{Result, ScanError};

/// Header labels for well-known column keys; other keys are used verbatim
pub static COLUMN_LABELS: phf::Map<&'static str, &'static str> = phf::phf_map! {
    "symbol" => "Symbol",
    "price" => "Price",
    "percent_change" => "% Change",
    "momentum" => "Momentum",
    "dip_status" => "1H Status",
    "change" => "Change",
    "volume" => "Volume",
    "relative_volume_10d_calc" => "Rel Volume",
    "premarket_close" => "Pre-Market Price",
    "premarket_change" => "Pre-Market Change",
};

/// symbol, price, percent change, derived signals, raw change, volume
pub fn default_columns() -> Vec<String> {
    ["symbol", "price", "percent_change", "momentum", "dip_status", "change", "volume"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn column_label(key: &str) -> &str {
    COLUMN_LABELS.get(key).copied().unwrap_or(key)
}

/// Cell text for `key`: the symbol, a derived value, or a raw metric
/// (`price` reads `close`). Missing values are left blank.
pub fn cell(row: &ScanRow, key: &str) -> String {
    match key {
        "symbol" => row.symbol().to_string(),
        "price" => row.metric("close").map(format_number).unwrap_or_default(),
        _ => match row.derived(key) {
            Some(value) => value.to_string(),
            None => row.metric(key).map(format_number).unwrap_or_default(),
        },
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Render rows as CSV with one header line of labels
pub fn export_csv(rows: &[ScanRow], columns: &[String]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);

    wtr.write_record(columns.iter().map(|c| column_label(c)))
        .map_err(|e| ScanError::Export(e.to_string()))?;

    for row in rows {
        wtr.write_record(columns.iter().map(|c| cell(row, c)))
            .map_err(|e| ScanError::Export(e.to_string()))?;
    }

    let bytes = wtr
        .into_inner()
        .map_err(|e| ScanError::Export(e.to_string()))?;
    debug!("Exported {} rows x {} columns", rows.len(), columns.len());
    String::from_utf8(bytes).map_err(|e| ScanError::Export(e.to_string()))
}
