//! Watchlist parsing and intersection
//!
//! A watchlist narrows a scan to symbols the user cares about. Entries are
//! normalized the same way provider symbols are, so `NASDAQ:AAPL`, `aapl`
//! and ` AAPL ` all match the `AAPL` result row.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::confluence::ScanRow;
use crate::normalizers::normalize_symbol;
use crate::types::{MetricRow, Result, ScanError};

/// Ordered, de-duplicated set of canonical tickers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Watchlist {
    symbols: Vec<String>,
}

impl From<Vec<String>> for Watchlist {
    fn from(raw: Vec<String>) -> Self {
        Self::from_symbols(raw)
    }
}

impl From<Watchlist> for Vec<String> {
    fn from(watchlist: Watchlist) -> Self {
        watchlist.symbols
    }
}

impl Watchlist {
    pub fn from_symbols<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let symbols = raw
            .into_iter()
            .map(|s| normalize_symbol(s.as_ref()))
            .filter(|s| !s.is_empty())
            .filter(|s| seen.insert(s.clone()))
            .collect();
        Self { symbols }
    }

    /// Free text: symbols separated by commas, semicolons or whitespace
    pub fn parse_text(text: &str) -> Self {
        Self::from_symbols(
            text.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                .filter(|s| !s.trim().is_empty()),
        )
    }

    /// Delimited table with a header naming a symbol or ticker column.
    ///
    /// The delimiter (comma, semicolon or tab) is taken from the header line.
    pub fn parse_table(data: &str) -> Result<Self> {
        let data = data.trim_start_matches('\u{feff}');
        let header = data
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| ScanError::InvalidWatchlistFile("file is empty".to_string()))?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(sniff_delimiter(header))
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(data.trim_start().as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| ScanError::InvalidWatchlistFile(e.to_string()))?
            .clone();

        let column = headers
            .iter()
            .position(is_symbol_header)
            .ok_or_else(|| {
                ScanError::InvalidWatchlistFile(format!(
                    "no symbol or ticker column in header: {}",
                    headers.iter().collect::<Vec<_>>().join(", ")
                ))
            })?;

        let mut symbols = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| ScanError::InvalidWatchlistFile(e.to_string()))?;
            if let Some(value) = record.get(column) {
                symbols.push(value.to_string());
            }
        }

        debug!("Parsed {} watchlist entries from column {}", symbols.len(), column);
        Ok(Self::from_symbols(symbols))
    }

    /// Uploaded file contents, tabular or free text.
    ///
    /// Anything with a delimiter or a symbol/ticker header on its first line
    /// is read as a table and must have a symbol column.
    pub fn parse_upload(data: &str) -> Result<Self> {
        let first = data
            .trim_start_matches('\u{feff}')
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default();

        let tabular = first.contains([',', ';', '\t'])
            || is_symbol_header(first);
        if tabular {
            Self::parse_table(data)
        } else {
            Ok(Self::parse_text(data))
        }
    }

    /// Raw upload bytes. Anything that is not UTF-8 text (spreadsheets,
    /// archives) is rejected as an invalid watchlist file.
    pub fn parse_upload_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|e| {
            ScanError::InvalidWatchlistFile(format!("not a text file ({})", e))
        })?;
        Self::parse_upload(text)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Metric rows whose symbol is on the list, in input order
    pub fn filter_rows(&self, rows: &[MetricRow]) -> Vec<MetricRow> {
        let keys: HashSet<&str> = self.symbols.iter().map(String::as_str).collect();
        rows.iter()
            .filter(|r| keys.contains(normalize_symbol(&r.symbol).as_str()))
            .cloned()
            .collect()
    }
}

fn is_symbol_header(name: &str) -> bool {
    let name = name.trim().to_lowercase();
    name.contains("symbol") || name.contains("ticker")
}

fn sniff_delimiter(header: &str) -> u8 {
    [b'\t', b';', b',']
        .into_iter()
        .max_by_key(|d| header.bytes().filter(|b| b == d).count())
        .filter(|d| header.as_bytes().contains(d))
        .unwrap_or(b',')
}

/// Whether results cover the whole market or only a watchlist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanScope {
    MarketWide,
    WatchlistFiltered { watchlist_size: usize },
}

impl ScanScope {
    pub fn for_watchlist(watchlist: Option<&Watchlist>) -> Self {
        match watchlist.filter(|w| !w.is_empty()) {
            Some(w) => Self::WatchlistFiltered {
                watchlist_size: w.len(),
            },
            None => Self::MarketWide,
        }
    }
}

/// Restrict scan rows to a watchlist.
///
/// No watchlist, or an empty one, passes rows through as market-wide.
pub fn intersect(rows: Vec<ScanRow>, watchlist: Option<&Watchlist>) -> (Vec<ScanRow>, ScanScope) {
    let scope = ScanScope::for_watchlist(watchlist);
    let Some(watchlist) = watchlist.filter(|w| !w.is_empty()) else {
        return (rows, scope);
    };

    let keys: HashSet<&str> = watchlist.symbols().iter().map(String::as_str).collect();
    let kept: Vec<ScanRow> = rows
        .into_iter()
        .filter(|r| keys.contains(normalize_symbol(r.symbol()).as_str()))
        .collect();

    debug!(
        "Watchlist of {} kept {} rows",
        watchlist.len(),
        kept.len()
    );
    (kept, scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_row(symbol: &str) -> ScanRow {
        ScanRow {
            row: MetricRow::new(symbol).with_metric("close", 100.0),
            derived: Default::default(),
        }
    }

    #[test]
    fn test_watchlist_intersection() {
        let watchlist = Watchlist::from_symbols(["NASDAQ:AAPL", "tsla"]);
        let (rows, scope) = intersect(vec![scan_row("AAPL"), scan_row("MSFT")], Some(&watchlist));

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol(), "AAPL");
        assert_eq!(scope, ScanScope::WatchlistFiltered { watchlist_size: 2 });
    }

    #[test]
    fn test_no_watchlist_is_market_wide() {
        let rows = vec![scan_row("AAPL"), scan_row("MSFT")];
        let (kept, scope) = intersect(rows.clone(), None);
        assert_eq!(kept, rows);
        assert_eq!(scope, ScanScope::MarketWide);

        let (kept, scope) = intersect(rows.clone(), Some(&Watchlist::default()));
        assert_eq!(kept.len(), 2);
        assert_eq!(scope, ScanScope::MarketWide);
    }

    #[test]
    fn test_no_overlap_is_empty_not_error() {
        let watchlist = Watchlist::from_symbols(["GME"]);
        let (rows, scope) = intersect(vec![scan_row("AAPL")], Some(&watchlist));
        assert!(rows.is_empty());
        assert_eq!(scope, ScanScope::WatchlistFiltered { watchlist_size: 1 });
    }

    #[test]
    fn test_from_symbols_normalizes_and_dedupes() {
        let watchlist = Watchlist::from_symbols(["NASDAQ:AAPL", "aapl ", "", "  ", "amex:spy"]);
        assert_eq!(watchlist.symbols(), ["AAPL", "SPY"]);
    }

    #[test]
    fn test_parse_text() {
        let watchlist = Watchlist::parse_text("aapl, NASDAQ:MSFT\ntsla;nvda  amd");
        assert_eq!(watchlist.symbols(), ["AAPL", "MSFT", "TSLA", "NVDA", "AMD"]);
    }

    #[test]
    fn test_parse_table_finds_symbol_column() {
        let csv = "Name, Ticker Symbol ,Sector\nApple,NASDAQ:AAPL,Tech\nTesla,tsla,Auto\n";
        let watchlist = Watchlist::parse_table(csv).unwrap();
        assert_eq!(watchlist.symbols(), ["AAPL", "TSLA"]);

        let tsv = "\u{feff}ticker\tnote\nmsft\tcore\n";
        assert_eq!(Watchlist::parse_table(tsv).unwrap().symbols(), ["MSFT"]);

        let semi = "Symbol;Weight\nNVDA;0.5\nAMD;0.5\n";
        assert_eq!(Watchlist::parse_table(semi).unwrap().symbols(), ["NVDA", "AMD"]);
    }

    #[test]
    fn test_parse_table_without_symbol_column() {
        let err = Watchlist::parse_table("name,sector\nApple,Tech\n").unwrap_err();
        assert!(matches!(err, ScanError::InvalidWatchlistFile(_)));

        let err = Watchlist::parse_table("   \n").unwrap_err();
        assert!(matches!(err, ScanError::InvalidWatchlistFile(_)));
    }

    #[test]
    fn test_parse_upload_picks_format() {
        assert_eq!(
            Watchlist::parse_upload("AAPL\nMSFT\n").unwrap().symbols(),
            ["AAPL", "MSFT"]
        );
        assert_eq!(
            Watchlist::parse_upload("symbol\nAAPL\n").unwrap().symbols(),
            ["AAPL"]
        );
        assert!(Watchlist::parse_upload("company,sector\nApple,Tech").is_err());
    }

    #[test]
    fn test_parse_upload_bytes_rejects_binary() {
        // zip local header, as in an xlsx upload
        let err = Watchlist::parse_upload_bytes(&[0x50, 0x4b, 0x03, 0x04, 0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, ScanError::InvalidWatchlistFile(_)));

        let watchlist = Watchlist::parse_upload_bytes(b"symbol\nnasdaq:aapl\n").unwrap();
        assert_eq!(watchlist.symbols(), ["AAPL"]);
    }

    #[test]
    fn test_serde_normalizes_on_deserialize() {
        let watchlist: Watchlist = serde_json::from_str(r#"["nyse:ko", "pep"]"#).unwrap();
        assert_eq!(watchlist.symbols(), ["KO", "PEP"]);
        assert_eq!(serde_json::to_string(&watchlist).unwrap(), r#"["KO","PEP"]"#);
    }
}
