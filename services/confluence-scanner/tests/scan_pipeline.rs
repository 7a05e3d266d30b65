//! End-to-end scan harness
//!
//! provider tables → confluence filter → watchlist → sort → outcome → CSV

mod static_provider;

use confluence_scanner::{
    export, normalizers::normalize_symbol, refine, ConfluenceFilter, ConfluenceRule,
    ConfluenceScanner, DerivedColumn, FetchMode, MetricRow, MetricTable, RuleSet, ScanError,
    ScanOutcome, ScanScope, ScanSettings, ScanStatus, SortOrder, Timeframe, Watchlist,
};
use static_provider::{passing_row, trend_table, StaticProvider};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn wide_settings() -> ScanSettings {
    ScanSettings {
        volume_floor: Some(500_000.0),
        ..ScanSettings::default()
    }
}

fn per_timeframe_settings() -> ScanSettings {
    ScanSettings {
        fetch_mode: FetchMode::PerTimeframe,
        ..ScanSettings::default()
    }
}

fn sample_rows() -> Vec<MetricRow> {
    let mut missing_ema = passing_row("NYSE:KO", 900_000.0, 1.0);
    missing_ema.insert("EMA20_240", None);

    vec![
        passing_row("NASDAQ:AAPL", 600_000.0, 2.0),
        passing_row("NASDAQ:MSFT", 400_000.0, 3.0),
        passing_row("NASDAQ:TSLA", 2_000_000.0, 9.0),
        passing_row("NASDAQ:NVDA", 1_000_000.0, 4.0).with_metric("close_1W", 49.0),
        missing_ema,
        passing_row("AMEX:SPY", f64::NAN, 1.0),
    ]
}

#[tokio::test]
async fn test_wide_scan_end_to_end() {
    let provider = Arc::new(StaticProvider::new(vec![MetricTable::new(
        Timeframe::Daily,
        sample_rows(),
    )]));
    let scanner = ConfluenceScanner::new(provider.clone(), wide_settings()).unwrap();

    let outcome = scanner.scan(None, None).await;

    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.status, ScanStatus::Matches);
    assert_eq!(outcome.scope, ScanScope::MarketWide);
    assert_eq!(outcome.symbols(), vec!["TSLA", "AAPL"]);
    assert_eq!(outcome.candidates, 2);
    assert_eq!(outcome.summary(), "Found 2 matches market-wide");

    let csv = export::export_csv(&outcome.rows, &export::default_columns()).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("TSLA,105,9.38,down,up,9,2000000"));
}

#[tokio::test]
async fn test_watchlist_scan_and_refine() {
    let provider = Arc::new(StaticProvider::new(vec![MetricTable::new(
        Timeframe::Daily,
        sample_rows(),
    )]));
    let scanner = ConfluenceScanner::new(provider.clone(), wide_settings()).unwrap();
    let watchlist = Watchlist::parse_upload("Ticker,Note\nnasdaq:aapl,core\nGME,meme\n").unwrap();

    let outcome = scanner.scan(Some(&watchlist), None).await;
    assert_eq!(outcome.symbols(), vec!["AAPL"]);
    assert_eq!(outcome.scope, ScanScope::WatchlistFiltered { watchlist_size: 2 });
    assert_eq!(outcome.candidates, 2);

    // Refinement works from the outcome alone
    let market_wide = scanner.scan(None, Some(SortOrder::None)).await;
    let calls_before = provider.calls.load(Ordering::SeqCst);
    let refined = refine(
        &market_wide,
        Some(&Watchlist::from_symbols(["tsla"])),
        SortOrder::PercentChangeDesc,
    );
    assert_eq!(provider.calls.load(Ordering::SeqCst), calls_before);
    assert_eq!(refined.symbols(), vec!["TSLA"]);

    let none = refine(&market_wide, Some(&Watchlist::from_symbols(["GME"])), SortOrder::None);
    assert!(none.is_empty());
    assert_eq!(none.status, ScanStatus::NoMatches);
    assert!(none.summary().contains("None of the 1 watchlist symbols"));
}

#[tokio::test]
async fn test_three_table_intersection_scenario() {
    let provider = Arc::new(StaticProvider::new(vec![
        trend_table(Timeframe::Weekly, &["AAPL", "MSFT"]),
        trend_table(Timeframe::Daily, &["AAPL", "MSFT", "TSLA"]),
        trend_table(Timeframe::FourHour, &["AAPL", "TSLA"]),
    ]));
    let scanner = ConfluenceScanner::new(provider.clone(), per_timeframe_settings()).unwrap();

    let outcome = scanner.scan(None, None).await;

    // Daily, weekly, 4-hour and the display-only 1-hour query
    assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.symbols(), vec!["AAPL"]);
    assert_eq!(outcome.rows[0].metric("close_1W"), Some(110.0));
    assert_eq!(outcome.rows[0].metric("EMA20_240"), Some(100.0));
}

#[tokio::test]
async fn test_failing_timeframe_fails_scan() {
    let provider = StaticProvider::new(vec![
        trend_table(Timeframe::Weekly, &["AAPL"]),
        trend_table(Timeframe::Daily, &["AAPL"]),
        trend_table(Timeframe::FourHour, &["AAPL"]),
    ])
    .failing_on(Timeframe::FourHour, || ScanError::RateLimited {
        provider: "static".to_string(),
        retry_after: Some(30),
    });
    let scanner = ConfluenceScanner::new(Arc::new(provider), per_timeframe_settings()).unwrap();

    let outcome = scanner.scan(None, None).await;

    assert!(outcome.is_empty());
    match &outcome.status {
        ScanStatus::ProviderUnavailable { reason } => assert!(reason.contains("30s")),
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(refine(&outcome, None, SortOrder::None), outcome);
}

#[test]
fn test_filter_properties() {
    let filter = ConfluenceFilter::new(
        RuleSet::triple_confluence(20).with_rule(ConfluenceRule::floor("volume", 500_000.0)),
        Vec::new(),
    );
    let rows = sample_rows();

    let kept = filter.filter_rows(&rows);
    let symbols: Vec<&str> = kept.iter().map(|r| r.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["AAPL", "TSLA"]);

    // Subset, every survivor passes, every dropped row fails a rule
    assert!(kept.iter().all(|r| rows.contains(r)));
    assert!(kept.iter().all(|r| filter.rules().evaluate(r)));
    for dropped in rows.iter().filter(|r| !kept.contains(r)) {
        assert!(filter.rules().first_failure(dropped).is_some(), "{} kept", dropped.symbol);
    }

    assert_eq!(filter.filter_rows(&kept), kept);
}

#[test]
fn test_watchlist_commutes_with_filter() {
    let filter = ConfluenceFilter::new(
        RuleSet::triple_confluence(20).with_rule(ConfluenceRule::floor("volume", 500_000.0)),
        Vec::new(),
    );
    let rows = sample_rows();

    for watchlist in [
        Watchlist::from_symbols(["AAPL", "MSFT"]),
        Watchlist::from_symbols(["nyse:ko", "tsla", "GME"]),
        Watchlist::from_symbols(["GME"]),
    ] {
        let filter_then_narrow = watchlist.filter_rows(&filter.filter_rows(&rows));
        let narrow_then_filter = filter.filter_rows(&watchlist.filter_rows(&rows));
        assert_eq!(filter_then_narrow, narrow_then_filter);
    }
}

#[test]
fn test_watchlist_scenario() {
    let rows: Vec<confluence_scanner::ScanRow> = ["AAPL", "MSFT"]
        .iter()
        .map(|s| confluence_scanner::ScanRow {
            row: passing_row(s, 1.0, 1.0),
            derived: Default::default(),
        })
        .collect();
    let (kept, scope) =
        confluence_scanner::watchlist::intersect(rows, Some(&Watchlist::from_symbols(["AAPL", "TSLA"])));

    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].symbol(), "AAPL");
    assert_eq!(scope, ScanScope::WatchlistFiltered { watchlist_size: 2 });
}

#[test]
fn test_symbol_normalization() {
    assert_eq!(normalize_symbol("NASDAQ:AAPL"), "AAPL");
    assert_eq!(normalize_symbol("aapl "), "AAPL");
    for raw in ["NASDAQ:AAPL", " nyse:brk.b", "tsla", ""] {
        let once = normalize_symbol(raw);
        assert_eq!(normalize_symbol(&once), once);
    }
}

#[test]
fn test_outcome_survives_json_round_trip() {
    let provider = Arc::new(StaticProvider::new(vec![MetricTable::new(
        Timeframe::Daily,
        sample_rows(),
    )]));
    let scanner = ConfluenceScanner::new(provider, wide_settings()).unwrap();
    let outcome = tokio_test::block_on(scanner.scan(None, None));

    // A client hands the outcome back to /scan/refine and /scan/export
    let json = serde_json::to_string(&outcome).unwrap();
    let back: ScanOutcome = serde_json::from_str(&json).unwrap();
    assert_eq!(back.symbols(), outcome.symbols());
    assert_eq!(back.rows[0].percent_change(), outcome.rows[0].percent_change());
    assert_eq!(back.scope, outcome.scope);
}

#[test]
fn test_custom_derived_columns() {
    let settings = ScanSettings {
        derived: Some(vec![
            DerivedColumn::PercentChange,
            DerivedColumn::DisplayDefault {
                field: "relative_volume_10d_calc".to_string(),
            },
        ]),
        ..wide_settings()
    };
    let provider = Arc::new(StaticProvider::new(vec![MetricTable::new(
        Timeframe::Daily,
        vec![passing_row("AAPL", 600_000.0, 0.0).with_metric("relative_volume_10d_calc", 1.5)],
    )]));
    let scanner = ConfluenceScanner::new(provider, settings).unwrap();
    let outcome = tokio_test::block_on(scanner.scan(None, None));

    let row = &outcome.rows[0];
    assert_eq!(row.percent_change(), Some(0.0));
    assert_eq!(row.derived.len(), 2);
    assert!(row.derived("momentum").is_none());
}
