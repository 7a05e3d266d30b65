use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::AppState;
use confluence_scanner::{
    export, refine, types::SourceHealth, DerivedColumn, FetchMode, RuleSet, ScanOutcome,
    SortOrder, Watchlist,
};

/// Body for POST /scan
#[derive(Debug, Default, serde::Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub watchlist: Option<Watchlist>,
    #[serde(default)]
    pub sort: Option<SortOrder>,
}

/// Body for POST /scan/refine
#[derive(Debug, serde::Deserialize)]
pub struct RefineRequest {
    pub previous: ScanOutcome,
    #[serde(default)]
    pub watchlist: Option<Watchlist>,
    #[serde(default)]
    pub sort: Option<SortOrder>,
}

/// POST /scan - Run the confluence scan, optionally narrowed to a watchlist.
/// An empty body scans market-wide with the configured sort.
pub async fn scan(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ScanResponse>, (StatusCode, String)> {
    let req: ScanRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ScanRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            warn!("Bad scan request: {}", e);
            (StatusCode::BAD_REQUEST, format!("invalid scan request: {}", e))
        })?
    };

    let outcome = state.scanner.scan(req.watchlist.as_ref(), req.sort).await;
    Ok(Json(ScanResponse::from(outcome)))
}

/// POST /scan/upload - Scan with a watchlist file (CSV/TSV or free text).
/// An unreadable file does not fail the request; the scan runs market-wide
/// and the problem comes back as `watchlist_warning`.
pub async fn scan_upload(State(state): State<Arc<AppState>>, body: Bytes) -> Json<ScanResponse> {
    let (watchlist, warning) = match Watchlist::parse_upload_bytes(&body) {
        Ok(watchlist) => {
            info!("Uploaded watchlist has {} symbols", watchlist.len());
            (Some(watchlist), None)
        }
        Err(e) => {
            warn!("Ignoring watchlist upload: {}", e);
            (None, Some(e.user_message()))
        }
    };

    let outcome = state
        .scanner
        .scan(watchlist.as_ref(), None)
        .await
        .with_warning(warning);
    Json(ScanResponse::from(outcome))
}

/// POST /scan/refine - Narrow or re-sort a previous outcome without refetching
pub async fn refine_scan(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefineRequest>,
) -> Json<ScanResponse> {
    let sort = req.sort.unwrap_or(state.scanner.settings().sort);
    let outcome = refine(&req.previous, req.watchlist.as_ref(), sort);
    info!("Refined: {}", outcome.summary());
    Json(ScanResponse::from(outcome))
}

/// POST /scan/export - Render an outcome as CSV
pub async fn export_csv(
    State(state): State<Arc<AppState>>,
    Json(outcome): Json<ScanOutcome>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let csv = export::export_csv(&outcome.rows, &state.export_columns).map_err(|e| {
        warn!("CSV export failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"confluence_scan.csv\"",
            ),
        ],
        csv,
    ))
}

/// GET /rules - Active rule set and derived columns
pub async fn get_rules(State(state): State<Arc<AppState>>) -> Json<RulesResponse> {
    let filter = state.scanner.filter();
    Json(RulesResponse {
        rules: filter.rules().rules().iter().map(|r| r.to_string()).collect(),
        rule_set: filter.rules().clone(),
        derived: filter.columns().to_vec(),
        fetch_mode: state.scanner.settings().fetch_mode,
        export_columns: state.export_columns.clone(),
    })
}

/// GET /health - Service health check
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let source_health = state.scanner.health().await;

    Json(HealthResponse {
        status: if source_health.is_healthy {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        sources: vec![source_health],
    })
}

// Response types
#[derive(Debug, serde::Serialize)]
pub struct ScanResponse {
    pub summary: String,
    #[serde(flatten)]
    pub outcome: ScanOutcome,
}

impl From<ScanOutcome> for ScanResponse {
    fn from(outcome: ScanOutcome) -> Self {
        Self {
            summary: outcome.summary(),
            outcome,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct RulesResponse {
    pub rules: Vec<String>,
    pub rule_set: RuleSet,
    pub derived: Vec<DerivedColumn>,
    pub fetch_mode: FetchMode,
    pub export_columns: Vec<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub sources: Vec<SourceHealth>,
}
