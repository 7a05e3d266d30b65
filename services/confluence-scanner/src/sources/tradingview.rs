use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::ProviderSettings;
use crate::normalizers::{normalize_symbol, split_metric};
use crate::rules::{Operand, Operator};
use crate::types::*;

/// Longest we honor a Retry-After header before giving up on the retry
const MAX_RETRY_WAIT_SECS: u64 = 120;

/// Request outcome counters, updated on every call so health() needs no API call
struct HealthTracker {
    last_success_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    last_latency_ms: AtomicU64,
}

impl HealthTracker {
    fn new() -> Self {
        Self {
            last_success_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
        }
    }

    fn record_success(&self, latency_ms: u64) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.last_success_ms.store(now_ms, Ordering::Relaxed);
        self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.last_failure_ms.store(now_ms, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    fn is_healthy(&self) -> bool {
        let last_success = self.last_success_ms.load(Ordering::Relaxed);
        let last_failure = self.last_failure_ms.load(Ordering::Relaxed);
        last_success > 0 && last_success >= last_failure
    }

    fn success_rate(&self) -> f64 {
        let successes = self.success_count.load(Ordering::Relaxed);
        let failures = self.failure_count.load(Ordering::Relaxed);
        match successes + failures {
            0 => 1.0,
            total => successes as f64 / total as f64,
        }
    }
}

/// TradingView screener client
///
/// One POST to `{base_url}/{market}/scan` per query. Timeframe-scoped columns
/// are spelled `close|1W` on the wire and `close_1W` everywhere else; the
/// translation happens here and nowhere else.
pub struct TradingViewClient {
    client: Client,
    base_url: String,
    session_id: Option<String>,
    rate_limiter: tokio::sync::Semaphore,
    last_request: tokio::sync::Mutex<Instant>,
    min_interval: Duration,
    request_timeout: Duration,
    health_tracker: HealthTracker,
}

impl TradingViewClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let request_timeout = Duration::from_secs(settings.timeout_secs.max(1));
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| ScanError::ProviderUnavailable(format!("HTTP client: {}", e)))?;

        let base_url = url::Url::parse(&settings.base_url).map_err(|e| {
            ScanError::ProviderUnavailable(format!("invalid base url {}: {}", settings.base_url, e))
        })?;

        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            session_id: settings.session_id.clone(),
            rate_limiter: tokio::sync::Semaphore::new(settings.max_concurrent_requests.max(1)),
            last_request: tokio::sync::Mutex::new(
                Instant::now()
                    .checked_sub(Duration::from_secs(10))
                    .unwrap_or_else(Instant::now),
            ),
            min_interval: Duration::from_millis(settings.min_request_interval_ms),
            request_timeout,
            health_tracker: HealthTracker::new(),
        })
    }

    fn build_request(&self, market: &str, body: &ScanBody) -> reqwest::RequestBuilder {
        let url = format!("{}/{}/scan", self.base_url, market);
        let mut req = self.client.post(&url).json(body);

        if let Some(session) = &self.session_id {
            req = req.header(reqwest::header::COOKIE, format!("sessionid={}", session));
        }

        req
    }

    /// Rate-limited POST with per-request timeout and one retry on 429
    async fn scan_request(&self, market: &str, body: &ScanBody) -> Result<ScanResponse> {
        let request_start = Instant::now();

        for attempt in 0..2 {
            let _permit = self.rate_limiter.acquire().await.map_err(|e| {
                self.health_tracker.record_failure();
                ScanError::ProviderUnavailable(e.to_string())
            })?;

            {
                let mut last = self.last_request.lock().await;
                let elapsed = last.elapsed();
                if elapsed < self.min_interval {
                    tokio::time::sleep(self.min_interval - elapsed).await;
                }
                *last = Instant::now();
            }

            let response = match tokio::time::timeout(
                self.request_timeout,
                self.build_request(market, body).send(),
            )
            .await
            {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => {
                    self.health_tracker.record_failure();
                    return Err(ScanError::ProviderUnavailable(e.to_string()));
                }
                Err(_) => {
                    self.health_tracker.record_failure();
                    return Err(ScanError::ProviderUnavailable(format!(
                        "TradingView scan of {} timed out after {}s",
                        market,
                        self.request_timeout.as_secs()
                    )));
                }
            };

            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());

                if attempt == 0 {
                    let wait_secs = retry_after.unwrap_or(60).min(MAX_RETRY_WAIT_SECS);
                    warn!(
                        "TradingView rate limited, waiting {} seconds before retry",
                        wait_secs
                    );
                    drop(_permit);
                    tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                    continue;
                }

                self.health_tracker.record_failure();
                return Err(ScanError::RateLimited {
                    provider: "tradingview".to_string(),
                    retry_after,
                });
            }

            if !status.is_success() {
                self.health_tracker.record_failure();
                let text = response.text().await.unwrap_or_default();
                return Err(ScanError::ProviderUnavailable(format!(
                    "TradingView API error ({}): {}",
                    status, text
                )));
            }

            let parsed = response.json::<ScanResponse>().await.map_err(|e| {
                self.health_tracker.record_failure();
                ScanError::MalformedResponse(e.to_string())
            })?;

            let latency_ms = request_start.elapsed().as_millis() as u64;
            self.health_tracker.record_success(latency_ms);
            return Ok(parsed);
        }

        Err(ScanError::ProviderUnavailable(
            "Unexpected retry loop exit".to_string(),
        ))
    }

    /// Run one screener query
    pub async fn fetch(&self, request: &ProviderRequest) -> Result<MetricTable> {
        let body = ScanBody::from_request(request);
        debug!(
            "TradingView scan: market={} timeframe={} columns={} filters={}",
            request.market,
            request.timeframe,
            body.columns.len(),
            body.filter.len()
        );

        let response = self.scan_request(&request.market, &body).await?;
        let table = parse_response(request, response).map_err(|e| {
            self.health_tracker.record_failure();
            e
        })?;

        debug!("TradingView returned {} rows", table.len());
        Ok(table)
    }

    /// Health from internal counters (no API call)
    pub async fn health(&self) -> SourceHealth {
        let last_success_ms = self.health_tracker.last_success_ms.load(Ordering::Relaxed);
        let last_success = if last_success_ms > 0 {
            DateTime::from_timestamp_millis(last_success_ms as i64)
        } else {
            None
        };

        let is_healthy = self.health_tracker.is_healthy();

        SourceHealth {
            source: "tradingview".to_string(),
            is_healthy,
            last_success,
            last_error: if is_healthy {
                None
            } else {
                Some("No successful scan since the last failure".to_string())
            },
            success_rate: self.health_tracker.success_rate(),
            avg_latency_ms: self.health_tracker.last_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// Column name as TradingView spells it. Bare names take the request timeframe.
pub fn wire_column(field: &str, timeframe: Timeframe) -> String {
    let (base, own) = split_metric(field);
    let timeframe = if own == Timeframe::Daily { timeframe } else { own };
    match timeframe.suffix() {
        "" => base.to_string(),
        code => format!("{}|{}", base, code),
    }
}

fn wire_operation(operator: Operator) -> &'static str {
    match operator {
        Operator::GreaterThan => "greater",
    }
}

/// Turn a scan response into a table keyed by the requested field names
fn parse_response(request: &ProviderRequest, response: ScanResponse) -> Result<MetricTable> {
    if let Some(error) = response.error.filter(|e| !e.is_empty()) {
        return Err(ScanError::MalformedResponse(error));
    }

    let data = response.data.unwrap_or_default();
    let mut rows = Vec::with_capacity(data.len());

    for datum in data {
        if datum.d.len() != request.fields.len() {
            return Err(ScanError::MalformedResponse(format!(
                "row {} has {} values for {} columns",
                datum.s,
                datum.d.len(),
                request.fields.len()
            )));
        }

        let symbol = normalize_symbol(&datum.s);
        if symbol.is_empty() {
            continue;
        }

        let mut row = MetricRow::new(&symbol);
        for (field, value) in request.fields.iter().zip(&datum.d) {
            row.insert(field.clone(), value.as_f64());
        }
        rows.push(row);
    }

    Ok(MetricTable::new(request.timeframe, rows))
}

// Wire types for the scanner endpoint

#[derive(Debug, Serialize)]
struct ScanBody {
    markets: Vec<String>,
    columns: Vec<String>,
    filter: Vec<WireFilter>,
    options: ScanOptions,
    range: [usize; 2],
}

impl ScanBody {
    fn from_request(request: &ProviderRequest) -> Self {
        let timeframe = request.timeframe;
        Self {
            markets: vec![request.market.clone()],
            columns: request
                .fields
                .iter()
                .map(|f| wire_column(f, timeframe))
                .collect(),
            filter: request
                .filters
                .iter()
                .map(|f| WireFilter {
                    left: wire_column(&f.field, timeframe),
                    operation: wire_operation(f.operator),
                    right: match &f.value {
                        Operand::Constant(v) => serde_json::json!(v),
                        Operand::Metric(m) => serde_json::json!(wire_column(m, timeframe)),
                    },
                })
                .collect(),
            options: ScanOptions { lang: "en" },
            range: [0, request.limit],
        }
    }
}

#[derive(Debug, Serialize)]
struct WireFilter {
    left: String,
    operation: &'static str,
    right: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ScanOptions {
    lang: &'static str,
}

#[derive(Debug, Deserialize)]
struct ScanResponse {
    #[serde(default)]
    data: Option<Vec<ScanDatum>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScanDatum {
    s: String,
    d: Vec<serde_json::Value>,
}

#[async_trait::async_trait]
impl MarketDataProvider for TradingViewClient {
    async fn fetch(&self, request: &ProviderRequest) -> Result<MetricTable> {
        TradingViewClient::fetch(self, request).await
    }

    async fn health(&self) -> SourceHealth {
        TradingViewClient::health(self).await
    }

    fn name(&self) -> &str {
        "tradingview"
    }
}
