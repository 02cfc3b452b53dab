//! Shared HTTP client for the registry endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Exponential backoff between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based).
    pub fn delay(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }

    /// Throttling and server-side failures are worth another attempt.
    pub fn retries_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    pub fn retries_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_request()
    }
}

/// Sustained request rate with a burst allowance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub per_second: f64,
    pub burst: u32,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Continuous-refill token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    const MIN_RATE: f64 = 0.001;

    pub fn new(limit: RateLimit) -> Self {
        let burst = f64::from(limit.burst.max(1));
        Self {
            per_second: limit.per_second.max(Self::MIN_RATE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let earned = now.duration_since(bucket.refilled_at).as_secs_f64() * self.per_second;
                bucket.tokens = (bucket.tokens + earned).min(self.burst);
                bucket.refilled_at = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_endpoint: usize,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 8,
            max_in_flight_per_endpoint: 4,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("encoding request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("fetcher is shutting down")]
    Closed,
}

enum Outcome {
    Done(Result<FetchedResponse, FetchError>),
    Retry(String),
}

/// Every request holds a global slot and a slot on its endpoint, waits for the
/// rate limiter, then retries transient failures per the [`RetryPolicy`].
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_endpoint_limit: usize,
    endpoints: Mutex<HashMap<String, Arc<Semaphore>>>,
    limiter: Option<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_endpoint_limit: config.max_in_flight_per_endpoint.max(1),
            endpoints: Mutex::new(HashMap::new()),
            limiter: config.rate_limit.map(RateLimiter::new),
            retry: config.retry,
        })
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        endpoint: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(run_id, endpoint, Method::GET, url, None).await
    }

    /// POSTs `body` as `application/json; charset=utf-8`.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        run_id: Uuid,
        endpoint: &str,
        url: &str,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let body = serde_json::to_vec(body)?;
        self.execute(run_id, endpoint, Method::POST, url, Some(body))
            .await
    }

    async fn endpoint_permit(&self, endpoint: &str) -> Result<OwnedSemaphorePermit, FetchError> {
        let semaphore = {
            let mut endpoints = self.endpoints.lock().await;
            endpoints
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_endpoint_limit)))
                .clone()
        };
        semaphore.acquire_owned().await.map_err(|_| FetchError::Closed)
    }

    async fn execute(
        &self,
        run_id: Uuid,
        endpoint: &str,
        method: Method,
        url: &str,
        json: Option<Vec<u8>>,
    ) -> Result<FetchedResponse, FetchError> {
        let _slot = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        let _endpoint_slot = self.endpoint_permit(endpoint).await?;

        let span = info_span!("http_fetch", %run_id, endpoint, url, %method);
        async {
            let mut retry = 0;
            loop {
                if let Some(limiter) = &self.limiter {
                    limiter.acquire().await;
                }
                match self.attempt(&method, url, json.as_deref(), retry < self.retry.retries).await {
                    Outcome::Done(result) => return result,
                    Outcome::Retry(reason) => {
                        let delay = self.retry.delay(retry);
                        warn!(retry, ?delay, %reason, "transient failure, backing off");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, method: &Method, url: &str, json: Option<&[u8]>, may_retry: bool) -> Outcome {
        let mut request = self.client.request(method.clone(), url);
        if let Some(body) = json {
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"))
                .body(body.to_vec());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if may_retry && RetryPolicy::retries_error(&err) => {
                return Outcome::Retry(err.to_string())
            }
            Err(err) => return Outcome::Done(Err(err.into())),
        };

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            if may_retry && RetryPolicy::retries_status(status) {
                return Outcome::Retry(format!("status {status}"));
            }
            return Outcome::Done(Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            }));
        }

        Outcome::Done(match response.bytes().await {
            Ok(bytes) => {
                debug!(status = status.as_u16(), bytes = bytes.len(), "fetched");
                Ok(FetchedResponse {
                    status,
                    final_url,
                    body: bytes.to_vec(),
                })
            }
            Err(err) => Err(err.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::Router;

    async fn spawn_server(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn fast_fetcher(retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("bizreg-test".to_string()),
            retry: RetryPolicy {
                retries,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .unwrap()
    }

    fn counting_route(path: &str, fail_first: usize, failure: AxumStatus) -> (Router, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            path,
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < fail_first {
                        (failure, "nope")
                    } else {
                        (AxumStatus::OK, "ok")
                    }
                }
            }),
        );
        (app, hits)
    }

    #[test]
    fn delays_double_then_cap() {
        let policy = RetryPolicy {
            retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(64), Duration::from_millis(350));
    }

    #[test]
    fn only_throttling_and_server_errors_retry() {
        assert!(RetryPolicy::retries_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(RetryPolicy::retries_status(StatusCode::BAD_GATEWAY));
        assert!(!RetryPolicy::retries_status(StatusCode::NOT_FOUND));
        assert!(!RetryPolicy::retries_status(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn rate_limiter_spaces_requests_after_burst() {
        let limiter = RateLimiter::new(RateLimit {
            per_second: 50.0,
            burst: 2,
        });
        let started = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        // Two free tokens, then two refills at 20ms each.
        assert!(started.elapsed() >= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let (app, hits) = counting_route("/flaky", 2, AxumStatus::SERVICE_UNAVAILABLE);
        let addr = spawn_server(app).await;

        let resp = fast_fetcher(3)
            .get(Uuid::new_v4(), "detail", &format!("http://{addr}/flaky"))
            .await
            .unwrap();

        assert_eq!(resp.text(), "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let (app, hits) = counting_route("/down", usize::MAX, AxumStatus::INTERNAL_SERVER_ERROR);
        let addr = spawn_server(app).await;

        let err = fast_fetcher(2)
            .get(Uuid::new_v4(), "detail", &format!("http://{addr}/down"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (app, hits) = counting_route("/gone", usize::MAX, AxumStatus::NOT_FOUND);
        let addr = spawn_server(app).await;

        let err = fast_fetcher(3)
            .get(Uuid::new_v4(), "detail", &format!("http://{addr}/gone"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_json_sends_body_and_content_type() {
        let app = Router::new().route(
            "/search",
            post(|headers: HeaderMap, body: String| async move {
                let content_type = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                format!("{content_type}|{body}")
            }),
        );
        let addr = spawn_server(app).await;

        let resp = fast_fetcher(0)
            .post_json(
                Uuid::new_v4(),
                "search",
                &format!("http://{addr}/search"),
                &serde_json::json!({ "SEARCH_VALUE": "X" }),
            )
            .await
            .unwrap();

        assert_eq!(
            resp.text(),
            "application/json; charset=utf-8|{\"SEARCH_VALUE\":\"X\"}"
        );
    }
}
