//! Outbound calls guarded by a per-destination circuit breaker, the rate
//! limiter and a bounded retry loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::http_client::{HttpClient, HttpRequest, HttpResponse};
use crate::rate_limiter::RateLimiter;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::NoticeError;

/// Breaker and limiter key for a URL: `host[:port]`, or the raw text when it
/// does not parse.
pub fn destination_of(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_owned(),
            (None, _) => url.to_owned(),
        },
        Err(_) => url.to_owned(),
    }
}

pub struct ResilientHttpClient {
    transport: Arc<dyn HttpClient>,
    breaker_config: CircuitBreakerConfig,
    retry: RetryConfig,
    rate_limiter: Arc<RateLimiter>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl std::fmt::Debug for ResilientHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientHttpClient")
            .field("breaker_config", &self.breaker_config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ResilientHttpClient {
    pub fn new(
        transport: Arc<dyn HttpClient>,
        breaker_config: CircuitBreakerConfig,
        retry: RetryConfig,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            transport,
            breaker_config,
            retry,
            rate_limiter,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Breaker for `destination`, created closed on first use.
    pub fn breaker(&self, destination: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .expect("breaker registry lock is not poisoned");
        Arc::clone(
            breakers
                .entry(destination.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(destination, self.breaker_config))),
        )
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .expect("breaker registry lock is not poisoned")
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<CircuitSnapshot> =
            breakers.iter().map(|breaker| breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.destination.cmp(&b.destination));
        snapshots
    }

    /// Fetch `request` with the full resilience stack.
    ///
    /// Each attempt first checks the destination's breaker, so an open circuit
    /// fails fast without waiting on the limiter. It then waits for a
    /// rate-limit slot and runs under the breaker and call timeout. Only
    /// non-2xx statuses and transport failures are errors; `429` becomes
    /// [`NoticeError::RateLimited`] and is left to the limiter's penalty, at
    /// least as long as the server's `Retry-After`, instead of the retry loop.
    pub async fn get(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, NoticeError> {
        let destination = destination_of(&request.url);
        let breaker = self.breaker(&destination);
        let breaker = &breaker;
        let destination = destination.as_str();

        retry_with_backoff(&self.retry, cancel, |attempt| {
            let request = request.clone();
            async move {
                if !breaker.allow_request() {
                    return Err(NoticeError::CircuitOpen {
                        destination: destination.to_owned(),
                    });
                }
                self.rate_limiter.acquire(destination, cancel).await?;
                let result = breaker
                    .execute(|| async move {
                        tokio::select! {
                            () = cancel.cancelled() => Err(NoticeError::Cancelled),
                            result = self.send(destination, request) => result,
                        }
                    })
                    .await;

                match &result {
                    Ok(_) => self.rate_limiter.record_success(destination),
                    Err(NoticeError::RateLimited { retry_after_ms, .. }) => {
                        self.rate_limiter
                            .record_rate_limited(destination, Duration::from_millis(*retry_after_ms));
                    }
                    Err(NoticeError::CircuitOpen { .. }) => {}
                    Err(error) => {
                        tracing::debug!(destination, attempt, error = %error, "fetch attempt failed");
                        if error.counts_as_failure() {
                            self.rate_limiter.record_failure(destination);
                        }
                    }
                }
                result
            }
        })
        .await
    }

    async fn send(&self, destination: &str, request: HttpRequest) -> Result<HttpResponse, NoticeError> {
        let timeout_ms = request.timeout_ms;
        let response = self.transport.execute(request).await.map_err(|error| {
            if error.timed_out() {
                NoticeError::Timeout {
                    destination: destination.to_owned(),
                    timeout_ms,
                }
            } else {
                NoticeError::network(destination, error.message())
            }
        })?;

        match response.status {
            200..=299 => Ok(response),
            429 => Err(NoticeError::RateLimited {
                destination: destination.to_owned(),
                retry_after_ms: response
                    .retry_after
                    .unwrap_or(self.rate_limiter.config().retry_delay)
                    .as_millis() as u64,
            }),
            status => Err(NoticeError::Http {
                destination: destination.to_owned(),
                status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::http_client::{HttpError, ReqwestHttpClient};
    use crate::rate_limiter::RateLimitConfig;

    fn client(threshold: u32, max_retries: u32) -> ResilientHttpClient {
        ResilientHttpClient::new(
            Arc::new(ReqwestHttpClient::new()),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_timeout: Duration::from_secs(60),
                call_timeout: Duration::from_secs(5),
            },
            RetryConfig::fixed(Duration::from_millis(5), max_retries),
            Arc::new(RateLimiter::new(RateLimitConfig {
                retry_delay: Duration::from_millis(1),
                max_penalty: Duration::from_millis(10),
                ..RateLimitConfig::default()
            })),
        )
    }

    #[test]
    fn destination_is_host_and_port() {
        assert_eq!(destination_of("https://api.exchange.test/v1/notices"), "api.exchange.test");
        assert_eq!(destination_of("http://127.0.0.1:8080/board"), "127.0.0.1:8080");
        assert_eq!(destination_of("not a url"), "not a url");
    }

    #[tokio::test]
    async fn retries_server_errors_then_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notices"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/notices"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let client = client(5, 3);
        let response = client
            .get(
                HttpRequest::get(format!("{}/notices", server.uri())),
                &CancellationToken::new(),
            )
            .await
            .expect("third attempt succeeds");

        assert_eq!(response.body, "[]");
        let snapshot = &client.breaker_snapshots()[0];
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.total_errors, 2);
        assert_eq!(snapshot.total_successes, 1);
    }

    #[tokio::test]
    async fn open_breaker_stops_calling_the_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(2, 0);
        let cancel = CancellationToken::new();
        let url = format!("{}/notices", server.uri());
        for _ in 0..2 {
            let result = client.get(HttpRequest::get(url.clone()), &cancel).await;
            assert!(matches!(result, Err(NoticeError::Http { status: 500, .. })));
        }

        let result = client.get(HttpRequest::get(url), &cancel).await;
        assert!(matches!(result, Err(NoticeError::CircuitOpen { .. })));
        assert_eq!(client.breaker_snapshots()[0].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn too_many_requests_is_not_retried_or_counted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(1, 3);
        let result = client
            .get(
                HttpRequest::get(format!("{}/notices", server.uri())),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(NoticeError::RateLimited {
                retry_after_ms: 2_000,
                ..
            })
        ));
        assert_eq!(client.breaker_snapshots()[0].state, CircuitState::Closed);
        let window = &client.rate_limiter().snapshots()[0];
        assert_eq!(window.consecutive_failures, 1);
        assert!(window.penalty_remaining_ms > 1_500, "retry-after outlasts the 10ms cap");
    }

    struct FailingTransport {
        calls: AtomicU32,
    }

    impl HttpClient for FailingTransport {
        fn execute<'a>(
            &'a self,
            request: HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
            let _ = request;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(HttpResponse::with_status(500, "")) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast_without_waiting_on_the_limiter() {
        let transport = Arc::new(FailingTransport {
            calls: AtomicU32::new(0),
        });
        let client = ResilientHttpClient::new(
            transport.clone(),
            CircuitBreakerConfig {
                failure_threshold: 2,
                open_timeout: Duration::from_secs(60),
                call_timeout: Duration::from_secs(5),
            },
            RetryConfig::no_retry(),
            Arc::new(RateLimiter::new(RateLimitConfig {
                retry_delay: Duration::from_secs(10),
                max_penalty: Duration::from_secs(30),
                ..RateLimitConfig::default()
            })),
        );
        let cancel = CancellationToken::new();
        let url = "https://api.exchange.test/v1/notices";
        client.get(HttpRequest::get(url), &cancel).await.expect_err("first failure");
        client.get(HttpRequest::get(url), &cancel).await.expect_err("second failure");
        assert_eq!(client.breaker_snapshots()[0].state, CircuitState::Open);
        assert!(client.rate_limiter().snapshots()[0].penalty_remaining_ms > 0);

        let started = Instant::now();
        let result = client.get(HttpRequest::get(url), &cancel).await;

        assert!(matches!(result, Err(NoticeError::CircuitOpen { .. })));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(5, 3);
        let result = client
            .get(
                HttpRequest::get(format!("{}/missing", server.uri())),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(NoticeError::Http { status: 404, .. })));
    }
}
