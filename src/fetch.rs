//! HTTP fetching with an escalating timeout monitor
//!
//! All network requests flow through a shared [`Fetcher`], which enforces a
//! global cap on simultaneous requests and watches every transfer for stalls:
//! a transfer that produces no byte within the initial window fails fast,
//! silence between chunks of a started transfer is bounded by the same
//! window, and even a steadily dripping transfer is cut off at the hard
//! ceiling. Cancellation is honored at every await point.

use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use futures::StreamExt;
use reqwest::header::{HeaderName, HeaderValue, REFERER};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Per-request options carried by a page descriptor
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Referer header some archives require
    pub referer: Option<String>,
    /// Additional headers (name, value)
    pub headers: Vec<(String, String)>,
}

/// Shared HTTP client with a global in-flight request cap
#[derive(Clone, Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    inflight: Arc<Semaphore>,
}

impl Fetcher {
    /// Create a fetcher that allows at most `global_request_limit`
    /// simultaneous requests across all parts and tile fetches
    pub fn new(client: reqwest::Client, global_request_limit: usize) -> Self {
        Self {
            client,
            inflight: Arc::new(Semaphore::new(global_request_limit)),
        }
    }

    /// Download a URL into memory under the escalating timeout monitor.
    ///
    /// `on_bytes` is invoked with the size of every received chunk, which
    /// feeds the per-job byte metric while the transfer is still in flight.
    ///
    /// Timeout behavior:
    /// - no byte within `monitor.initial_timeout` of sending the request
    ///   fails fast with [`Error::TimeoutStalled`] (`bytes_received: 0`)
    /// - silence between chunks longer than `initial_timeout` is a stall
    /// - a transfer still running at `monitor.max_timeout` is a stall even
    ///   if bytes are arriving
    pub async fn fetch_bytes(
        &self,
        url: &str,
        options: &FetchOptions,
        monitor: &MonitorConfig,
        cancel: &CancellationToken,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<Vec<u8>> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.inflight.clone().acquire_owned() => {
                permit.map_err(|_| Error::Cancelled)?
            }
        };

        let mut request = self.client.get(url);
        if let Some(referer) = &options.referer {
            request = request.header(REFERER, referer);
        }
        for (name, value) in &options.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Other(format!("invalid header name {name:?}: {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| Error::Other(format!("invalid value for header {name:?}: {e}")))?;
            request = request.header(header_name, header_value);
        }

        let started = Instant::now();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(monitor.initial_timeout, request.send()) => {
                match result {
                    Ok(response) => response?,
                    Err(_) => return Err(stalled(url, started, 0)),
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(status, url));
        }

        let mut stream = response.bytes_stream();
        let mut body: Vec<u8> = Vec::new();

        loop {
            if started.elapsed() >= monitor.max_timeout {
                return Err(stalled(url, started, body.len()));
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = tokio::time::timeout(monitor.initial_timeout, stream.next()) => next,
            };

            match next {
                Ok(Some(Ok(chunk))) => {
                    on_bytes(chunk.len() as u64);
                    body.extend_from_slice(&chunk);
                }
                Ok(Some(Err(e))) => return Err(Error::Network(e)),
                Ok(None) => break,
                Err(_) => return Err(stalled(url, started, body.len())),
            }
        }

        if body.is_empty() {
            return Err(Error::MalformedResponse {
                url: url.to_string(),
                reason: "empty response body".to_string(),
            });
        }

        tracing::trace!(url, bytes = body.len(), "fetched");
        Ok(body)
    }
}

fn stalled(url: &str, started: Instant, bytes_received: usize) -> Error {
    Error::TimeoutStalled {
        url: url.to_string(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        bytes_received: bytes_received as u64,
    }
}

/// Byte callback that discards its input, for callers that do not track
/// transfer progress
pub fn ignore_bytes(_: u64) {}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_monitor() -> MonitorConfig {
        MonitorConfig {
            initial_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_secs(5),
            stall_window: Duration::from_secs(120),
        }
    }

    fn fetcher() -> Fetcher {
        Fetcher::new(reqwest::Client::new(), 16)
    }

    #[tokio::test]
    async fn fetch_returns_body_and_reports_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page-1.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xAB; 4096]))
            .mount(&server)
            .await;

        let counted = AtomicU64::new(0);
        let body = fetcher()
            .fetch_bytes(
                &format!("{}/page-1.jpg", server.uri()),
                &FetchOptions::default(),
                &quick_monitor(),
                &CancellationToken::new(),
                &|n| {
                    counted.fetch_add(n, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();

        assert_eq!(body.len(), 4096);
        assert_eq!(
            counted.load(Ordering::SeqCst),
            4096,
            "every chunk must be reported to the byte callback"
        );
    }

    #[tokio::test]
    async fn referer_and_extra_headers_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/guarded.jpg"))
            .and(header("referer", "http://archive.example/viewer"))
            .and(header("x-api-key", "abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let options = FetchOptions {
            referer: Some("http://archive.example/viewer".to_string()),
            headers: vec![("x-api-key".to_string(), "abc123".to_string())],
        };
        let body = fetcher()
            .fetch_bytes(
                &format!("{}/guarded.jpg", server.uri()),
                &options,
                &quick_monitor(),
                &CancellationToken::new(),
                &ignore_bytes,
            )
            .await
            .unwrap();
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn not_found_is_a_permanent_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch_bytes(
                &format!("{}/missing.jpg", server.uri()),
                &FetchOptions::default(),
                &quick_monitor(),
                &CancellationToken::new(),
                &ignore_bytes,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::ServerRejected { status: 404, .. }),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn service_unavailable_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy.jpg"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch_bytes(
                &format!("{}/busy.jpg", server.uri()),
                &FetchOptions::default(),
                &quick_monitor(),
                &CancellationToken::new(),
                &ignore_bytes,
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::ServerBusy { status: 503, .. }),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn zero_bytes_in_initial_window_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hung.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 128])
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let monitor = MonitorConfig {
            initial_timeout: Duration::from_millis(200),
            max_timeout: Duration::from_secs(5),
            stall_window: Duration::from_secs(120),
        };

        let started = Instant::now();
        let err = fetcher()
            .fetch_bytes(
                &format!("{}/hung.jpg", server.uri()),
                &FetchOptions::default(),
                &monitor,
                &CancellationToken::new(),
                &ignore_bytes,
            )
            .await
            .unwrap_err();

        assert!(
            matches!(err, Error::TimeoutStalled { bytes_received: 0, .. }),
            "got {err:?}"
        );
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "must fail fast in the initial window, not wait for max_timeout"
        );
    }

    /// Minimal HTTP server that drips the body out in timed chunks, which
    /// wiremock cannot do
    async fn drip_server(chunks: usize, chunk_size: usize, gap: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                chunks * chunk_size
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            for _ in 0..chunks {
                tokio::time::sleep(gap).await;
                // The client hanging up mid-body ends the drip
                if socket.write_all(&vec![0x5A; chunk_size]).await.is_err() {
                    break;
                }
            }
        });
        format!("http://{addr}/drip.jpg")
    }

    #[tokio::test]
    async fn slow_but_alive_transfer_extends_past_the_initial_window() {
        // 4 chunks 100ms apart: the transfer runs well past the 250ms initial
        // window, but no single inter-chunk gap exceeds it
        let url = drip_server(4, 64, Duration::from_millis(100)).await;
        let monitor = MonitorConfig {
            initial_timeout: Duration::from_millis(250),
            max_timeout: Duration::from_secs(10),
            stall_window: Duration::from_secs(120),
        };

        let started = Instant::now();
        let body = fetcher()
            .fetch_bytes(
                &url,
                &FetchOptions::default(),
                &monitor,
                &CancellationToken::new(),
                &ignore_bytes,
            )
            .await
            .unwrap();

        assert_eq!(body.len(), 4 * 64, "every dripped chunk must be collected");
        assert!(
            started.elapsed() > monitor.initial_timeout,
            "the transfer outlived the initial window while making progress"
        );
    }

    #[tokio::test]
    async fn dripping_transfer_is_cut_off_at_the_hard_ceiling() {
        // Chunks never stop arriving within the inter-chunk window, so only
        // the hard ceiling can end this transfer
        let url = drip_server(100, 16, Duration::from_millis(50)).await;
        let monitor = MonitorConfig {
            initial_timeout: Duration::from_millis(400),
            max_timeout: Duration::from_millis(600),
            stall_window: Duration::from_secs(120),
        };

        let started = Instant::now();
        let err = fetcher()
            .fetch_bytes(
                &url,
                &FetchOptions::default(),
                &monitor,
                &CancellationToken::new(),
                &ignore_bytes,
            )
            .await
            .unwrap_err();

        match err {
            Error::TimeoutStalled { bytes_received, .. } => assert!(
                bytes_received > 0,
                "the ceiling fires while bytes are still arriving"
            ),
            other => panic!("expected TimeoutStalled, got {other:?}"),
        }
        assert!(
            started.elapsed() >= monitor.max_timeout,
            "the ceiling must not fire early"
        );
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "the ceiling must not wait for the whole dripping body"
        );
    }

    #[tokio::test]
    async fn empty_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty.jpg"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch_bytes(
                &format!("{}/empty.jpg", server.uri()),
                &FetchOptions::default(),
                &quick_monitor(),
                &CancellationToken::new(),
                &ignore_bytes,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher()
            .fetch_bytes(
                "http://127.0.0.1:1/unreachable.jpg",
                &FetchOptions::default(),
                &quick_monitor(),
                &cancel,
                &ignore_bytes,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got {err:?}");
    }

    #[tokio::test]
    async fn global_request_limit_serializes_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"x".to_vec())
                    .set_delay(Duration::from_millis(150)),
            )
            .mount(&server)
            .await;

        // Limit of 1: two requests must run back-to-back
        let fetcher = Fetcher::new(reqwest::Client::new(), 1);
        let url = format!("{}/slow.jpg", server.uri());
        let monitor = quick_monitor();
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let opts = FetchOptions::default();
        let (a, b) = tokio::join!(
            fetcher.fetch_bytes(&url, &opts, &monitor, &cancel, &ignore_bytes),
            fetcher.fetch_bytes(&url, &opts, &monitor, &cancel, &ignore_bytes),
        );
        a.unwrap();
        b.unwrap();

        assert!(
            started.elapsed() >= Duration::from_millis(300),
            "with a limit of 1 the delays must serialize, elapsed {:?}",
            started.elapsed()
        );
    }
}
