//! The Health Prober.

use super::poll::{reports_progress, PollDecision, ProbeResult, ProbeSettings};
use super::target::{Protocol, ProbeTarget};
use crate::errors::ProbeConfigError;
use crate::events::{event_types, EventSink, NoOpEventSink};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One attempt at reaching a target.
///
/// Implementations report a transport error or response mismatch as `Err`.
#[async_trait]
pub trait ProbeAttempt: Send + Sync {
    /// Makes a single attempt, which should finish within `per_attempt_timeout`.
    async fn attempt(&self, target: &ProbeTarget, per_attempt_timeout: Duration) -> Result<(), String>;
}

/// Attempts over the network: HTTP GET, or TCP connect and close.
#[derive(Debug, Clone)]
pub struct NetworkAttempt {
    client: reqwest::Client,
}

impl NetworkAttempt {
    /// Creates a network attempt backed by a fresh HTTP client.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }

    /// Creates a network attempt that shares an existing HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn http(&self, target: &ProbeTarget, per_attempt_timeout: Duration) -> Result<(), String> {
        let response = self
            .client
            .get(target.url())
            .timeout(per_attempt_timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        target.expected().check(status, &body)
    }

    async fn tcp(target: &ProbeTarget, per_attempt_timeout: Duration) -> Result<(), String> {
        let connect = TcpStream::connect((target.host(), target.port()));
        match tokio::time::timeout(per_attempt_timeout, connect).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.shutdown().await;
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {} seconds",
                per_attempt_timeout.as_secs_f64()
            )),
        }
    }
}

#[async_trait]
impl ProbeAttempt for NetworkAttempt {
    async fn attempt(&self, target: &ProbeTarget, per_attempt_timeout: Duration) -> Result<(), String> {
        match target.protocol() {
            Protocol::Http | Protocol::Https => self.http(target, per_attempt_timeout).await,
            Protocol::Tcp => Self::tcp(target, per_attempt_timeout).await,
        }
    }
}

/// Polls targets until they are healthy or their deadline passes.
///
/// A prober holds no mutable state; every call owns its deadline and retry
/// counters, so one prober can serve many concurrent probes.
#[derive(Clone)]
pub struct Prober<A = NetworkAttempt> {
    attempt: A,
    sink: Arc<dyn EventSink>,
}

impl Prober<NetworkAttempt> {
    /// Creates a prober that reaches targets over the network.
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self::with_attempt(NetworkAttempt::new()?))
    }
}

impl<A: ProbeAttempt> Prober<A> {
    /// Creates a prober with a custom attempt strategy.
    pub fn with_attempt(attempt: A) -> Self {
        Self {
            attempt,
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the sink that receives progress notifications.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Convenience form of [`Prober::probe`] taking raw timeouts.
    pub async fn probe_for(
        &self,
        target: &ProbeTarget,
        timeout: Duration,
        per_attempt_timeout: Duration,
    ) -> Result<ProbeResult, ProbeConfigError> {
        let settings = ProbeSettings::new(timeout, per_attempt_timeout)?;
        Ok(self.probe(target, &settings).await)
    }

    /// Polls `target` until it is healthy or `settings.timeout()` elapses.
    ///
    /// At least one attempt is always made.
    pub async fn probe(&self, target: &ProbeTarget, settings: &ProbeSettings) -> ProbeResult {
        let started = Instant::now();
        let url = target.url();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let outcome = match tokio::time::timeout(
                settings.per_attempt_timeout(),
                self.attempt.attempt(target, settings.per_attempt_timeout()),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(format!(
                    "attempt timed out after {} seconds",
                    settings.per_attempt_timeout().as_secs_f64()
                )),
            };
            let elapsed = started.elapsed();

            match settings.decide(elapsed, outcome.is_ok()) {
                PollDecision::Healthy => {
                    debug!(target = %url, attempts, "Target is healthy");
                    self.sink.try_emit(
                        event_types::PROBE_HEALTHY,
                        Some(serde_json::json!({
                            "target": url,
                            "attempts": attempts,
                            "elapsed_secs": elapsed.as_secs_f64(),
                        })),
                    );
                    return ProbeResult::Healthy { attempts, elapsed };
                }
                PollDecision::TimedOut => {
                    let last_error = outcome.err().unwrap_or_default();
                    warn!(target = %url, attempts, error = %last_error, "Target didn't become healthy");
                    self.sink.try_emit(
                        event_types::PROBE_TIMED_OUT,
                        Some(serde_json::json!({
                            "target": url,
                            "attempts": attempts,
                            "last_error": last_error,
                        })),
                    );
                    return ProbeResult::TimedOut {
                        attempts,
                        elapsed,
                        last_error,
                    };
                }
                PollDecision::RetryAfter(delay) => {
                    let remaining = settings.timeout().saturating_sub(elapsed);
                    if let Err(error) = &outcome {
                        debug!(target = %url, attempts, error = %error, "Attempt failed");
                    }
                    if reports_progress(attempts) {
                        debug!(target = %url, "Waiting {} more seconds", remaining.as_secs());
                        self.sink.try_emit(
                            event_types::PROBE_PROGRESS,
                            Some(serde_json::json!({
                                "target": url,
                                "attempts": attempts,
                                "remaining_secs": remaining.as_secs_f64(),
                            })),
                        );
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Probes several targets concurrently, returning results in input order.
    pub async fn probe_all(&self, targets: &[(ProbeTarget, ProbeSettings)]) -> Vec<ProbeResult> {
        futures::future::join_all(
            targets
                .iter()
                .map(|(target, settings)| self.probe(target, settings)),
        )
        .await
    }
}

impl<A> std::fmt::Debug for Prober<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::testing::ScriptedAttempt;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn settings(timeout: Duration, per_attempt: Duration) -> ProbeSettings {
        ProbeSettings::new(timeout, per_attempt).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediately_healthy_takes_one_attempt() {
        let attempt = ScriptedAttempt::always_ok();
        let prober = Prober::with_attempt(attempt.clone());
        let target = ProbeTarget::tcp("svc", 80);

        let result = prober.probe(&target, &settings(secs(300), secs(5))).await;

        assert_eq!(result.attempts(), 1);
        assert!(result.is_healthy());
        assert_eq!(attempt.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_after_failures() {
        let attempt = ScriptedAttempt::new(vec![
            Err("connection refused".to_string()),
            Err("expected status 200, got 503".to_string()),
            Ok(()),
        ]);
        let prober = Prober::with_attempt(attempt);

        let result = prober
            .probe(&ProbeTarget::tcp("svc", 80), &settings(secs(300), secs(5)))
            .await;

        assert!(result.is_healthy());
        assert_eq!(result.attempts(), 3);
        assert!(result.elapsed() >= secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_shorter_than_backoff_still_attempts_once() {
        let attempt = ScriptedAttempt::always_err("connection refused");
        let prober = Prober::with_attempt(attempt.clone());

        let result = prober
            .probe(
                &ProbeTarget::tcp("svc", 80),
                &settings(Duration::from_millis(300), Duration::from_millis(100)),
            )
            .await;

        match result {
            ProbeResult::TimedOut { attempts, last_error, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(last_error, "connection refused");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(attempt.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_healthy_is_bounded() {
        let prober = Prober::with_attempt(ScriptedAttempt::always_err("connection refused"));
        let settings = settings(secs(3), secs(1));

        let started = Instant::now();
        let result = prober.probe(&ProbeTarget::tcp("svc", 80), &settings).await;

        assert!(!result.is_healthy());
        assert!((1..=3).contains(&result.attempts()));
        assert!(started.elapsed() <= settings.upper_bound());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_is_cut_by_per_attempt_timeout() {
        let attempt = ScriptedAttempt::always_ok().with_delay(secs(60));
        let prober = Prober::with_attempt(attempt);
        let settings = settings(secs(2), secs(1));

        let started = Instant::now();
        let result = prober.probe(&ProbeTarget::tcp("svc", 80), &settings).await;

        match result {
            ProbeResult::TimedOut { attempts, last_error, .. } => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() <= settings.upper_bound());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_every_thirty_attempts() {
        let sink = Arc::new(CollectingEventSink::new());
        let prober = Prober::with_attempt(ScriptedAttempt::always_err("connection refused"))
            .with_event_sink(sink.clone());

        let result = prober
            .probe(&ProbeTarget::tcp("svc", 80), &settings(secs(100), secs(1)))
            .await;

        assert_eq!(result.attempts(), 100);
        let progress = sink.events_of_type(event_types::PROBE_PROGRESS);
        let counts: Vec<u64> = progress
            .iter()
            .map(|(_, data)| data.as_ref().unwrap()["attempts"].as_u64().unwrap())
            .collect();
        assert_eq!(counts, vec![30, 60, 90]);
        assert_eq!(sink.events_of_type(event_types::PROBE_TIMED_OUT).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_all_keeps_order() {
        let prober = Prober::with_attempt(ScriptedAttempt::by_host([("up", true), ("down", false)]));
        let targets = vec![
            (ProbeTarget::tcp("down", 1), settings(secs(2), secs(1))),
            (ProbeTarget::tcp("up", 1), settings(secs(2), secs(1))),
        ];

        let results = prober.probe_all(&targets).await;

        assert!(!results[0].is_healthy());
        assert!(results[1].is_healthy());
    }

    #[tokio::test]
    async fn test_probe_for_rejects_bad_settings() {
        let prober = Prober::with_attempt(ScriptedAttempt::always_ok());
        let err = prober
            .probe_for(&ProbeTarget::tcp("svc", 80), secs(1), secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeConfigError::PerAttemptExceedsTimeout { .. }));
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let prober = Prober::new().unwrap();
        let result = prober
            .probe(&ProbeTarget::tcp("127.0.0.1", port), &settings(secs(5), secs(1)))
            .await;
        assert_eq!(result.attempts(), 1);
        assert!(result.is_healthy());
    }

    #[tokio::test]
    async fn test_tcp_probe_against_ipv6_listener() {
        // Hosts without IPv6 loopback cannot run this.
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let target = ProbeTarget::parse(&format!("tcp://[::1]:{port}")).unwrap();
        let result = Prober::new().unwrap().probe(&target, &settings(secs(5), secs(1))).await;
        assert_eq!(result.attempts(), 1);
        assert!(result.is_healthy());
    }

    #[tokio::test]
    async fn test_tcp_probe_against_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let prober = Prober::new().unwrap();
        let result = prober
            .probe(&ProbeTarget::tcp("127.0.0.1", port), &settings(secs(1), secs(1)))
            .await;
        assert_eq!(result.attempts(), 1);
        assert!(!result.is_healthy());
    }

    async fn serve_http(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_http_probe_exact_body() {
        let page = "<html><body><h1>It works!</h1></body></html>\n";
        let port = serve_http(page).await;
        let target = ProbeTarget::parse(&format!("http://127.0.0.1:{port}/"))
            .unwrap()
            .with_exact_body(page);

        let result = Prober::new().unwrap().probe(&target, &settings(secs(5), secs(2))).await;
        assert_eq!(result.attempts(), 1);
        assert!(result.is_healthy());
    }

    #[tokio::test]
    async fn test_http_probe_body_mismatch_times_out() {
        let port = serve_http("Welcome to nginx!").await;
        let target = ProbeTarget::parse(&format!("http://127.0.0.1:{port}/"))
            .unwrap()
            .with_exact_body("It works!");

        let result = Prober::new().unwrap().probe(&target, &settings(secs(1), secs(1))).await;
        match result {
            ProbeResult::TimedOut { attempts, last_error, .. } => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("body"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_times_out_within_three_attempts() {
        let target = ProbeTarget::parse("http://example.invalid/").unwrap();
        let settings = settings(secs(3), secs(1));

        let started = std::time::Instant::now();
        let result = Prober::new().unwrap().probe(&target, &settings).await;

        assert!(!result.is_healthy());
        assert!((1..=3).contains(&result.attempts()));
        assert!(started.elapsed() <= settings.upper_bound());
    }
}
