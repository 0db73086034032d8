use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::error::{AppError, ErrorKind, is_retryable_status};
use crate::limiter::{DomainLimiter, DomainPermit};
use crate::matcher::{CompiledEvidence, EvidenceMatcher};
use crate::models::{ProbeOutcome, ProbeStatus, ProbeTask};
use crate::report::{ReportEvent, ScanReporter, TracingScanReporter};
use crate::retry::{RetryPhase, RetryState};
use crate::rotator::HeaderRotator;
use crate::traits::{ResultSink, Transport};

/// Executes single probes end to end: jitter, domain permit, request with
/// timeout, retry with backoff, evidence check, sink notification.
pub struct ProbeWorker<T, S>
where
    T: Transport,
    S: ResultSink,
{
    transport: T,
    sink: S,
    limiter: DomainLimiter,
    rotator: HeaderRotator,
    matcher: EvidenceMatcher,
    reporter: Arc<dyn ScanReporter>,
    config: ScanConfig,
}

/// How the attempt loop ended.
enum Verdict {
    Terminal { status: ProbeStatus, http_status: u16 },
    GaveUp { http_status: Option<u16> },
}

impl<T, S> ProbeWorker<T, S>
where
    T: Transport,
    S: ResultSink,
{
    pub fn new(transport: T, sink: S, config: ScanConfig) -> Self {
        Self {
            transport,
            sink,
            limiter: DomainLimiter::new(config.per_domain_limit),
            rotator: HeaderRotator::default(),
            matcher: EvidenceMatcher::new(config.match_timeout, config.max_scan_bytes),
            reporter: Arc::new(TracingScanReporter),
            config,
        }
    }

    pub fn with_rotator(mut self, rotator: HeaderRotator) -> Self {
        self.rotator = rotator;
        self
    }

    /// Share a limiter across workers (or inspect it from tests).
    pub fn with_limiter(mut self, limiter: DomainLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ScanReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn limiter(&self) -> &DomainLimiter {
        &self.limiter
    }

    pub(crate) fn reporter(&self) -> &Arc<dyn ScanReporter> {
        &self.reporter
    }

    /// Run one probe to completion. Always yields exactly one outcome.
    pub async fn execute(&self, task: ProbeTask, cancel: &CancellationToken) -> ProbeOutcome {
        let mut state = RetryState::new();
        let deadline = self.config.task_timeout.map(|t| Instant::now() + t);

        let url = match task.site.template.resolve(&task.username) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(site = %task.site.name, error = %e, "Cannot build probe URL");
                state.abort(ErrorKind::InvalidUrl);
                let rendered = task.site.template.render(&task.username);
                return self.finish(&task, rendered, &state, None, None).await;
            }
        };
        let url_str = url.to_string();
        let domain = DomainLimiter::domain_key(&url);

        let evidence = match CompiledEvidence::compile(
            task.site.evidence.as_ref(),
            task.site.not_found.as_ref(),
            &task.username,
        ) {
            Ok(evidence) => evidence,
            Err(e) => {
                tracing::warn!(site = %task.site.name, error = %e, "Cannot compile evidence");
                state.abort(ErrorKind::Other);
                return self.finish(&task, url_str, &state, None, None).await;
            }
        };

        self.reporter.report(ReportEvent::ProbeStarted {
            site: &task.site.name,
            url: &url_str,
            ordinal: task.ordinal,
            total: task.total,
        });

        let verdict = self
            .attempt_loop(&task, &url_str, &domain, &evidence, &mut state, deadline, cancel)
            .await;

        match verdict {
            Verdict::Terminal {
                status,
                http_status,
            } => {
                self.finish(&task, url_str, &state, Some(status), Some(http_status))
                    .await
            }
            Verdict::GaveUp { http_status } => {
                self.finish(&task, url_str, &state, None, http_status).await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop(
        &self,
        task: &ProbeTask,
        url: &str,
        domain: &str,
        evidence: &CompiledEvidence,
        state: &mut RetryState,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Verdict {
        let mut last_status = None;

        loop {
            if !pause(self.config.jitter.sample(), cancel).await {
                state.abort(ErrorKind::Cancelled);
                return Verdict::GaveUp {
                    http_status: last_status,
                };
            }

            let permit = match self.acquire_permit(domain, deadline, cancel).await {
                Ok(permit) => permit,
                Err(kind) => {
                    state.abort(kind);
                    return Verdict::GaveUp {
                        http_status: last_status,
                    };
                }
            };

            let attempt = state.begin_attempt();
            let result = self.send(url, permit).await;

            let error = match result {
                Ok(response) if !is_retryable_status(response.status) => {
                    state.succeed();
                    let hit = self
                        .matcher
                        .evaluate_bounded(
                            self.config.policy,
                            response.status,
                            response.body,
                            evidence.clone(),
                        )
                        .await;
                    return Verdict::Terminal {
                        status: if hit {
                            ProbeStatus::Hit
                        } else {
                            ProbeStatus::Miss
                        },
                        http_status: response.status,
                    };
                }
                Ok(response) => {
                    last_status = Some(response.status);
                    AppError::HttpStatus {
                        status: response.status,
                        url: url.to_string(),
                    }
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                self.reporter.report(ReportEvent::AttemptFailed {
                    site: &task.site.name,
                    url,
                    attempt,
                    error: &error,
                    retry_in: None,
                });
                state.abort(error.kind());
                return Verdict::GaveUp {
                    http_status: last_status,
                };
            }

            match state.fail(error.kind(), &self.config.retry) {
                RetryPhase::RetryWait(delay) => {
                    self.reporter.report(ReportEvent::AttemptFailed {
                        site: &task.site.name,
                        url,
                        attempt,
                        error: &error,
                        retry_in: Some(delay),
                    });
                    if !pause(delay, cancel).await {
                        state.abort(ErrorKind::Cancelled);
                        return Verdict::GaveUp {
                            http_status: last_status,
                        };
                    }
                }
                _ => {
                    let exhausted = AppError::ExhaustedRetries {
                        attempts: attempt,
                        last: error.kind(),
                    };
                    self.reporter.report(ReportEvent::AttemptFailed {
                        site: &task.site.name,
                        url,
                        attempt,
                        error: &exhausted,
                        retry_in: None,
                    });
                    return Verdict::GaveUp {
                        http_status: last_status,
                    };
                }
            }
        }
    }

    /// One HTTP exchange. Takes the permit by value so it is released as
    /// soon as the exchange ends, whatever the result.
    async fn send(
        &self,
        url: &str,
        permit: DomainPermit,
    ) -> Result<crate::models::HttpResponse, AppError> {
        let headers = self.rotator.next();
        let timeout = self.config.attempt_timeout;
        let result = match tokio::time::timeout(
            timeout,
            self.transport.get(url, &headers, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(timeout.as_millis() as u64)),
        };
        drop(permit);
        result
    }

    async fn acquire_permit(
        &self,
        domain: &str,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<DomainPermit, ErrorKind> {
        let bounded = async {
            match deadline {
                Some(at) => tokio::time::timeout_at(at, self.limiter.acquire(domain))
                    .await
                    .map_err(|_| ErrorKind::Timeout),
                None => Ok(self.limiter.acquire(domain).await),
            }
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ErrorKind::Cancelled),
            permit = bounded => permit,
        }
    }

    async fn finish(
        &self,
        task: &ProbeTask,
        url: String,
        state: &RetryState,
        terminal: Option<ProbeStatus>,
        http_status: Option<u16>,
    ) -> ProbeOutcome {
        let outcome = ProbeOutcome {
            site: task.site.clone(),
            username: task.username.clone(),
            url,
            status: terminal.unwrap_or_else(|| state.exhausted_status()),
            http_status,
            attempts: state.attempt(),
            elapsed: state.elapsed(),
            last_error: state.last_error(),
            ordinal: task.ordinal,
            total: task.total,
        };

        if outcome.is_hit() {
            let record = outcome.to_record();
            if let Err(e) = self.sink.append(&record).await {
                self.reporter.report(ReportEvent::SinkFailed {
                    site: &outcome.site.name,
                    url: &outcome.url,
                    error: &e,
                });
            }
        }

        self.reporter
            .report(ReportEvent::ProbeFinished { outcome: &outcome });
        outcome
    }
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{JitterRange, RetryPolicy};
    use crate::matcher::MatchPolicy;
    use crate::models::SiteSpec;
    use crate::testutil::{FailingSink, MemorySink, MockReply, MockTransport};
    use crate::traits::NullSink;

    fn fast_config() -> ScanConfig {
        ScanConfig::default()
            .with_jitter(JitterRange::none())
            .with_retry(RetryPolicy::new(
                3,
                Duration::from_millis(1),
                Duration::from_millis(4),
            ))
            .with_attempt_timeout(Duration::from_millis(200))
    }

    fn task(site: SiteSpec, username: &str) -> ProbeTask {
        ProbeTask {
            site: Arc::new(site),
            username: Arc::from(username),
            ordinal: 1,
            total: 1,
        }
    }

    fn site_a() -> SiteSpec {
        SiteSpec::new("A", "http://a.test/{user}")
            .unwrap()
            .with_evidence(["Profile"])
            .unwrap()
    }

    #[tokio::test]
    async fn hit_is_reported_and_sunk() {
        let transport = MockTransport::new()
            .route("http://a.test/bob", [MockReply::ok(200, "Profile: bob")]);
        let sink = MemorySink::new();
        let worker = ProbeWorker::new(transport.clone(), sink.clone(), fast_config());

        let outcome = worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, ProbeStatus::Hit);
        assert_eq!(outcome.url, "http://a.test/bob");
        assert_eq!(outcome.http_status, Some(200));
        assert_eq!(outcome.attempts, 1);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].site, "A");
        assert_eq!(records[0].username, "bob");
        assert_eq!(records[0].url, "http://a.test/bob");
        assert!(worker.limiter().is_idle());
    }

    #[tokio::test]
    async fn soft_404_is_a_miss() {
        let transport = MockTransport::new()
            .route("http://a.test/bob", [MockReply::ok(200, "No such user")]);
        let sink = MemorySink::new();
        let worker = ProbeWorker::new(transport, sink.clone(), fast_config());

        let outcome = worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, ProbeStatus::Miss);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn any200_ignores_evidence() {
        let transport = MockTransport::new()
            .route("http://a.test/bob", [MockReply::ok(200, "No such user")]);
        let worker = ProbeWorker::new(
            transport,
            NullSink,
            fast_config().with_policy(MatchPolicy::Any200),
        );
        let outcome = worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ProbeStatus::Hit);
    }

    #[tokio::test]
    async fn not_found_status_is_terminal_miss() {
        let transport =
            MockTransport::new().route("http://a.test/bob", [MockReply::ok(404, "gone")]);
        let worker = ProbeWorker::new(transport.clone(), NullSink, fast_config());
        let outcome = worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ProbeStatus::Miss);
        assert_eq!(outcome.http_status, Some(404));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(transport.calls_to("http://a.test/bob"), 1);
    }

    #[tokio::test]
    async fn server_errors_exhaust_attempts() {
        let transport =
            MockTransport::new().route("http://a.test/bob", [MockReply::ok(503, "busy")]);
        let sink = MemorySink::new();
        let worker = ProbeWorker::new(transport.clone(), sink.clone(), fast_config());

        let outcome = worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, ProbeStatus::Error);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.http_status, Some(503));
        assert_eq!(outcome.last_error, Some(ErrorKind::Status(503)));
        assert_eq!(transport.calls_to("http://a.test/bob"), 3);
        assert!(sink.records().is_empty());
        assert!(worker.limiter().is_idle());
    }

    #[tokio::test]
    async fn rate_limit_then_success_recovers() {
        let transport = MockTransport::new().route(
            "http://a.test/bob",
            [MockReply::ok(429, ""), MockReply::ok(200, "Profile")],
        );
        let worker = ProbeWorker::new(transport, NullSink, fast_config());
        let outcome = worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ProbeStatus::Hit);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.last_error, Some(ErrorKind::Status(429)));
    }

    #[tokio::test]
    async fn network_errors_are_retried() {
        let transport = MockTransport::new().route(
            "http://a.test/bob",
            [MockReply::Network, MockReply::ok(200, "Profile")],
        );
        let worker = ProbeWorker::new(transport, NullSink, fast_config());
        let outcome = worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ProbeStatus::Hit);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn stalled_site_times_out() {
        let transport = MockTransport::new().route("http://a.test/bob", [MockReply::Stall]);
        let config = fast_config().with_attempt_timeout(Duration::from_millis(20));
        let worker = ProbeWorker::new(transport, NullSink, config);
        let outcome = worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ProbeStatus::Timeout);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.last_error, Some(ErrorKind::Timeout));
        assert!(worker.limiter().is_idle());
    }

    #[tokio::test]
    async fn sink_failure_does_not_change_outcome() {
        let transport = MockTransport::new()
            .route("http://a.test/bob", [MockReply::ok(200, "Profile: bob")]);
        let worker = ProbeWorker::new(transport, FailingSink, fast_config());
        let outcome = worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ProbeStatus::Hit);
    }

    #[tokio::test]
    async fn unbuildable_url_is_an_error_without_attempts() {
        let transport = MockTransport::new();
        let site = SiteSpec::new("Sub", "https://{user}.example.com").unwrap();
        let worker = ProbeWorker::new(transport.clone(), NullSink, fast_config());
        let outcome = worker
            .execute(task(site, "a b:c"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ProbeStatus::Error);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.last_error, Some(ErrorKind::InvalidUrl));
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn dot_segment_username_never_probes_the_site_root() {
        let transport = MockTransport::new().route("http://a.test/", [MockReply::ok(200, "home")]);
        let sink = MemorySink::new();
        let worker = ProbeWorker::new(
            transport.clone(),
            sink.clone(),
            fast_config().with_policy(MatchPolicy::Any200),
        );
        for name in ["..", "."] {
            let outcome = worker
                .execute(task(site_a(), name), &CancellationToken::new())
                .await;
            assert_eq!(outcome.status, ProbeStatus::Error, "{name}");
            assert_eq!(outcome.last_error, Some(ErrorKind::InvalidUrl), "{name}");
        }
        assert_eq!(transport.total_calls(), 0);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start_sends_nothing() {
        let transport = MockTransport::new();
        let worker = ProbeWorker::new(transport.clone(), NullSink, fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = worker.execute(task(site_a(), "bob"), &cancel).await;
        assert_eq!(outcome.status, ProbeStatus::Error);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.last_error, Some(ErrorKind::Cancelled));
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let transport =
            MockTransport::new().route("http://a.test/bob", [MockReply::ok(503, "")]);
        let config = fast_config().with_retry(RetryPolicy::new(
            5,
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));
        let worker = ProbeWorker::new(transport.clone(), NullSink, config);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = worker.execute(task(site_a(), "bob"), &cancel).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.status, ProbeStatus::Error);
        assert_eq!(transport.total_calls(), 1);
        assert!(worker.limiter().is_idle());
    }

    #[tokio::test]
    async fn permit_wait_is_bounded_by_task_timeout() {
        let transport = MockTransport::new();
        let limiter = DomainLimiter::new(1);
        let _held = limiter.acquire("a.test").await;
        let worker = ProbeWorker::new(
            transport.clone(),
            NullSink,
            fast_config().with_task_timeout(Duration::from_millis(30)),
        )
        .with_limiter(limiter.clone());

        let outcome = worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ProbeStatus::Timeout);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn headers_come_from_the_rotator() {
        use crate::rotator::HeaderSet;
        let transport = MockTransport::new()
            .route("http://a.test/bob", [MockReply::ok(200, "Profile")]);
        let set = HeaderSet::from([("User-Agent".to_string(), "scout-test".to_string())]);
        let worker = ProbeWorker::new(transport.clone(), NullSink, fast_config())
            .with_rotator(HeaderRotator::new(vec![set.clone()]));
        worker
            .execute(task(site_a(), "bob"), &CancellationToken::new())
            .await;
        assert_eq!(transport.last_headers(), Some(set));
    }
}
