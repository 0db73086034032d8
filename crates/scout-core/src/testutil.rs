//! Test utilities: in-memory implementations of the core traits.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, so clones share
//! state and tests can assert on recorded calls after a scan.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::models::{HitRecord, HttpResponse};
use crate::rotator::HeaderSet;
use crate::traits::{ResultSink, Transport};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// One scripted reply for a URL.
#[derive(Debug, Clone)]
pub enum MockReply {
    Respond(u16, String),
    /// Connection-level failure.
    Network,
    /// Transport-reported timeout.
    Timeout,
    /// Never answers; only the caller's timeout ends the attempt.
    Stall,
}

impl MockReply {
    pub fn ok(status: u16, body: &str) -> Self {
        MockReply::Respond(status, body.to_string())
    }
}

#[derive(Default)]
struct InFlight {
    current: HashMap<String, usize>,
    peak: HashMap<String, usize>,
}

/// Scripted transport keyed by exact URL.
///
/// Replies for a URL are consumed in order; the last one repeats forever.
/// Unknown URLs answer `404`.
#[derive(Clone, Default)]
pub struct MockTransport {
    routes: Arc<Mutex<HashMap<String, VecDeque<MockReply>>>>,
    calls: Arc<Mutex<Vec<(String, HeaderSet)>>>,
    in_flight: Arc<Mutex<InFlight>>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<I>(self, url: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = MockReply>,
    {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into_iter().collect());
        self
    }

    /// Hold every request open for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .count()
    }

    pub fn called_urls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(u, _)| u.clone())
            .collect()
    }

    pub fn last_headers(&self) -> Option<HeaderSet> {
        self.calls.lock().unwrap().last().map(|(_, h)| h.clone())
    }

    /// Highest number of simultaneous requests observed for `host`.
    pub fn peak_in_flight(&self, host: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap()
            .peak
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    fn next_reply(&self, url: &str) -> MockReply {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| MockReply::ok(404, "")),
            None => MockReply::ok(404, "not found"),
        }
    }

    fn enter(&self, host: &str) -> InFlightGuard {
        let mut state = self.in_flight.lock().unwrap();
        let current = state.current.entry(host.to_string()).or_insert(0);
        *current += 1;
        let now = *current;
        let peak = state.peak.entry(host.to_string()).or_insert(0);
        *peak = (*peak).max(now);
        InFlightGuard {
            state: self.in_flight.clone(),
            host: host.to_string(),
        }
    }
}

struct InFlightGuard {
    state: Arc<Mutex<InFlight>>,
    host: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock()
            && let Some(current) = state.current.get_mut(&self.host)
        {
            *current = current.saturating_sub(1);
        }
    }
}

impl Transport for MockTransport {
    async fn get(
        &self,
        url: &str,
        headers: &HeaderSet,
        timeout: Duration,
    ) -> Result<HttpResponse, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), headers.clone()));
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_default();
        let _guard = self.enter(&host);

        let reply = self.next_reply(url);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            MockReply::Respond(status, body) => Ok(HttpResponse::new(status, body)),
            MockReply::Network => Err(AppError::NetworkError("connection refused".into())),
            MockReply::Timeout => Err(AppError::Timeout(timeout.as_millis() as u64)),
            MockReply::Stall => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Sink that keeps every record in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<HitRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HitRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl ResultSink for MemorySink {
    async fn append(&self, record: &HitRecord) -> Result<(), AppError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Sink whose every append fails.
#[derive(Clone, Copy, Default)]
pub struct FailingSink;

impl ResultSink for FailingSink {
    async fn append(&self, _record: &HitRecord) -> Result<(), AppError> {
        Err(AppError::SinkError("disk full".into()))
    }
}
