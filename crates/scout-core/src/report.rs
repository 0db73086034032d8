use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ProbeOutcome, ProbeStatus};
use crate::scheduler::{ScanSummary, UserSummary};

/// Events emitted by the worker and scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum ReportEvent<'a> {
    ScanStarted {
        run_id: Uuid,
        sites: usize,
        usernames: usize,
        concurrency: usize,
    },
    FilterMatchedNothing {
        filter: usize,
    },
    ProbeStarted {
        site: &'a str,
        url: &'a str,
        ordinal: usize,
        total: usize,
    },
    AttemptFailed {
        site: &'a str,
        url: &'a str,
        attempt: u32,
        error: &'a AppError,
        retry_in: Option<Duration>,
    },
    ProbeFinished {
        outcome: &'a ProbeOutcome,
    },
    SinkFailed {
        site: &'a str,
        url: &'a str,
        error: &'a AppError,
    },
    UserCompleted {
        summary: &'a UserSummary,
    },
    TaskLost {
        error: &'a str,
    },
    Cancelled {
        dispatched: usize,
        planned: usize,
    },
    ScanFinished {
        run_id: Uuid,
        summary: &'a ScanSummary,
    },
}

/// Trait for receiving scan events (decoupled logging).
pub trait ScanReporter: Send + Sync {
    fn report(&self, event: ReportEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingScanReporter;

impl ScanReporter for TracingScanReporter {
    fn report(&self, event: ReportEvent<'_>) {
        match event {
            ReportEvent::ScanStarted {
                run_id,
                sites,
                usernames,
                concurrency,
            } => {
                tracing::info!(%run_id, %sites, %usernames, %concurrency, "Scan started");
            }
            ReportEvent::FilterMatchedNothing { filter } => {
                tracing::warn!(%filter, "Site filter matched no catalog entries");
            }
            ReportEvent::ProbeStarted {
                site,
                url,
                ordinal,
                total,
            } => {
                tracing::debug!(%site, %url, %ordinal, %total, "Probing");
            }
            ReportEvent::AttemptFailed {
                site,
                url,
                attempt,
                error,
                retry_in,
            } => match retry_in {
                Some(delay) => tracing::debug!(
                    %site,
                    %url,
                    %attempt,
                    %error,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, backing off"
                ),
                None => tracing::debug!(%site, %url, %attempt, %error, "Attempt failed, giving up"),
            },
            ReportEvent::ProbeFinished { outcome } => match outcome.status {
                ProbeStatus::Hit => tracing::info!(
                    site = %outcome.site.name,
                    url = %outcome.url,
                    attempts = outcome.attempts,
                    "Hit"
                ),
                ProbeStatus::Miss => tracing::debug!(
                    site = %outcome.site.name,
                    url = %outcome.url,
                    http_status = ?outcome.http_status,
                    "Miss"
                ),
                ProbeStatus::Error | ProbeStatus::Timeout => tracing::debug!(
                    site = %outcome.site.name,
                    url = %outcome.url,
                    status = %outcome.status,
                    last_error = ?outcome.last_error,
                    attempts = outcome.attempts,
                    "Probe failed"
                ),
            },
            ReportEvent::SinkFailed { site, url, error } => {
                tracing::warn!(%site, %url, %error, "Failed to persist hit, continuing");
            }
            ReportEvent::UserCompleted { summary } => {
                tracing::info!(
                    username = %summary.username,
                    checked = summary.checked,
                    hits = summary.hits,
                    interrupted = summary.interrupted,
                    "Username complete"
                );
            }
            ReportEvent::TaskLost { error } => {
                tracing::error!(%error, "Probe task did not complete");
            }
            ReportEvent::Cancelled {
                dispatched,
                planned,
            } => {
                tracing::info!(%dispatched, %planned, "Scan cancelled, draining in-flight probes");
            }
            ReportEvent::ScanFinished { run_id, summary } => {
                tracing::info!(
                    %run_id,
                    completed = summary.completed,
                    hits = summary.hits,
                    errors = summary.errors,
                    timeouts = summary.timeouts,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "Scan finished"
                );
            }
        }
    }
}
