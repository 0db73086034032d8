use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ProbeOutcome, ProbeStatus, ProbeTask, SiteSpec};
use crate::report::{ReportEvent, ScanReporter};
use crate::traits::{ResultSink, Transport};
use crate::worker::ProbeWorker;

/// Item of a [`ScanRun`] stream.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Outcome(ProbeOutcome),
    /// Emitted after the last outcome of a username.
    UserComplete(UserSummary),
}

/// Per-username tally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub username: Arc<str>,
    pub planned: usize,
    pub checked: usize,
    pub hits: usize,
    pub misses: usize,
    pub errors: usize,
    pub timeouts: usize,
    /// Cancellation stopped dispatch before every site was probed.
    pub interrupted: bool,
}

impl UserSummary {
    fn new(username: Arc<str>, planned: usize) -> Self {
        Self {
            username,
            planned,
            checked: 0,
            hits: 0,
            misses: 0,
            errors: 0,
            timeouts: 0,
            interrupted: false,
        }
    }
}

/// Whole-run tally returned by [`ScanRun::finish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub planned: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub hits: usize,
    pub misses: usize,
    pub errors: usize,
    pub timeouts: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// A running scan: a finite stream of [`ScanEvent`]s plus the final tally.
///
/// Dropping the run does not stop the scan; cancel its token for that.
pub struct ScanRun {
    events: mpsc::Receiver<ScanEvent>,
    handle: JoinHandle<ScanSummary>,
}

impl ScanRun {
    /// Next event, or `None` once the scan has drained.
    pub async fn next(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// Discard any unread events and wait for the tally.
    pub async fn finish(mut self) -> Result<ScanSummary, AppError> {
        while self.events.recv().await.is_some() {}
        self.handle
            .await
            .map_err(|e| AppError::Internal(format!("scan driver failed: {e}")))
    }
}

impl Stream for ScanRun {
    type Item = ScanEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

/// Builds tasks from catalog × usernames and runs them on a bounded pool.
pub struct ProbeScheduler<T, S>
where
    T: Transport,
    S: ResultSink,
{
    worker: Arc<ProbeWorker<T, S>>,
}

impl<T, S> Clone for ProbeScheduler<T, S>
where
    T: Transport,
    S: ResultSink,
{
    fn clone(&self) -> Self {
        Self {
            worker: self.worker.clone(),
        }
    }
}

impl<T, S> ProbeScheduler<T, S>
where
    T: Transport,
    S: ResultSink,
{
    pub fn new(worker: ProbeWorker<T, S>) -> Self {
        Self {
            worker: Arc::new(worker),
        }
    }

    pub fn worker(&self) -> &ProbeWorker<T, S> {
        &self.worker
    }

    /// Apply the configured `only` filter (case-insensitive on site name).
    pub fn filter_catalog(&self, catalog: &[Arc<SiteSpec>]) -> Vec<Arc<SiteSpec>> {
        let Some(only) = &self.worker.config().only else {
            return catalog.to_vec();
        };
        let kept: Vec<_> = catalog
            .iter()
            .filter(|site| only.contains(&site.name.to_lowercase()))
            .cloned()
            .collect();
        if kept.is_empty() && !catalog.is_empty() {
            self.worker
                .reporter()
                .report(ReportEvent::FilterMatchedNothing { filter: only.len() });
        }
        kept
    }

    /// Start a scan. Must be called inside a Tokio runtime.
    ///
    /// Usernames are trimmed, blanks dropped and duplicates removed, keeping
    /// first-seen order.
    pub fn run<I, U>(&self, catalog: &[Arc<SiteSpec>], usernames: I, cancel: CancellationToken) -> ScanRun
    where
        I: IntoIterator<Item = U>,
        U: AsRef<str>,
    {
        let sites = self.filter_catalog(catalog);
        let mut seen = HashSet::new();
        let users: Vec<Arc<str>> = usernames
            .into_iter()
            .map(|u| u.as_ref().trim().to_string())
            .filter(|u| !u.is_empty() && seen.insert(u.clone()))
            .map(Arc::from)
            .collect();

        let capacity = self.worker.config().concurrency.max(1) * 2;
        let (tx, rx) = mpsc::channel(capacity);
        let driver = Driver {
            worker: self.worker.clone(),
            sites,
            users,
            cancel,
            tx,
        };
        ScanRun {
            events: rx,
            handle: tokio::spawn(driver.drive()),
        }
    }
}

struct Driver<T, S>
where
    T: Transport,
    S: ResultSink,
{
    worker: Arc<ProbeWorker<T, S>>,
    sites: Vec<Arc<SiteSpec>>,
    users: Vec<Arc<str>>,
    cancel: CancellationToken,
    tx: mpsc::Sender<ScanEvent>,
}

struct UserProgress {
    summary: UserSummary,
    dispatched: usize,
    in_flight: usize,
    reported: bool,
}

impl<T, S> Driver<T, S>
where
    T: Transport,
    S: ResultSink,
{
    async fn drive(self) -> ScanSummary {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let reporter = self.worker.reporter().clone();
        let concurrency = self.worker.config().concurrency.max(1);
        let total = self.sites.len() * self.users.len();

        reporter.report(ReportEvent::ScanStarted {
            run_id,
            sites: self.sites.len(),
            usernames: self.users.len(),
            concurrency,
        });

        let mut summary = ScanSummary {
            planned: total,
            ..ScanSummary::default()
        };
        let mut progress: Vec<UserProgress> = self
            .users
            .iter()
            .map(|u| UserProgress {
                summary: UserSummary::new(u.clone(), self.sites.len()),
                dispatched: 0,
                in_flight: 0,
                reported: false,
            })
            .collect();

        let mut queue: VecDeque<(usize, Arc<str>, Arc<SiteSpec>)> = self
            .users
            .iter()
            .enumerate()
            .flat_map(|(ui, user)| {
                self.sites
                    .iter()
                    .map(move |site| (ui, user.clone(), site.clone()))
            })
            .collect();
        let mut pool: JoinSet<ProbeOutcome> = JoinSet::new();
        let mut owners: HashMap<Id, usize> = HashMap::new();
        let mut dispatch_open = total > 0;

        loop {
            while dispatch_open && pool.len() < concurrency {
                if self.cancel.is_cancelled() {
                    break;
                }
                let Some((ui, username, site)) = queue.pop_front() else {
                    dispatch_open = false;
                    break;
                };
                summary.dispatched += 1;
                let task = ProbeTask {
                    site,
                    username,
                    ordinal: summary.dispatched,
                    total,
                };
                let worker = self.worker.clone();
                let cancel = self.cancel.clone();
                let handle = pool.spawn(async move { worker.execute(task, &cancel).await });
                owners.insert(handle.id(), ui);
                progress[ui].dispatched += 1;
                progress[ui].in_flight += 1;
            }

            if dispatch_open && self.cancel.is_cancelled() {
                dispatch_open = false;
                summary.cancelled = true;
                reporter.report(ReportEvent::Cancelled {
                    dispatched: summary.dispatched,
                    planned: total,
                });
                self.flush_finished_users(&mut progress, false, reporter.as_ref())
                    .await;
            }

            let Some(joined) = pool.join_next_with_id().await else {
                break;
            };

            let ui = match joined {
                Ok((id, outcome)) => {
                    let ui = owners.remove(&id).unwrap_or_default();
                    summary.completed += 1;
                    let user = &mut progress[ui].summary;
                    user.checked += 1;
                    match outcome.status {
                        ProbeStatus::Hit => {
                            summary.hits += 1;
                            user.hits += 1;
                        }
                        ProbeStatus::Miss => {
                            summary.misses += 1;
                            user.misses += 1;
                        }
                        ProbeStatus::Error => {
                            summary.errors += 1;
                            user.errors += 1;
                        }
                        ProbeStatus::Timeout => {
                            summary.timeouts += 1;
                            user.timeouts += 1;
                        }
                    }
                    let _ = self.tx.send(ScanEvent::Outcome(outcome)).await;
                    ui
                }
                Err(e) => {
                    let message = e.to_string();
                    reporter.report(ReportEvent::TaskLost { error: &message });
                    let ui = owners.remove(&e.id()).unwrap_or_default();
                    summary.errors += 1;
                    progress[ui].summary.checked += 1;
                    progress[ui].summary.errors += 1;
                    ui
                }
            };
            progress[ui].in_flight = progress[ui].in_flight.saturating_sub(1);
            self.flush_finished_users(&mut progress, dispatch_open, reporter.as_ref())
                .await;
        }

        // Users left untouched because dispatch stopped early.
        self.flush_finished_users(&mut progress, false, reporter.as_ref())
            .await;

        // Cancelled after the last dispatch.
        if !summary.cancelled && self.cancel.is_cancelled() {
            summary.cancelled = true;
            reporter.report(ReportEvent::Cancelled {
                dispatched: summary.dispatched,
                planned: total,
            });
        }

        summary.elapsed = started.elapsed();
        reporter.report(ReportEvent::ScanFinished {
            run_id,
            summary: &summary,
        });
        summary
    }

    /// Emit `UserComplete` for every user with nothing left to run.
    async fn flush_finished_users(
        &self,
        progress: &mut [UserProgress],
        dispatch_open: bool,
        reporter: &dyn ScanReporter,
    ) {
        for user in progress.iter_mut() {
            if user.reported || user.in_flight > 0 || user.dispatched == 0 {
                continue;
            }
            let fully_dispatched = user.dispatched == user.summary.planned;
            if !fully_dispatched && dispatch_open {
                continue;
            }
            user.reported = true;
            user.summary.interrupted = !fully_dispatched;
            reporter.report(ReportEvent::UserCompleted {
                summary: &user.summary,
            });
            let _ = self
                .tx
                .send(ScanEvent::UserComplete(user.summary.clone()))
                .await;
        }
    }
}
