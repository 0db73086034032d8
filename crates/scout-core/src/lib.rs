pub mod catalog;
pub mod config;
pub mod error;
pub mod limiter;
pub mod matcher;
pub mod models;
pub mod order;
pub mod report;
pub mod retry;
pub mod rotator;
pub mod scheduler;
pub mod traits;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use catalog::Catalog;
pub use config::{JitterRange, RetryPolicy, ScanConfig};
pub use error::{AppError, ErrorKind};
pub use limiter::{DomainLimiter, DomainPermit};
pub use matcher::{EvidenceMatcher, MatchPolicy};
pub use models::{HitRecord, HttpResponse, ProbeOutcome, ProbeStatus, ProbeTask, SiteSpec};
pub use order::ReorderBuffer;
pub use report::{ReportEvent, ScanReporter, TracingScanReporter};
pub use rotator::{HeaderRotator, HeaderSet};
pub use scheduler::{ProbeScheduler, ScanEvent, ScanRun, ScanSummary, UserSummary};
pub use traits::{NullSink, ResultSink, Transport};
pub use worker::ProbeWorker;
