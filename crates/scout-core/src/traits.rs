use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{HitRecord, HttpResponse};
use crate::rotator::HeaderSet;

/// Performs one HTTP GET for a probe attempt.
///
/// Implementations map connection failures to [`AppError::NetworkError`] and
/// timeouts to [`AppError::Timeout`]. Any HTTP status, including 4xx and 5xx,
/// is returned as `Ok`; classifying it is the worker's job.
pub trait Transport: Send + Sync + Clone + 'static {
    fn get(
        &self,
        url: &str,
        headers: &HeaderSet,
        timeout: Duration,
    ) -> impl Future<Output = Result<HttpResponse, AppError>> + Send;
}

/// Receives confirmed hits as they are found.
pub trait ResultSink: Send + Sync + Clone + 'static {
    /// Persist one record. Errors are logged by the caller and never stop a scan.
    fn append(&self, record: &HitRecord) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A no-op ResultSink for use when persistence is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ResultSink for NullSink {
    async fn append(&self, _record: &HitRecord) -> Result<(), AppError> {
        Ok(())
    }
}
