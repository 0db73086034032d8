//! Per-domain concurrency limiting for polite probing.
//!
//! Every domain gets its own counting semaphore, created the first time the
//! domain is seen and kept for the rest of the run. A [`DomainPermit`] is an
//! RAII guard: dropping it returns the slot, so a permit cannot leak on an
//! error, timeout, cancellation or panic path.
//!
//! # Example
//!
//! ```rust,no_run
//! use scout_core::limiter::DomainLimiter;
//!
//! # async fn run() {
//! let limiter = DomainLimiter::new(2);
//! let permit = limiter.acquire("example.com").await;
//! // ... issue one request to example.com ...
//! drop(permit);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

/// Default number of simultaneous requests allowed against one domain.
pub const DEFAULT_PER_DOMAIN_LIMIT: usize = 3;

/// Bounds in-flight requests per domain.
#[derive(Debug, Clone)]
pub struct DomainLimiter {
    limit: usize,
    domains: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

/// A held slot for one domain. Released on drop.
#[derive(Debug)]
pub struct DomainPermit {
    domain: String,
    _permit: OwnedSemaphorePermit,
}

impl DomainPermit {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl DomainLimiter {
    /// Create a limiter allowing `limit` concurrent holders per domain
    /// (a limit of zero is raised to one).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            domains: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Normalize a URL to its limiter key: the lowercased host, or the whole
    /// URL when it has no host so unrelated host-less URLs never share a slot.
    pub fn domain_key(url: &Url) -> String {
        match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => {
                tracing::debug!(%url, "URL has no host, limiting it on its own");
                url.as_str().to_string()
            }
        }
    }

    fn lock_domains(&self) -> MutexGuard<'_, HashMap<String, Arc<Semaphore>>> {
        self.domains.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned domain limiter mutex");
            poisoned.into_inner()
        })
    }

    fn semaphore(&self, domain: &str) -> Arc<Semaphore> {
        let mut map = self.lock_domains();
        if let Some(sem) = map.get(domain) {
            return sem.clone();
        }
        tracing::debug!(%domain, limit = self.limit, "Tracking new domain");
        let sem = Arc::new(Semaphore::new(self.limit));
        map.insert(domain.to_string(), sem.clone());
        sem
    }

    /// Wait for a free slot on `domain`.
    ///
    /// Cancel-safe: dropping the returned future before it resolves does not
    /// consume a slot.
    pub async fn acquire(&self, domain: &str) -> DomainPermit {
        let sem = self.semaphore(domain);
        // The semaphore is never closed, so acquisition can only succeed.
        let permit = match sem.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("domain semaphores are never closed"),
        };
        DomainPermit {
            domain: domain.to_string(),
            _permit: permit,
        }
    }

    /// Free slots currently available on `domain` (the full limit for an
    /// unseen domain).
    pub fn available(&self, domain: &str) -> usize {
        self.lock_domains()
            .get(domain)
            .map(|s| s.available_permits())
            .unwrap_or(self.limit)
    }

    /// Number of domains seen so far.
    pub fn tracked_domains(&self) -> usize {
        self.lock_domains().len()
    }

    /// True when no slot is held on any tracked domain.
    pub fn is_idle(&self) -> bool {
        self.lock_domains()
            .values()
            .all(|s| s.available_permits() == self.limit)
    }
}

impl Default for DomainLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PER_DOMAIN_LIMIT)
    }
}
