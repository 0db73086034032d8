//! Hit verification for probe responses.
//!
//! Patterns are compiled with the `regex` crate, whose engine runs in time
//! linear in the input, so a hostile pattern cannot backtrack
//! catastrophically. On top of that the scanned body is capped and every
//! evaluation runs under a wall-clock bound; a blown bound counts as
//! "no match" so a slow matcher can never produce a hit.

use std::str::FromStr;
use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};

use crate::error::AppError;
use crate::models::PLACEHOLDER_TOKENS;

/// Compiled program size cap for a single evidence pattern.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// How a 200 response is turned into a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// 200 plus evidence (sites without evidence fall back to any 200).
    #[default]
    EvidenceOnly,
    /// Any 200 is a hit.
    Any200,
}

impl MatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::EvidenceOnly => "evidence-only",
            MatchPolicy::Any200 => "any-200",
        }
    }
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "evidence-only" | "evidence_only" | "evidence" => Ok(MatchPolicy::EvidenceOnly),
            "any-200" | "any_200" | "any200" => Ok(MatchPolicy::Any200),
            _ => Err(format!("Unknown match policy: {}", s)),
        }
    }
}

/// Raw regex patterns attached to a site, validated at load time.
///
/// A `{user}` / `{!!}` token inside a pattern is replaced by the escaped
/// username when the set is compiled for a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSet {
    patterns: Vec<String>,
}

impl PatternSet {
    /// Build a set from raw patterns. Returns `Ok(None)` for an empty input.
    pub fn new<I, P>(patterns: I) -> Result<Option<Self>, AppError>
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(Into::into)
            .filter(|p| !p.trim().is_empty())
            .collect();
        if patterns.is_empty() {
            return Ok(None);
        }
        let set = Self { patterns };
        // Validate with a placeholder username so bad patterns fail at load time.
        set.compile_for("user")?;
        Ok(Some(set))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Compile every pattern for a specific username.
    pub fn compile_for(&self, username: &str) -> Result<Vec<Regex>, AppError> {
        let escaped = regex::escape(username);
        self.patterns
            .iter()
            .map(|raw| {
                let expanded = PLACEHOLDER_TOKENS
                    .iter()
                    .fold(raw.clone(), |acc, token| acc.replace(token, &escaped));
                RegexBuilder::new(&expanded)
                    .case_insensitive(true)
                    .multi_line(true)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|e| AppError::ConfigError(format!("invalid pattern '{raw}': {e}")))
            })
            .collect()
    }
}

/// Compiled evidence for one probe.
#[derive(Debug, Clone, Default)]
pub struct CompiledEvidence {
    pub evidence: Vec<Regex>,
    pub not_found: Vec<Regex>,
}

impl CompiledEvidence {
    pub fn compile(
        evidence: Option<&PatternSet>,
        not_found: Option<&PatternSet>,
        username: &str,
    ) -> Result<Self, AppError> {
        Ok(Self {
            evidence: match evidence {
                Some(set) => set.compile_for(username)?,
                None => Vec::new(),
            },
            not_found: match not_found {
                Some(set) => set.compile_for(username)?,
                None => Vec::new(),
            },
        })
    }
}

/// Decides whether a terminal response confirms an account.
#[derive(Debug, Clone)]
pub struct EvidenceMatcher {
    match_timeout: Duration,
    max_scan_bytes: usize,
}

impl Default for EvidenceMatcher {
    fn default() -> Self {
        Self {
            match_timeout: Duration::from_millis(250),
            max_scan_bytes: 2 * 1024 * 1024,
        }
    }
}

impl EvidenceMatcher {
    pub fn new(match_timeout: Duration, max_scan_bytes: usize) -> Self {
        Self {
            match_timeout,
            max_scan_bytes,
        }
    }

    /// Synchronous decision over an already-compiled evidence set.
    pub fn evaluate(
        &self,
        policy: MatchPolicy,
        http_status: u16,
        body: &str,
        evidence: &CompiledEvidence,
    ) -> bool {
        if http_status != 200 {
            return false;
        }
        match policy {
            MatchPolicy::Any200 => true,
            MatchPolicy::EvidenceOnly => {
                let haystack = truncate_at_char_boundary(body, self.max_scan_bytes);
                if evidence.evidence.is_empty() {
                    !evidence.not_found.iter().any(|re| re.is_match(haystack))
                } else {
                    evidence.evidence.iter().any(|re| re.is_match(haystack))
                }
            }
        }
    }

    /// Same decision, run on the blocking pool under the configured time bound.
    ///
    /// Returns `false` if the bound is exceeded.
    pub async fn evaluate_bounded(
        &self,
        policy: MatchPolicy,
        http_status: u16,
        body: String,
        evidence: CompiledEvidence,
    ) -> bool {
        // Nothing to scan: no need to leave the async runtime.
        if http_status != 200 || policy == MatchPolicy::Any200 {
            return self.evaluate(policy, http_status, &body, &evidence);
        }

        let matcher = self.clone();
        self.run_bounded(move || matcher.evaluate(policy, http_status, &body, &evidence))
            .await
    }

    async fn run_bounded<F>(&self, decide: F) -> bool
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        let started = Instant::now();
        let task = tokio::task::spawn_blocking(decide);

        match tokio::time::timeout(self.match_timeout, task).await {
            Ok(Ok(hit)) => hit,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Evidence matcher task failed, treating as no match");
                false
            }
            Err(_) => {
                let err = AppError::MatcherTimeout(started.elapsed().as_millis() as u64);
                tracing::warn!(error = %err, "Treating matcher timeout as no match");
                false
            }
        }
    }
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
