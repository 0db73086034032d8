use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use url::Url;

use crate::error::{AppError, ErrorKind};
use crate::matcher::PatternSet;

/// Username placeholder tokens accepted in catalog templates.
pub const PLACEHOLDER_TOKENS: [&str; 2] = ["{user}", "{!!}"];

/// A URL template split around its single username placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    prefix: String,
    suffix: String,
}

impl UrlTemplate {
    /// Parse a raw template, requiring exactly one placeholder token.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let mut hits: Vec<(usize, usize)> = PLACEHOLDER_TOKENS
            .iter()
            .flat_map(|token| raw.match_indices(token).map(|(idx, t)| (idx, t.len())))
            .collect();
        hits.sort_unstable();

        match hits.as_slice() {
            [(idx, len)] => Ok(Self {
                prefix: raw[..*idx].to_string(),
                suffix: raw[idx + len..].to_string(),
            }),
            [] => Err(AppError::ConfigError(format!(
                "template '{raw}' has no username placeholder"
            ))),
            _ => Err(AppError::ConfigError(format!(
                "template '{raw}' has {} username placeholders, expected one",
                hits.len()
            ))),
        }
    }

    /// Substitute the username, escaping only characters that would change the
    /// structure of the URL.
    pub fn render(&self, username: &str) -> String {
        let mut out = String::with_capacity(self.prefix.len() + username.len() + self.suffix.len());
        out.push_str(&self.prefix);
        out.push_str(&encode_structural(username));
        out.push_str(&self.suffix);
        out
    }

    /// Render and parse into a URL.
    ///
    /// A username that would form a whole `.` or `..` path segment is rejected,
    /// since URL parsing collapses dot segments in any spelling.
    pub fn resolve(&self, username: &str) -> Result<Url, AppError> {
        let rendered = self.render(username);
        if self.placeholder_in_path() && is_dot_segment(&self.segment_around(username)) {
            return Err(AppError::InvalidUrl(format!(
                "{rendered}: username forms a dot segment"
            )));
        }
        Url::parse(&rendered).map_err(|e| AppError::InvalidUrl(format!("{rendered}: {e}")))
    }

    fn placeholder_in_path(&self) -> bool {
        let rest = self
            .prefix
            .split_once("://")
            .map_or(self.prefix.as_str(), |(_, rest)| rest);
        rest.contains('/') && !rest.contains(['?', '#'])
    }

    /// The rendered path segment the username lands in.
    fn segment_around(&self, username: &str) -> String {
        let head = self.prefix.rsplit('/').next().unwrap_or_default();
        let tail = self.suffix.split(['/', '?', '#']).next().unwrap_or_default();
        format!("{head}{}{tail}", encode_structural(username))
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{user}}{}", self.prefix, self.suffix)
    }
}

/// Characters that would split a path segment, start a query or fragment,
/// or add a query parameter. Non-ASCII bytes are always encoded.
const STRUCTURAL: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'/')
    .add(b'\\')
    .add(b'?')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'=')
    .add(b'+');

fn encode_structural(username: &str) -> String {
    utf8_percent_encode(username, STRUCTURAL).to_string()
}

fn is_dot_segment(segment: &str) -> bool {
    let lowered = segment.to_ascii_lowercase().replace("%2e", ".");
    lowered == "." || lowered == ".."
}

/// One site of the catalog.
#[derive(Debug, Clone)]
pub struct SiteSpec {
    pub name: String,
    pub template: UrlTemplate,
    /// Patterns confirming a genuine profile page (any match counts).
    pub evidence: Option<PatternSet>,
    /// Patterns marking a soft-404 page.
    pub not_found: Option<PatternSet>,
}

impl SiteSpec {
    pub fn new(name: impl Into<String>, template: &str) -> Result<Self, AppError> {
        Ok(Self {
            name: name.into(),
            template: UrlTemplate::parse(template)?,
            evidence: None,
            not_found: None,
        })
    }

    pub fn with_evidence<I, P>(mut self, patterns: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.evidence = PatternSet::new(patterns)?;
        Ok(self)
    }

    pub fn with_not_found<I, P>(mut self, patterns: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.not_found = PatternSet::new(patterns)?;
        Ok(self)
    }
}

/// A single (username, site) unit of work.
#[derive(Debug, Clone)]
pub struct ProbeTask {
    pub site: Arc<SiteSpec>,
    pub username: Arc<str>,
    /// 1-based submission index across the whole run.
    pub ordinal: usize,
    pub total: usize,
}

/// Final classification of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Hit,
    Miss,
    Error,
    Timeout,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Hit => "hit",
            ProbeStatus::Miss => "miss",
            ProbeStatus::Error => "error",
            ProbeStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one probe, produced exactly once per [`ProbeTask`].
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub site: Arc<SiteSpec>,
    pub username: Arc<str>,
    pub url: String,
    pub status: ProbeStatus,
    pub http_status: Option<u16>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_error: Option<ErrorKind>,
    pub ordinal: usize,
    pub total: usize,
}

impl ProbeOutcome {
    pub fn is_hit(&self) -> bool {
        self.status == ProbeStatus::Hit
    }

    /// Record handed to a [`ResultSink`](crate::traits::ResultSink) for a hit.
    pub fn to_record(&self) -> HitRecord {
        HitRecord {
            site: self.site.name.clone(),
            username: self.username.to_string(),
            url: self.url.clone(),
            http_status: self.http_status,
            elapsed_ms: self.elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }
}

/// A confirmed hit as persisted by sinks.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HitRecord {
    pub site: String,
    pub username: String,
    pub url: String,
    pub http_status: Option<u16>,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Transport-neutral response: status code plus decoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_accepts_either_token() {
        let a = UrlTemplate::parse("https://example.com/{user}").unwrap();
        let b = UrlTemplate::parse("https://example.com/{!!}").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "https://example.com/{user}");
    }

    #[test]
    fn template_rejects_missing_or_repeated_placeholder() {
        assert!(matches!(
            UrlTemplate::parse("https://example.com/"),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            UrlTemplate::parse("https://example.com/{user}?q={user}"),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            UrlTemplate::parse("https://{!!}.example.com/{user}"),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn render_substitutes_exactly_once() {
        let t = UrlTemplate::parse("http://a.test/u/{user}/profile").unwrap();
        assert_eq!(t.render("bob"), "http://a.test/u/bob/profile");
        // A username that looks like a placeholder is not expanded again.
        assert_eq!(t.render("{user}"), "http://a.test/u/{user}/profile");
    }

    #[test]
    fn subdomain_template_resolves() {
        let t = UrlTemplate::parse("https://{user}.tumblr.com").unwrap();
        let url = t.resolve("Alice").unwrap();
        assert_eq!(url.host_str(), Some("alice.tumblr.com"));
    }

    #[test]
    fn reserved_characters_keep_the_url_well_formed() {
        let t = UrlTemplate::parse("http://a.test/{user}").unwrap();
        for name in [
            "a/b", "a?b=1", "x#frag", "50%", "john doe", "ünï", "a&b", "a\\b", "...", ".a",
        ] {
            let url = t.resolve(name).unwrap();
            assert_eq!(url.host_str(), Some("a.test"), "{name}");
            assert_eq!(url.query(), None, "{name}");
            assert_eq!(url.fragment(), None, "{name}");
            let segments: Vec<_> = url.path_segments().unwrap().collect();
            assert_eq!(segments.len(), 1, "{name}");
            assert!(!segments[0].is_empty(), "{name}");
        }
        assert_eq!(t.resolve("a\\b").unwrap().path(), "/a%5Cb");
    }

    #[test]
    fn dot_segment_usernames_are_rejected_in_paths() {
        let t = UrlTemplate::parse("http://a.test/{user}").unwrap();
        for name in [".", ".."] {
            assert!(
                matches!(t.resolve(name), Err(AppError::InvalidUrl(_))),
                "{name}"
            );
        }
        // A literal percent is escaped, so this stays one real segment.
        assert_eq!(t.resolve("%2e%2E").unwrap().path(), "/%252e%252E");
        let nested = UrlTemplate::parse("http://a.test/u/{user}/profile").unwrap();
        assert!(matches!(nested.resolve(".."), Err(AppError::InvalidUrl(_))));
        // Part of a longer segment is harmless.
        let ext = UrlTemplate::parse("http://a.test/{user}.json").unwrap();
        assert_eq!(ext.resolve("..").unwrap().path(), "/...json");
    }

    #[test]
    fn query_template_keeps_single_parameter() {
        let t = UrlTemplate::parse("http://a.test/search?u={user}").unwrap();
        let url = t.resolve("a#b").unwrap();
        assert_eq!(url.query(), Some("u=a%23b"));
        assert_eq!(url.fragment(), None);

        for name in ["a&admin=1", "a+b", ".."] {
            let url = t.resolve(name).unwrap();
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            assert_eq!(pairs, vec![("u".to_string(), name.to_string())], "{name}");
            assert_eq!(url.path(), "/search", "{name}");
        }
    }

    #[test]
    fn invalid_host_is_reported() {
        let t = UrlTemplate::parse("https://{user}.example.com").unwrap();
        assert!(matches!(t.resolve("a b:c"), Err(AppError::InvalidUrl(_))));
    }

    #[test]
    fn status_strings() {
        assert_eq!(ProbeStatus::Hit.to_string(), "hit");
        assert_eq!(ProbeStatus::Timeout.as_str(), "timeout");
    }
}
