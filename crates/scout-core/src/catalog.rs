//! Site catalog loading.
//!
//! Accepted JSON shapes:
//!
//! ```json
//! [{"name": "GitHub", "url": "https://github.com/{user}", "evidence_regex": "..."}]
//! ["https://github.com/{user}", "https://gitlab.com/{user}"]
//! {"GitHub": "https://github.com/{user}", "Reddit": {"url": "...", "evidence_regex": ["..."]}}
//! ```
//!
//! `template` is accepted in place of `url`, and a missing name defaults to
//! the URL host. Malformed entries are skipped with a warning.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::models::SiteSpec;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSite {
    name: Option<String>,
    #[serde(alias = "template")]
    url: String,
    evidence_regex: Option<OneOrMany>,
    not_found_regex: Option<OneOrMany>,
}

/// Ordered, immutable list of sites shared by every probe of a run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    sites: Vec<Arc<SiteSpec>>,
}

impl Catalog {
    pub fn new(sites: Vec<SiteSpec>) -> Self {
        Self {
            sites: sites.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let catalog = Self::from_json_str(&raw)?;
        tracing::debug!(path = %path.display(), sites = catalog.len(), "Catalog loaded");
        Ok(catalog)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, AppError> {
        let value: Value = serde_json::from_str(raw)?;
        let entries: Vec<(Option<String>, Value)> = match value {
            Value::Array(items) => items.into_iter().map(|v| (None, v)).collect(),
            Value::Object(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
            _ => {
                return Err(AppError::ConfigError(
                    "catalog must be a JSON list or object".into(),
                ));
            }
        };

        let mut sites = Vec::with_capacity(entries.len());
        for (index, (key, value)) in entries.into_iter().enumerate() {
            match parse_entry(key, value) {
                Ok(site) => sites.push(Arc::new(site)),
                Err(e) => tracing::warn!(%index, error = %e, "Skipping catalog entry"),
            }
        }
        Ok(Self { sites })
    }

    pub fn sites(&self) -> &[Arc<SiteSpec>] {
        &self.sites
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn into_sites(self) -> Vec<Arc<SiteSpec>> {
        self.sites
    }
}

fn parse_entry(key: Option<String>, value: Value) -> Result<SiteSpec, AppError> {
    let raw = match value {
        Value::String(url) => RawSite {
            name: key,
            url,
            evidence_regex: None,
            not_found_regex: None,
        },
        Value::Object(_) => {
            let mut raw: RawSite = serde_json::from_value(value)
                .map_err(|e| AppError::ConfigError(format!("malformed site entry: {e}")))?;
            if key.is_some() {
                raw.name = key;
            }
            raw
        }
        other => {
            return Err(AppError::ConfigError(format!(
                "unsupported site entry: {other}"
            )));
        }
    };

    let name = match raw.name.filter(|n| !n.trim().is_empty()) {
        Some(name) => name,
        None => default_name(&raw.url),
    };

    let mut site = SiteSpec::new(name, &raw.url)?;
    if let Some(patterns) = raw.evidence_regex {
        site = site.with_evidence(patterns.into_vec())?;
    }
    if let Some(patterns) = raw.not_found_regex {
        site = site.with_not_found(patterns.into_vec())?;
    }
    Ok(site)
}

/// Host of the template URL, or the template itself if it has none.
fn default_name(template: &str) -> String {
    url::Url::parse(template)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| template.to_string())
}
