use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde_json::Value;

use crate::error::AppError;

/// Header name → value, sent as-is with a probe.
pub type HeaderSet = BTreeMap<String, String>;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// The header set used when nothing was configured.
pub fn default_header_set() -> HeaderSet {
    HeaderSet::from([
        ("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string()),
        (
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        ),
        ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
    ])
}

/// Hands out one of a fixed list of header sets per probe.
///
/// Selection is a uniform random choice from a thread-local RNG, so
/// concurrent callers never contend and the list itself is never mutated.
#[derive(Debug, Clone)]
pub struct HeaderRotator {
    sets: Arc<[HeaderSet]>,
}

impl HeaderRotator {
    /// Build from configured sets. Empty sets are dropped; if none remain
    /// the built-in default is used.
    pub fn new(sets: Vec<HeaderSet>) -> Self {
        let mut sets: Vec<HeaderSet> = sets.into_iter().filter(|s| !s.is_empty()).collect();
        if sets.is_empty() {
            tracing::debug!("No header sets configured, using built-in default");
            sets.push(default_header_set());
        }
        Self { sets: sets.into() }
    }

    /// Load a header file. A missing file yields the built-in default.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_json_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Header file not found, using default");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse either a list of header maps, or a profile object
    /// `{"Base": {..}, "User-Agents": [..], "Accept-Languages": [..]}` that
    /// expands to every base + agent + language combination.
    pub fn from_json_str(raw: &str) -> Result<Self, AppError> {
        let value: Value = serde_json::from_str(raw)?;
        let sets = match value {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(string_map(map)),
                    other => {
                        tracing::warn!(entry = %other, "Skipping non-object header set");
                        None
                    }
                })
                .collect(),
            Value::Object(map) => expand_profile(&map),
            Value::Null => Vec::new(),
            _ => {
                return Err(AppError::ConfigError(
                    "header file must be a JSON list or object".into(),
                ));
            }
        };
        Ok(Self::new(sets))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn sets(&self) -> &[HeaderSet] {
        &self.sets
    }

    pub fn next(&self) -> HeaderSet {
        self.sets
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(default_header_set)
    }
}

fn string_map(map: &serde_json::Map<String, Value>) -> HeaderSet {
    map.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn expand_profile(map: &serde_json::Map<String, Value>) -> Vec<HeaderSet> {
    let base = match map.get("Base") {
        Some(Value::Object(base)) => string_map(base),
        _ => HeaderSet::new(),
    };
    let agents = string_list(map.get("User-Agents"));
    let languages = string_list(map.get("Accept-Languages"));

    // An empty axis contributes nothing rather than emptying the product.
    let agents: Vec<Option<String>> = if agents.is_empty() {
        vec![None]
    } else {
        agents.into_iter().map(Some).collect()
    };
    let languages: Vec<Option<String>> = if languages.is_empty() {
        vec![None]
    } else {
        languages.into_iter().map(Some).collect()
    };

    let mut sets = Vec::with_capacity(agents.len() * languages.len());
    for agent in &agents {
        for language in &languages {
            let mut set = base.clone();
            if let Some(agent) = agent {
                set.insert("User-Agent".to_string(), agent.clone());
            }
            if let Some(language) = language {
                set.insert("Accept-Language".to_string(), language.clone());
            }
            sets.push(set);
        }
    }
    sets
}

impl Default for HeaderRotator {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn ua(agent: &str) -> HeaderSet {
        HeaderSet::from([("User-Agent".to_string(), agent.to_string())])
    }

    #[test]
    fn falls_back_to_default() {
        let rotator = HeaderRotator::new(Vec::new());
        assert_eq!(rotator.len(), 1);
        assert_eq!(rotator.next(), default_header_set());
    }

    #[test]
    fn empty_sets_are_ignored() {
        let rotator = HeaderRotator::new(vec![HeaderSet::new(), ua("a")]);
        assert_eq!(rotator.len(), 1);
        assert_eq!(rotator.next(), ua("a"));
    }

    #[test]
    fn next_always_returns_a_configured_set() {
        let rotator = HeaderRotator::new(vec![ua("a"), ua("b"), ua("c")]);
        let mut seen = HashSet::new();
        for _ in 0..300 {
            let set = rotator.next();
            assert!(rotator.sets().contains(&set));
            seen.insert(set["User-Agent"].clone());
        }
        // 300 uniform draws over 3 items all landing on two is vanishingly unlikely.
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn list_shape_loads_each_map() {
        let rotator = HeaderRotator::from_json_str(
            r#"[{"User-Agent": "a", "DNT": 1}, {"User-Agent": "b"}, "junk"]"#,
        )
        .unwrap();
        assert_eq!(rotator.len(), 2);
        assert_eq!(rotator.sets()[0]["DNT"], "1");
    }

    #[test]
    fn profile_shape_expands_combinations() {
        let rotator = HeaderRotator::from_json_str(
            r#"{"Base": {"Accept": "text/html"},
                "User-Agents": ["ua1", "ua2", "ua3"],
                "Accept-Languages": ["en", "de"]}"#,
        )
        .unwrap();
        assert_eq!(rotator.len(), 6);
        for set in rotator.sets() {
            assert_eq!(set["Accept"], "text/html");
            assert!(set.contains_key("User-Agent"));
            assert!(set.contains_key("Accept-Language"));
        }
    }

    #[test]
    fn profile_without_agents_keeps_base() {
        let rotator =
            HeaderRotator::from_json_str(r#"{"Base": {"User-Agent": "fixed"}}"#).unwrap();
        assert_eq!(rotator.sets(), &[ua("fixed")]);
    }

    #[test]
    fn missing_file_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = HeaderRotator::from_path(dir.path().join("headers.json")).unwrap();
        assert_eq!(rotator.sets(), &[default_header_set()]);
    }

    #[test]
    fn scalar_header_file_is_rejected() {
        assert!(matches!(
            HeaderRotator::from_json_str("3"),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn concurrent_selection_is_safe() {
        let rotator = HeaderRotator::new(vec![ua("a"), ua("b")]);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = rotator.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let set = r.next();
                        assert!(set["User-Agent"] == "a" || set["User-Agent"] == "b");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
