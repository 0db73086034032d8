//! File-backed result sinks.
//!
//! Every sink writes each hit as it arrives. [`FileSinks`] fans one record
//! out to whichever sinks are configured.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use scout_core::error::AppError;
use scout_core::models::HitRecord;
use scout_core::traits::ResultSink;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

fn ensure_parent(path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn sink_error(path: &Path, e: impl std::fmt::Display) -> AppError {
    AppError::SinkError(format!("{}: {e}", path.display()))
}

// ---------------------------------------------------------------------------
// Links file
// ---------------------------------------------------------------------------

struct LinksState {
    file: tokio::fs::File,
    seen: HashSet<String>,
}

/// Append-only list of hit URLs, one per line.
///
/// Lines already present in the file are never written again, and each
/// new line is flushed and synced before `append` returns.
#[derive(Clone)]
pub struct LinksFileSink {
    path: Arc<PathBuf>,
    state: Arc<Mutex<LinksState>>,
}

impl LinksFileSink {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        ensure_parent(&path)?;

        let seen = match tokio::fs::read_to_string(&path).await {
            Ok(existing) => existing
                .lines()
                .map(str::trim_end)
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e.into()),
        };

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        tracing::debug!(path = %path.display(), existing = seen.len(), "Links file opened");
        Ok(Self {
            path: Arc::new(path),
            state: Arc::new(Mutex::new(LinksState { file, seen })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for LinksFileSink {
    async fn append(&self, record: &HitRecord) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.seen.contains(&record.url) {
            return Ok(());
        }
        let line = format!("{}\n", record.url);
        state
            .file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| sink_error(&self.path, e))?;
        state
            .file
            .flush()
            .await
            .map_err(|e| sink_error(&self.path, e))?;
        state
            .file
            .sync_all()
            .await
            .map_err(|e| sink_error(&self.path, e))?;
        state.seen.insert(record.url.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSONL
// ---------------------------------------------------------------------------

/// One JSON object per hit. The file is truncated when opened.
#[derive(Clone)]
pub struct JsonlSink {
    path: Arc<PathBuf>,
    file: Arc<Mutex<tokio::fs::File>>,
}

impl JsonlSink {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        ensure_parent(&path)?;
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            path: Arc::new(path),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for JsonlSink {
    async fn append(&self, record: &HitRecord) -> Result<(), AppError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| sink_error(&self.path, e))?;
        file.flush().await.map_err(|e| sink_error(&self.path, e))
    }
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

/// CSV with a header row. The file is truncated when opened.
#[derive(Clone)]
pub struct CsvSink {
    path: Arc<PathBuf>,
    writer: Arc<std::sync::Mutex<csv::Writer<File>>>,
}

impl CsvSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        ensure_parent(&path)?;
        let writer = csv::Writer::from_path(&path).map_err(|e| sink_error(&path, e))?;
        Ok(Self {
            path: Arc::new(path),
            writer: Arc::new(std::sync::Mutex::new(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for CsvSink {
    async fn append(&self, record: &HitRecord) -> Result<(), AppError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| sink_error(&self.path, "writer lock poisoned"))?;
        writer
            .serialize(record)
            .map_err(|e| sink_error(&self.path, e))?;
        writer.flush().map_err(|e| sink_error(&self.path, e))
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Forwards each hit to every configured file sink.
///
/// A failing sink does not stop the others; their errors are joined into a
/// single [`AppError::SinkError`].
#[derive(Clone, Default)]
pub struct FileSinks {
    links: Option<LinksFileSink>,
    jsonl: Option<JsonlSink>,
    csv: Option<CsvSink>,
    saved: Arc<AtomicUsize>,
}

impl FileSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_links(mut self, sink: LinksFileSink) -> Self {
        self.links = Some(sink);
        self
    }

    pub fn with_jsonl(mut self, sink: JsonlSink) -> Self {
        self.jsonl = Some(sink);
        self
    }

    pub fn with_csv(mut self, sink: CsvSink) -> Self {
        self.csv = Some(sink);
        self
    }

    /// Records accepted by every configured sink.
    pub fn saved(&self) -> usize {
        self.saved.load(Ordering::Relaxed)
    }

    /// Paths of the configured sinks, for the closing summary.
    pub fn paths(&self) -> Vec<(&'static str, &Path)> {
        let mut out = Vec::new();
        if let Some(s) = &self.links {
            out.push(("links", s.path()));
        }
        if let Some(s) = &self.jsonl {
            out.push(("jsonl", s.path()));
        }
        if let Some(s) = &self.csv {
            out.push(("csv", s.path()));
        }
        out
    }
}

impl ResultSink for FileSinks {
    async fn append(&self, record: &HitRecord) -> Result<(), AppError> {
        let mut failures = Vec::new();
        if let Some(sink) = &self.links
            && let Err(e) = sink.append(record).await
        {
            failures.push(e.to_string());
        }
        if let Some(sink) = &self.jsonl
            && let Err(e) = sink.append(record).await
        {
            failures.push(e.to_string());
        }
        if let Some(sink) = &self.csv
            && let Err(e) = sink.append(record).await
        {
            failures.push(e.to_string());
        }

        if failures.is_empty() {
            self.saved.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(AppError::SinkError(failures.join("; ")))
        }
    }
}
