//! Flow-log discovery and line parsing.
//!
//! Finds plain and gzip-compressed flow logs under a root directory and turns
//! each JSON line into a [`FlowRecord`].

use std::io::BufRead;
use std::path::{Path, PathBuf};

use quota_core::error::{QuotaError, Result};
use quota_core::models::FlowRecord;
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::{debug, info, warn};

const PLAIN_SUFFIX: &str = ".log";
const ARCHIVE_SUFFIX: &str = ".log.gz";

// ── Discovery ─────────────────────────────────────────────────────────────────

/// How a file name matched the recognised log naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// `{prefix}*.log`
    Plain,
    /// `{prefix}*.log.gz`
    Archive,
}

/// Log files found under a root, split by naming convention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSources {
    pub plain: Vec<PathBuf>,
    pub archives: Vec<PathBuf>,
}

/// Match a bare file name against the recognised prefixes.
pub fn classify_source_name(file_name: &str, prefixes: &[String]) -> Option<SourceKind> {
    if !prefixes.iter().any(|p| file_name.starts_with(p.as_str())) {
        return None;
    }
    if file_name.ends_with(PLAIN_SUFFIX) {
        Some(SourceKind::Plain)
    } else if file_name.ends_with(ARCHIVE_SUFFIX) {
        Some(SourceKind::Archive)
    } else {
        None
    }
}

/// Find flow logs under `root`, descending at most `max_depth` directory
/// levels below it. Files directly in `root` are at level 0.
///
/// Symlinks are not followed. Both lists are sorted by path.
pub fn find_log_sources(root: &Path, max_depth: usize, prefixes: &[String]) -> LogSources {
    let mut sources = LogSources::default();

    if !root.exists() {
        warn!("Search root does not exist: {}", root.display());
        return sources;
    }

    info!(
        "Searching for log files in {} (max depth: {})",
        root.display(),
        max_depth
    );

    // walkdir counts the root itself as depth 0 and its files as depth 1.
    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .max_depth(max_depth.saturating_add(1));

    for entry in walker.into_iter().filter_map(|entry| entry.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        match classify_source_name(name, prefixes) {
            Some(SourceKind::Plain) => sources.plain.push(entry.into_path()),
            Some(SourceKind::Archive) => sources.archives.push(entry.into_path()),
            None => {}
        }
    }

    sources.plain.sort();
    sources.archives.sort();

    info!(
        "Found {} log files and {} gzip files.",
        sources.plain.len(),
        sources.archives.len()
    );
    sources
}

// ── Line parsing ──────────────────────────────────────────────────────────────

/// Wire shape of one flow log line. Unknown fields are ignored.
///
/// Addresses and the timestamp are captured as raw JSON so their text reaches
/// the record untouched; a numeric address is left for the classifier to
/// reject.
#[derive(Debug, Deserialize)]
struct RawFlow {
    #[serde(rename = "id.orig_h", default)]
    orig_h: Option<Box<RawValue>>,
    #[serde(rename = "id.resp_h", default)]
    resp_h: Option<Box<RawValue>>,
    #[serde(default)]
    orig_bytes: Option<u64>,
    #[serde(default)]
    resp_bytes: Option<u64>,
    #[serde(default)]
    ts: Option<Box<RawValue>>,
}

/// Text of a raw JSON value: strings unescaped, anything else as written.
fn raw_text(raw: Option<Box<RawValue>>) -> Result<Option<String>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let text = raw.get();
    if text.starts_with('"') {
        serde_json::from_str(text)
            .map(Some)
            .map_err(|e| QuotaError::MalformedRecord(e.to_string()))
    } else {
        Ok(Some(text.to_string()))
    }
}

/// Parse one JSON log line into a [`FlowRecord`].
///
/// Absent or null byte counts become 0. The timestamp is carried verbatim:
/// strings as-is, numbers exactly as written in the line, absent as `""`.
pub fn parse_line(line: &str) -> Result<FlowRecord> {
    let line = line.trim();
    if !line.starts_with('{') {
        return Err(QuotaError::MalformedRecord(
            "expected a JSON object".to_string(),
        ));
    }

    let raw: RawFlow =
        serde_json::from_str(line).map_err(|e| QuotaError::MalformedRecord(e.to_string()))?;

    Ok(FlowRecord {
        origin: raw_text(raw.orig_h)?,
        responder: raw_text(raw.resp_h)?,
        orig_bytes: raw.orig_bytes.unwrap_or(0),
        resp_bytes: raw.resp_bytes.unwrap_or(0),
        timestamp: raw_text(raw.ts)?.unwrap_or_default(),
    })
}

// ── File parsing ──────────────────────────────────────────────────────────────

/// Line counts for one parsed log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    /// Non-blank lines seen.
    pub lines_read: u64,
    /// Lines that produced a [`FlowRecord`].
    pub records_parsed: u64,
    /// Lines skipped as malformed.
    pub malformed: u64,
}

impl FileStats {
    pub fn absorb(&mut self, other: FileStats) {
        self.lines_read += other.lines_read;
        self.records_parsed += other.records_parsed;
        self.malformed += other.malformed;
    }
}

/// Stream `path` line by line, handing every parsed record to `visit`.
///
/// Malformed lines are logged and skipped. A read error part-way through the
/// file stops that file; records already visited stay visited. Failing to
/// open the file is returned as [`QuotaError::FileRead`].
pub fn parse_log_file(path: &Path, mut visit: impl FnMut(FlowRecord)) -> Result<FileStats> {
    info!("Parsing log file: {}", path.display());

    let file = std::fs::File::open(path).map_err(|source| QuotaError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = std::io::BufReader::new(file);
    let mut stats = FileStats::default();

    for (index, chunk) in reader.split(b'\n').enumerate() {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                warn!(
                    "Stopped reading {} at line {}: {}",
                    path.display(),
                    index + 1,
                    e
                );
                break;
            }
        };

        let Ok(line) = std::str::from_utf8(&bytes) else {
            stats.lines_read += 1;
            stats.malformed += 1;
            debug!(
                "Skipping non-UTF-8 line {} in {}",
                index + 1,
                path.display()
            );
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        stats.lines_read += 1;

        match parse_line(line) {
            Ok(record) => {
                stats.records_parsed += 1;
                visit(record);
            }
            Err(e) => {
                stats.malformed += 1;
                debug!(
                    "Skipping line {} in {}: {}",
                    index + 1,
                    path.display(),
                    e
                );
            }
        }
    }

    debug!(
        "File {}: {} read, {} parsed, {} malformed",
        path.display(),
        stats.lines_read,
        stats.records_parsed,
        stats.malformed,
    );

    Ok(stats)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
