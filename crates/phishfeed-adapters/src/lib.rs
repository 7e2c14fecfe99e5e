//! Shard discovery and decoding for locally materialized feed snapshots.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use phishfeed_core::{candidate_label, classify_io_error, Candidate, RetryDisposition};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "phishfeed-adapters";

/// Directory under the shard root that the crawler drops snapshots into.
pub const SHARD_SUBDIR: &str = "phishing_data";
pub const SHARD_EXTENSION: &str = "json";

/// Bytes of source text shown on each side of a parse failure.
const CONTEXT_RADIUS: usize = 50;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("shard directory {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("walking shard directory at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Shard(#[from] ShardError),
}

impl ScanError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::NotADirectory(_) => RetryDisposition::NonRetryable,
            Self::Io { source, .. } => classify_io_error(source),
            Self::Shard(err) => err.disposition(),
        }
    }
}

/// Enumerates shard files newest-first.
#[derive(Debug, Clone)]
pub struct ShardLocator {
    root: PathBuf,
}

impl ShardLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_dir(&self) -> PathBuf {
        self.root.join(SHARD_SUBDIR)
    }

    /// Every `phishing_data/**/*.json` file under the root, sorted by path
    /// in descending byte order. Shard names encode their capture time, so
    /// this is newest-first.
    pub fn locate(&self) -> Result<Vec<PathBuf>, ScanError> {
        let dir = self.shard_dir();
        if !dir.exists() {
            debug!(dir = %dir.display(), "shard directory does not exist yet");
            return Ok(Vec::new());
        }
        if !dir.is_dir() {
            return Err(ScanError::NotADirectory(dir));
        }

        let mut shards = Vec::new();
        let walker = WalkDir::new(&dir)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| dir.clone());
                    match err.into_io_error() {
                        Some(source) if classify_io_error(&source) == RetryDisposition::Retryable => {
                            return Err(ScanError::Io { path, source });
                        }
                        Some(source) => {
                            warn!(path = %path.display(), error = %source, "skipping unreadable shard path");
                        }
                        None => {
                            warn!(path = %path.display(), "skipping shard path caught in a link loop");
                        }
                    }
                    continue;
                }
            };

            let path = entry.path();
            if path.extension() == Some(OsStr::new(SHARD_EXTENSION)) && path.is_file() {
                shards.push(entry.into_path());
            }
        }

        shards.sort_by(|a, b| b.as_os_str().cmp(a.as_os_str()));
        Ok(shards)
    }
}

fn is_hidden(name: &OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}

/// One usable item of a shard: an object with an integer `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardItem {
    pub id: i64,
    pub candidate: Candidate,
}

#[derive(Debug, Clone)]
pub struct DecodedShard {
    pub path: PathBuf,
    pub items: Vec<ShardItem>,
    pub skipped_items: usize,
}

/// Where and why a shard failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub path: PathBuf,
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub position: usize,
    pub context: String,
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JSON Parse Error in file {}:\nError: {}\nPosition: {}\nLine: {}, Column: {}\nContext around error: {}",
            self.path.display(),
            self.message,
            self.position,
            self.line,
            self.column,
            self.context
        )
    }
}

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("{0}")]
    Parse(DecodeFailure),
    #[error("Invalid JSON structure in file {}: {reason}", .path.display())]
    Structure { path: PathBuf, reason: String },
    #[error("File reading error for {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ShardError {
    /// Only interrupted or timed-out reads are worth another attempt; every
    /// other failure means the shard is skipped for this run.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Read { source, .. } => classify_io_error(source),
            Self::Parse(_) | Self::Structure { .. } => RetryDisposition::NonRetryable,
        }
    }
}

pub fn decode_shard(path: &Path) -> Result<DecodedShard, ShardError> {
    let bytes = fs::read(path).map_err(|source| ShardError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    decode_shard_bytes(path, &bytes)
}

/// Parses shard text of shape `{"data": [...]}`. Items that are not objects
/// or lack an integer `id` are dropped one by one.
pub fn decode_shard_bytes(path: &Path, bytes: &[u8]) -> Result<DecodedShard, ShardError> {
    let root: JsonValue = serde_json::from_slice(bytes)
        .map_err(|err| ShardError::Parse(parse_failure(path, bytes, &err)))?;

    let structure = |reason: &str| ShardError::Structure {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let JsonValue::Object(mut root) = root else {
        return Err(structure("top-level value is not an object"));
    };
    let Some(data) = root.remove("data") else {
        return Err(structure("missing `data` key"));
    };
    let JsonValue::Array(raw_items) = data else {
        return Err(structure("`data` is not an array"));
    };

    let mut items = Vec::with_capacity(raw_items.len());
    let mut skipped_items = 0usize;
    for (index, raw) in raw_items.into_iter().enumerate() {
        let JsonValue::Object(candidate) = raw else {
            warn!(shard = %path.display(), index, "skipping non-object item");
            skipped_items += 1;
            continue;
        };
        let Some(id) = candidate.get("id").and_then(JsonValue::as_i64) else {
            warn!(
                shard = %path.display(),
                index,
                id = %candidate_label(&candidate),
                "skipping item without an integer id"
            );
            skipped_items += 1;
            continue;
        };
        items.push(ShardItem { id, candidate });
    }

    Ok(DecodedShard {
        path: path.to_path_buf(),
        items,
        skipped_items,
    })
}

fn parse_failure(path: &Path, bytes: &[u8], err: &serde_json::Error) -> DecodeFailure {
    let text = String::from_utf8_lossy(bytes);
    let position = byte_offset(&text, err.line(), err.column());
    DecodeFailure {
        path: path.to_path_buf(),
        message: err.to_string(),
        line: err.line(),
        column: err.column(),
        position,
        context: context_window(&text, position, CONTEXT_RADIUS).to_string(),
    }
}

/// Converts serde_json's 1-based line and column into a byte offset, clamped to
/// the text length.
fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    if line == 0 {
        return 0;
    }
    let line_start = text
        .split_inclusive('\n')
        .take(line - 1)
        .map(str::len)
        .sum::<usize>();
    (line_start + column.saturating_sub(1)).min(text.len())
}

fn context_window(text: &str, position: usize, radius: usize) -> &str {
    let mut start = position.saturating_sub(radius);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = position.saturating_add(radius).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    &text[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, body).expect("write");
    }

    #[test]
    fn locate_orders_shards_newest_first_across_subdirectories() {
        let dir = tempdir().expect("tempdir");
        let data = dir.path().join(SHARD_SUBDIR);
        write(&data.join("2026-01-01/feed_0100.json"), "{}");
        write(&data.join("2026-01-02/feed_0200.json"), "{}");
        write(&data.join("2026-01-02/feed_0300.json"), "{}");
        write(&data.join("2026-01-02/notes.txt"), "ignored");
        write(&data.join(".partial/feed_0400.json"), "{}");
        write(&dir.path().join("elsewhere/feed_9999.json"), "{}");

        let shards = ShardLocator::new(dir.path()).locate().expect("locate");
        let names = shards
            .iter()
            .map(|p| p.strip_prefix(&data).expect("under data").display().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "2026-01-02/feed_0300.json",
                "2026-01-02/feed_0200.json",
                "2026-01-01/feed_0100.json",
            ]
        );
    }

    #[test]
    fn missing_or_empty_shard_directory_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let locator = ShardLocator::new(dir.path());
        assert!(locator.locate().expect("missing dir").is_empty());

        fs::create_dir_all(locator.shard_dir()).expect("mkdir");
        assert!(locator.locate().expect("empty dir").is_empty());
    }

    #[test]
    fn shard_directory_that_is_a_file_is_rejected() {
        let dir = tempdir().expect("tempdir");
        write(&dir.path().join(SHARD_SUBDIR), "not a dir");
        let err = ShardLocator::new(dir.path()).locate().expect_err("file");
        assert!(matches!(err, ScanError::NotADirectory(_)));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn decode_keeps_file_order_and_skips_bad_items() {
        let body = r#"{"data": [
            {"id": 50, "url": "http://a.test"},
            "not an object",
            {"url": "http://no-id.test"},
            {"id": "41", "url": "http://string-id.test"},
            {"id": 40, "url": "http://b.test"}
        ]}"#;
        let shard = decode_shard_bytes(Path::new("shard.json"), body.as_bytes()).expect("decode");
        assert_eq!(shard.items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![50, 40]);
        assert_eq!(shard.skipped_items, 3);
        assert_eq!(shard.items[1].candidate["url"], "http://b.test");
    }

    #[test]
    fn parse_failure_reports_position_and_context() {
        let body = "{\"data\": [\n  {\"id\": 1},\n  {\"id\": 2,,}\n]}";
        let err = decode_shard_bytes(Path::new("broken.json"), body.as_bytes()).expect_err("corrupt");
        let ShardError::Parse(failure) = err else {
            panic!("expected parse failure");
        };
        assert_eq!(failure.line, 3);
        assert!(failure.column > 0);
        assert_eq!(&body[failure.position..failure.position + 1], ",");
        assert!(failure.context.contains("{\"id\": 2,,}"));
        let rendered = failure.to_string();
        assert!(rendered.starts_with("JSON Parse Error in file broken.json"));
        assert!(rendered.contains("Line: 3"));
    }

    #[test]
    fn wrong_top_level_shapes_are_structure_errors() {
        for body in [r#"[{"id": 1}]"#, r#"{"items": []}"#, r#"{"data": {"id": 1}}"#] {
            let err = decode_shard_bytes(Path::new("odd.json"), body.as_bytes()).expect_err(body);
            assert!(matches!(err, ShardError::Structure { .. }), "{body}");
            assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
        }
    }

    #[test]
    fn unreadable_shard_is_a_read_error() {
        let dir = tempdir().expect("tempdir");
        let err = decode_shard(&dir.path().join("gone.json")).expect_err("missing");
        assert!(matches!(err, ShardError::Read { .. }));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn context_window_respects_char_boundaries() {
        let text = "ééééé";
        assert_eq!(context_window(text, 3, 2), "ééé");
        assert_eq!(byte_offset("ab\ncd", 2, 2), 4);
    }
}
