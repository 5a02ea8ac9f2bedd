//! Incremental reader for the newest journal file in a directory.
//!
//! The game writes one journal per session and only ever appends to it, so
//! the tailer keeps a [`ReadCursor`] of (file name, byte offset) and each
//! call to [`JournalTailer::tail`] yields only the complete lines appended
//! since the previous call. A partial trailing line stays unread until its
//! newline arrives.
//!
//! ## Cursor rules
//!
//! - A different newest file restarts at offset 0 (`fresh_file`).
//! - An offset past the end of the same file means it was replaced in
//!   place; reading restarts at 0 as well.
//! - The cursor is saved before `tail` returns on every pass that moved it,
//!   including passes that consumed nothing but blank lines.
//!
//! ## Idle passes
//!
//! With `full_reread_on_idle`, a pass that finds no new lines hands back
//! every complete line of the file flagged `full_reread`. Consumers must
//! treat such a batch as a replay: snapshot merges are idempotent, cargo
//! deltas are not.
//!
//! ## Contention
//!
//! The writer may hold the file briefly. Sharing violations are retried a
//! bounded number of times and then surface as [`TailError::Locked`] with
//! the cursor untouched.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use glob::{MatchOptions, Pattern, PatternError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cursor_store::{CursorError, CursorStore, ReadCursor};

#[derive(Debug, Error)]
pub enum TailError {
    /// Non-fatal: no journal file exists yet.
    #[error("no journal file matching '{pattern}' in {dir:?}")]
    NoSourceFound { dir: PathBuf, pattern: String },

    #[error("invalid journal pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: PatternError,
    },

    /// The file stayed locked by its writer through every retry.
    #[error("journal {path:?} still locked after {attempts} attempts: {source}")]
    Locked {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("journal i/o error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Cursor(#[from] CursorError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailerConfig {
    /// Attempts per read when the writer holds a conflicting lock.
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// When a pass finds nothing new, deliver the whole file again.
    pub full_reread_on_idle: bool,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_delay: Duration::from_millis(250),
            full_reread_on_idle: true,
        }
    }
}

/// Lines delivered by one tail pass.
#[derive(Debug, Clone, Default)]
pub struct TailBatch {
    pub source: PathBuf,
    pub lines: Vec<String>,
    /// The whole file was re-delivered because nothing new was appended.
    pub full_reread: bool,
    /// Reading (re)started at offset 0: new file, or the file shrank.
    pub fresh_file: bool,
}

impl TailBatch {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Compiled journal file-name glob, matched case-insensitively.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalPattern(Pattern);

impl JournalPattern {
    pub fn new(pattern: &str) -> Result<Self, TailError> {
        Pattern::new(pattern)
            .map(Self)
            .map_err(|source| TailError::BadPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn matches(&self, file_name: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::new()
        };
        self.0.matches_with(file_name, options)
    }
}

pub struct JournalTailer<S = Box<dyn CursorStore>> {
    store: S,
    cursor: ReadCursor,
    config: TailerConfig,
}

impl<S: CursorStore> JournalTailer<S> {
    /// Load the stored cursor and build a tailer starting from it.
    pub fn new(store: S, config: TailerConfig) -> Result<Self, TailError> {
        let cursor = store.load()?.unwrap_or_default();
        if !cursor.is_empty() {
            debug!(file = %cursor.file_identity, offset = cursor.byte_offset, "resuming journal cursor");
        }
        Ok(Self { store, cursor, config })
    }

    pub fn cursor(&self) -> &ReadCursor {
        &self.cursor
    }

    /// Read newly completed lines from the newest file matching `pattern`.
    pub fn tail(&mut self, dir: &Path, pattern: &JournalPattern) -> Result<TailBatch, TailError> {
        let source = latest_journal(dir, pattern)?;
        let identity = file_identity(&source);
        let same_file = identity == self.cursor.file_identity;
        let start = if same_file { self.cursor.byte_offset } else { 0 };

        let chunk = self.read(&source, start)?;
        let fresh_file = !same_file || chunk.truncated;
        if !same_file {
            info!(file = %identity, "following new journal file");
        } else if chunk.truncated {
            warn!(file = %identity, offset = start, "journal shrank; reading from the start");
        }

        if !fresh_file && chunk.lines.is_empty() && self.config.full_reread_on_idle {
            // Blank lines still move the offset.
            if chunk.end != self.cursor.byte_offset {
                self.advance(ReadCursor::new(identity.clone(), chunk.end))?;
            }
            let whole = self.read(&source, 0)?;
            debug!(file = %identity, lines = whole.lines.len(), "idle pass; re-reading whole journal");
            return Ok(TailBatch {
                source,
                lines: whole.lines,
                full_reread: true,
                fresh_file: false,
            });
        }

        self.advance(ReadCursor::new(identity, chunk.end))?;

        Ok(TailBatch {
            source,
            lines: chunk.lines,
            full_reread: false,
            fresh_file,
        })
    }

    fn advance(&mut self, next: ReadCursor) -> Result<(), TailError> {
        self.store.save(&next)?;
        self.cursor = next;
        Ok(())
    }

    fn read(&self, path: &Path, start: u64) -> Result<Chunk, TailError> {
        retry_transient(path, self.config.retry_attempts, self.config.retry_delay, || {
            read_complete_lines(path, start)
        })
    }
}

#[derive(Debug)]
struct Chunk {
    lines: Vec<String>,
    /// Offset just past the last complete line.
    end: u64,
    truncated: bool,
}

fn read_complete_lines(path: &Path, start: u64) -> io::Result<Chunk> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let (start, truncated) = if start > len { (0, true) } else { (start, false) };

    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;

    let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
        return Ok(Chunk {
            lines: Vec::new(),
            end: start,
            truncated,
        });
    };

    let complete = &buf[..last_newline];
    let mut lines = Vec::new();
    for (idx, raw) in complete.split(|b| *b == b'\n').enumerate() {
        let mut text = String::from_utf8_lossy(raw).into_owned();
        if start == 0 && idx == 0 {
            if let Some(stripped) = text.strip_prefix('\u{feff}') {
                text = stripped.to_string();
            }
        }
        let text = text.trim_end_matches('\r');
        if !text.trim().is_empty() {
            lines.push(text.to_string());
        }
    }

    Ok(Chunk {
        lines,
        end: start + last_newline as u64 + 1,
        truncated,
    })
}

/// Run `op`, retrying transient lock/sharing failures.
fn retry_transient<T>(
    path: &Path,
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T, TailError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt < attempts => {
                debug!(path = ?path, attempt, error = %e, "journal busy; retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) if is_transient(&e) => {
                return Err(TailError::Locked {
                    path: path.to_path_buf(),
                    attempts,
                    source: e,
                });
            }
            Err(e) => {
                return Err(TailError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => true,
        // Windows reports a writer's share lock as access denied.
        io::ErrorKind::PermissionDenied => cfg!(windows),
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        _ => cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33)),
    }
}

/// Newest regular file in `dir` whose name matches `pattern`.
///
/// Ties on modification time go to the lexically greatest name; journal
/// names embed their creation time.
pub fn latest_journal(dir: &Path, pattern: &JournalPattern) -> Result<PathBuf, TailError> {
    let no_source = || TailError::NoSourceFound {
        dir: dir.to_path_buf(),
        pattern: pattern.as_str().to_string(),
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(no_source()),
        Err(e) => {
            return Err(TailError::Io {
                path: dir.to_path_buf(),
                source: e,
            });
        }
    };

    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !pattern.matches(&name) {
                return None;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, name, entry.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, _, path)| path)
        .ok_or_else(no_source)
}

fn file_identity(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::cursor_store::{FileCursorStore, InMemoryCursorStore};
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    fn journals() -> JournalPattern {
        JournalPattern::new("Journal.*.log").unwrap()
    }

    fn no_reread() -> TailerConfig {
        TailerConfig {
            full_reread_on_idle: false,
            ..TailerConfig::default()
        }
    }

    fn append(dir: &TempDir, name: &str, text: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.path().join(name))
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn pattern_matching() {
        let journals = journals();
        assert!(journals.matches("Journal.2025-03-01T101010.01.log"));
        assert!(journals.matches("journal.x.LOG"));
        assert!(!journals.matches("Journal.2025.txt"));
        assert!(!journals.matches("Status.json"));

        let dated = JournalPattern::new("Journal.[0-9]*.log").unwrap();
        assert!(dated.matches("Journal.2025.log"));
        assert!(!dated.matches("Journal.beta.log"));
        assert!(JournalPattern::new("a?").unwrap().matches("A1"));
    }

    #[test]
    fn malformed_pattern_is_rejected() {
        let err = JournalPattern::new("Journal.[.log").unwrap_err();
        assert!(matches!(err, TailError::BadPattern { .. }));
    }

    #[test]
    fn missing_directory_is_no_source() {
        let dir = tempdir().unwrap();
        let err = latest_journal(&dir.path().join("absent"), &journals()).unwrap_err();
        assert!(matches!(err, TailError::NoSourceFound { .. }));
    }

    #[test]
    fn empty_directory_is_no_source() {
        let dir = tempdir().unwrap();
        append(&dir, "Status.json", "{}\n");
        let mut tailer = JournalTailer::new(InMemoryCursorStore::new(), no_reread()).unwrap();
        let err = tailer.tail(dir.path(), &journals()).unwrap_err();
        assert!(matches!(err, TailError::NoSourceFound { .. }));
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let dir = tempdir().unwrap();
        let name = "Journal.2025-01-01T000000.01.log";
        append(&dir, name, "{\"event\":\"A\"}\n{\"event\":\"B\"}\n{\"eve");

        let mut tailer = JournalTailer::new(InMemoryCursorStore::new(), no_reread()).unwrap();
        let batch = tailer.tail(dir.path(), &journals()).unwrap();
        assert_eq!(batch.lines, vec!["{\"event\":\"A\"}", "{\"event\":\"B\"}"]);
        assert!(batch.fresh_file);

        append(&dir, name, "nt\":\"C\"}\n");
        let batch = tailer.tail(dir.path(), &journals()).unwrap();
        assert_eq!(batch.lines, vec!["{\"event\":\"C\"}"]);
        assert!(!batch.fresh_file);
    }

    #[test]
    fn idle_pass_rereads_whole_file_without_moving_cursor() {
        let dir = tempdir().unwrap();
        append(&dir, "Journal.1.log", "one\ntwo\n");

        let mut tailer = JournalTailer::new(InMemoryCursorStore::new(), TailerConfig::default()).unwrap();
        tailer.tail(dir.path(), &journals()).unwrap();
        let cursor = tailer.cursor().clone();

        let batch = tailer.tail(dir.path(), &journals()).unwrap();
        assert!(batch.full_reread);
        assert_eq!(batch.lines, vec!["one", "two"]);
        assert_eq!(tailer.cursor(), &cursor);
    }

    #[test]
    fn blank_lines_advance_cursor_before_idle_reread() {
        let dir = tempdir().unwrap();
        let name = "Journal.1.log";
        append(&dir, name, "a\n");

        let mut tailer = JournalTailer::new(InMemoryCursorStore::new(), TailerConfig::default()).unwrap();
        tailer.tail(dir.path(), &journals()).unwrap();
        append(&dir, name, "\n\n\n");

        let len = fs::metadata(dir.path().join(name)).unwrap().len();
        for _ in 0..3 {
            let batch = tailer.tail(dir.path(), &journals()).unwrap();
            assert!(batch.full_reread);
            assert_eq!(batch.lines, vec!["a"]);
            assert_eq!(tailer.cursor().byte_offset, len);
        }
    }

    #[test]
    fn idle_pass_without_reread_is_empty() {
        let dir = tempdir().unwrap();
        append(&dir, "Journal.1.log", "one\n");
        let mut tailer = JournalTailer::new(InMemoryCursorStore::new(), no_reread()).unwrap();
        tailer.tail(dir.path(), &journals()).unwrap();

        let batch = tailer.tail(dir.path(), &journals()).unwrap();
        assert!(batch.is_empty());
        assert!(!batch.full_reread);
    }

    #[test]
    fn switches_to_newer_file_from_the_start() {
        let dir = tempdir().unwrap();
        append(&dir, "Journal.2025-01-01T000000.01.log", "old-1\nold-2\n");
        let mut tailer = JournalTailer::new(InMemoryCursorStore::new(), no_reread()).unwrap();
        tailer.tail(dir.path(), &journals()).unwrap();

        append(&dir, "Journal.2025-01-02T000000.01.log", "new-1\n");
        let batch = tailer.tail(dir.path(), &journals()).unwrap();
        assert!(batch.fresh_file);
        assert_eq!(batch.lines, vec!["new-1"]);
        assert_eq!(tailer.cursor().file_identity, "Journal.2025-01-02T000000.01.log");
        assert_eq!(tailer.cursor().byte_offset, 6);
    }

    #[test]
    fn shrunk_file_is_read_from_the_start() {
        let dir = tempdir().unwrap();
        let name = "Journal.1.log";
        append(&dir, name, "first line\nsecond line\n");
        let store = InMemoryCursorStore::with_cursor(ReadCursor::new(name, 10_000));

        let mut tailer = JournalTailer::new(store, no_reread()).unwrap();
        let batch = tailer.tail(dir.path(), &journals()).unwrap();
        assert!(batch.fresh_file);
        assert_eq!(batch.lines.len(), 2);
    }

    #[test]
    fn restart_resumes_from_persisted_cursor() {
        let dir = tempdir().unwrap();
        let cursor_path = dir.path().join("state").join("cursor.txt");
        append(&dir, "Journal.1.log", "a\nb\n");

        let mut first = JournalTailer::new(FileCursorStore::new(&cursor_path), no_reread()).unwrap();
        assert_eq!(first.tail(dir.path(), &journals()).unwrap().lines.len(), 2);
        drop(first);

        append(&dir, "Journal.1.log", "c\n");
        let mut second = JournalTailer::new(FileCursorStore::new(&cursor_path), no_reread()).unwrap();
        assert_eq!(second.tail(dir.path(), &journals()).unwrap().lines, vec!["c"]);
    }

    #[test]
    fn crlf_and_bom_are_stripped() {
        let dir = tempdir().unwrap();
        append(&dir, "Journal.1.log", "\u{feff}{\"event\":\"Fileheader\"}\r\n\r\n{\"event\":\"X\"}\r\n");
        let mut tailer = JournalTailer::new(InMemoryCursorStore::new(), no_reread()).unwrap();
        let batch = tailer.tail(dir.path(), &journals()).unwrap();
        assert_eq!(batch.lines, vec!["{\"event\":\"Fileheader\"}", "{\"event\":\"X\"}"]);
    }

    #[test]
    fn transient_errors_are_retried_then_reported_as_locked() {
        let path = Path::new("Journal.1.log");
        let mut calls = 0;
        let result: Result<(), _> = retry_transient(path, 3, Duration::ZERO, || {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::WouldBlock, "locked"))
        });
        assert_eq!(calls, 3);
        assert!(matches!(result, Err(TailError::Locked { attempts: 3, .. })));
    }

    #[test]
    fn transient_error_then_success() {
        let path = Path::new("Journal.1.log");
        let mut calls = 0;
        let value = retry_transient(path, 5, Duration::ZERO, || {
            calls += 1;
            if calls < 3 {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "busy"))
            } else {
                Ok(42)
            }
        })
        .unwrap();
        assert_eq!(value, 42);
    }

    #[cfg(unix)]
    #[test]
    fn permission_denied_is_not_retried_on_unix() {
        let path = Path::new("Journal.1.log");
        let mut calls = 0;
        let result: Result<(), _> = retry_transient(path, 5, Duration::ZERO, || {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "mode 000"))
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(TailError::Io { .. })));
    }

    #[test]
    fn other_errors_are_not_retried() {
        let path = Path::new("Journal.1.log");
        let mut calls = 0;
        let result: Result<(), _> = retry_transient(path, 5, Duration::ZERO, || {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(TailError::Io { .. })));
    }
}
