//! Persistence of the tailer's read position.
//!
//! The on-disk format is two UTF-8 lines: the journal file name, then the
//! byte offset in decimal. Writes go to a sibling temp file that is synced
//! and renamed over the target, then the directory is synced, so a crash
//! leaves either the old cursor or the new one. A file that does not parse
//! is logged and treated as absent; the tailer then starts over, and
//! idempotent reconciliation absorbs the replay.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::warn;

/// Read position within the journal: which file, and how far into it.
///
/// `byte_offset` always sits at a line boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadCursor {
    pub file_identity: String,
    pub byte_offset: u64,
}

impl ReadCursor {
    pub fn new(file_identity: impl Into<String>, byte_offset: u64) -> Self {
        Self {
            file_identity: file_identity.into(),
            byte_offset,
        }
    }

    /// Nothing has been read yet.
    pub fn is_empty(&self) -> bool {
        self.file_identity.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor i/o error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cursor store lock poisoned")]
    Poisoned,
}

/// Persistence for the tailer's read cursor.
pub trait CursorStore: Send + Sync {
    /// Load the stored cursor; `None` when nothing (valid) is stored.
    fn load(&self) -> Result<Option<ReadCursor>, CursorError>;

    /// Persist `cursor`, replacing whatever was stored.
    fn save(&self, cursor: &ReadCursor) -> Result<(), CursorError>;
}

/// Two-line text file: identity, then decimal offset.
///
/// Writes go to a sibling temp file that is synced and renamed over the
/// target, so a crash leaves either the old cursor or the new one.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> CursorError {
        CursorError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn parse_cursor(raw: &str) -> Option<ReadCursor> {
    let mut lines = raw.lines();
    let identity = lines.next()?.trim();
    let offset = lines.next()?.trim().parse::<u64>().ok()?;
    if identity.is_empty() {
        return None;
    }
    Some(ReadCursor::new(identity, offset))
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> Result<Option<ReadCursor>, CursorError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        let cursor = parse_cursor(&raw);
        if cursor.is_none() && !raw.trim().is_empty() {
            warn!(path = ?self.path, "malformed cursor file; starting from scratch");
        }
        Ok(cursor)
    }

    fn save(&self, cursor: &ReadCursor) -> Result<(), CursorError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            writeln!(file, "{}", cursor.file_identity)?;
            writeln!(file, "{}", cursor.byte_offset)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)?;
            sync_parent(&self.path)
        };
        write().map_err(|e| self.io_error(e))
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// In-memory cursor store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    inner: Mutex<Option<ReadCursor>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(cursor: ReadCursor) -> Self {
        Self {
            inner: Mutex::new(Some(cursor)),
        }
    }
}

impl CursorStore for InMemoryCursorStore {
    fn load(&self) -> Result<Option<ReadCursor>, CursorError> {
        let guard = self.inner.lock().map_err(|_| CursorError::Poisoned)?;
        Ok(guard.clone())
    }

    fn save(&self, cursor: &ReadCursor) -> Result<(), CursorError> {
        let mut guard = self.inner.lock().map_err(|_| CursorError::Poisoned)?;
        *guard = Some(cursor.clone());
        Ok(())
    }
}

impl<S: CursorStore + ?Sized> CursorStore for Box<S> {
    fn load(&self) -> Result<Option<ReadCursor>, CursorError> {
        (**self).load()
    }

    fn save(&self, cursor: &ReadCursor) -> Result<(), CursorError> {
        (**self).save(cursor)
    }
}
