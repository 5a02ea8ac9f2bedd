//! Journal file access: tailing and cursor persistence.

pub mod cursor_store;
pub mod tailer;

pub use cursor_store::{CursorError, CursorStore, FileCursorStore, InMemoryCursorStore, ReadCursor};
pub use tailer::{latest_journal, JournalPattern, JournalTailer, TailBatch, TailError, TailerConfig};
