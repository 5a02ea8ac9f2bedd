pub mod journal_worker;

pub use journal_worker::{JournalPipeline, JournalWorker, JournalWorkerHandle, PassError, PassReport};
