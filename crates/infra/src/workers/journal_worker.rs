//! Periodic driver: tail → classify → {cargo ledger, depot reconciler}.
//!
//! A pass reads new journal lines, classifies each one and routes the result:
//! cargo deltas are applied to the ledger as one batch, depot snapshots are
//! reconciled in journal order. Malformed lines and store failures are
//! counted in the [`PassReport`] and logged; they never abort the pass.
//!
//! Batches flagged `full_reread` replay lines already seen, so their cargo
//! movements are dropped and only snapshots are merged.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use depot_cargo::CargoLedger;
use depot_events::{classify, CargoDelta, Classified, DepotSnapshot, JournalEvent};

use crate::journal::{JournalPattern, JournalTailer, TailError};
use crate::reconcile::{DepotReconciler, ReconcileOutcome};

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub lines: usize,
    /// Lines classified into a typed event.
    pub events: usize,
    pub unrecognized: usize,
    pub malformed: usize,
    /// Deltas applied to the ledger.
    pub cargo_deltas: usize,
    /// Snapshots merged into a tracked project.
    pub snapshots: usize,
    /// Snapshots that failed to reconcile.
    pub store_errors: usize,
    pub full_reread: bool,
}

#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Tail(#[from] TailError),

    #[error("tail task failed: {0}")]
    Join(String),

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

/// One journal pass, runnable on demand or from [`JournalWorker`].
pub struct JournalPipeline {
    journal_dir: PathBuf,
    pattern: JournalPattern,
    tailer: Arc<Mutex<JournalTailer>>,
    ledger: Arc<RwLock<CargoLedger>>,
    reconciler: DepotReconciler,
}

impl JournalPipeline {
    pub fn new(
        journal_dir: impl Into<PathBuf>,
        pattern: JournalPattern,
        tailer: JournalTailer,
        reconciler: DepotReconciler,
    ) -> Self {
        Self {
            journal_dir: journal_dir.into(),
            pattern,
            tailer: Arc::new(Mutex::new(tailer)),
            ledger: Arc::new(RwLock::new(CargoLedger::new())),
            reconciler,
        }
    }

    /// Shared read access for consumers; the pipeline is the only writer.
    pub fn ledger(&self) -> Arc<RwLock<CargoLedger>> {
        Arc::clone(&self.ledger)
    }

    pub fn reconciler(&self) -> &DepotReconciler {
        &self.reconciler
    }

    pub async fn run_pass(&self) -> Result<PassReport, PassError> {
        let tailer = Arc::clone(&self.tailer);
        let dir = self.journal_dir.clone();
        let pattern = self.pattern.clone();
        let batch = tokio::task::spawn_blocking(move || {
            let mut tailer = tailer.lock().map_err(|_| PassError::Poisoned("tailer"))?;
            tailer.tail(&dir, &pattern).map_err(PassError::from)
        })
        .await
        .map_err(|e| PassError::Join(e.to_string()))??;

        let mut report = PassReport {
            lines: batch.lines.len(),
            full_reread: batch.full_reread,
            ..PassReport::default()
        };

        let mut deltas: Vec<CargoDelta> = Vec::new();
        let mut snapshots: Vec<DepotSnapshot> = Vec::new();
        for line in &batch.lines {
            match classify(line) {
                Ok(Classified::Event(event)) => {
                    report.events += 1;
                    match event {
                        // A full re-read replays movements already applied.
                        JournalEvent::CargoMovement(_) if batch.full_reread => {}
                        JournalEvent::CargoMovement(movement) => deltas.extend(movement.deltas),
                        JournalEvent::DepotSnapshot(snapshot) => snapshots.push(snapshot),
                    }
                }
                Ok(Classified::Unrecognized { .. }) => report.unrecognized += 1,
                Err(err) => {
                    warn!(error = %err, file = ?batch.source, "malformed journal line skipped");
                    report.malformed += 1;
                }
            }
        }

        if !deltas.is_empty() {
            let mut ledger = self.ledger.write().map_err(|_| PassError::Poisoned("ledger"))?;
            report.cargo_deltas = ledger.apply_batch(&deltas);
        }

        for snapshot in &snapshots {
            match self.reconciler.reconcile(snapshot).await {
                Ok(ReconcileOutcome::Applied { .. }) => report.snapshots += 1,
                Ok(ReconcileOutcome::UnknownFacility) => {}
                Err(err) => {
                    warn!(facility_id = %snapshot.facility_id, error = %err, "snapshot reconcile failed");
                    report.store_errors += 1;
                }
            }
        }

        if report.lines > 0 && !report.full_reread {
            info!(
                lines = report.lines,
                cargo_deltas = report.cargo_deltas,
                snapshots = report.snapshots,
                "journal pass"
            );
        } else {
            debug!(?report, "journal pass");
        }
        Ok(report)
    }
}

/// Background worker running a [`JournalPipeline`] on a fixed interval.
pub struct JournalWorker {
    pipeline: Arc<JournalPipeline>,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

/// Handle to stop a running [`JournalWorker`].
#[derive(Debug)]
pub struct JournalWorkerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl JournalWorkerHandle {
    /// Request shutdown and wait for the current pass to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.join.await {
            warn!(error = %err, "journal worker ended abnormally");
        }
    }
}

impl JournalWorker {
    pub fn new(pipeline: Arc<JournalPipeline>, poll_interval: Duration) -> Self {
        Self {
            pipeline,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Spawn the loop. Passes never overlap; missed ticks are skipped.
    pub fn start(self) -> JournalWorkerHandle {
        let shutdown = Arc::clone(&self.shutdown);
        let pipeline = self.pipeline;
        let poll_interval = self.poll_interval;
        let stop = Arc::clone(&shutdown);

        let join = tokio::spawn(async move {
            info!(interval = ?poll_interval, "journal worker started");
            let mut ticks = tokio::time::interval(poll_interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticks.tick() => match pipeline.run_pass().await {
                        Ok(_) => {}
                        Err(PassError::Tail(TailError::NoSourceFound { dir, .. })) => {
                            debug!(dir = ?dir, "no journal file yet");
                        }
                        Err(PassError::Tail(err @ TailError::Locked { .. })) => {
                            warn!(error = %err, "journal pass aborted");
                        }
                        Err(err) => warn!(error = %err, "journal pass failed"),
                    },
                }
            }
            info!("journal worker stopped");
        });

        JournalWorkerHandle { shutdown, join }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{CursorStore, InMemoryCursorStore, TailerConfig};
    use crate::store::{InMemoryProjectStore, ProjectStore};
    use chrono::Utc;
    use depot_core::{BackendOrigin, FacilityId, Project};
    use std::io::Write;
    use tempfile::TempDir;

    const JOURNAL: &str = "Journal.2025-04-10T120000.01.log";

    struct Fixture {
        dir: TempDir,
        store: Arc<InMemoryProjectStore>,
        pipeline: JournalPipeline,
    }

    fn fixture(full_reread_on_idle: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryProjectStore::new());
        let cursors: Box<dyn CursorStore> = Box::new(InMemoryCursorStore::new());
        let tailer = JournalTailer::new(
            cursors,
            TailerConfig {
                full_reread_on_idle,
                ..TailerConfig::default()
            },
        )
        .unwrap();
        let pipeline = JournalPipeline::new(
            dir.path(),
            JournalPattern::new("Journal.*.log").unwrap(),
            tailer,
            DepotReconciler::new(store.clone()),
        );
        Fixture { dir, store, pipeline }
    }

    fn append(fx: &Fixture, lines: &[&str]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(fx.dir.path().join(JOURNAL))
            .unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    async fn track(store: &InMemoryProjectStore, id: i64) {
        let project = Project::new(
            FacilityId::new(id),
            "Synuefe XR-H d11-102",
            "Orbital Construction Site",
            "cmdr",
            Utc::now(),
            BackendOrigin::Local,
        )
        .unwrap();
        store.save(&project).await.unwrap();
    }

    const BUY: &str = r#"{"event":"MarketBuy","Type":"steel","Type_Localised":"Steel","Count":50}"#;
    const DEPOT: &str = r#"{"event":"ColonisationConstructionDepot","MarketID":42,"ConstructionProgress":0.1,"ConstructionComplete":false,"ConstructionFailed":false,"ResourcesRequired":[{"Name":"$Steel_name;","Name_Localised":"Steel","RequiredAmount":100,"ProvidedAmount":20,"Payment":4500}]}"#;

    #[tokio::test]
    async fn pass_feeds_ledger_and_store() {
        let fx = fixture(false);
        track(&fx.store, 42).await;
        append(
            &fx,
            &[
                r#"{"event":"Fileheader","part":1}"#,
                BUY,
                "not json at all",
                DEPOT,
                r#"{"event":"ColonisationContribution","MarketID":42,"Contributions":[{"Name":"$Steel_name;","Name_Localised":"Steel","Amount":20}]}"#,
            ],
        );

        let report = fx.pipeline.run_pass().await.unwrap();
        assert_eq!(report.lines, 5);
        assert_eq!(report.events, 3);
        assert_eq!(report.unrecognized, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.cargo_deltas, 2);
        assert_eq!(report.snapshots, 1);

        let ledger = fx.pipeline.ledger();
        assert_eq!(ledger.read().unwrap().quantity("steel"), 30);

        let row = fx
            .store
            .find_resource(FacilityId::new(42), "Steel")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.provided_amount, 20);
    }

    #[tokio::test]
    async fn full_reread_skips_cargo_but_reconciles() {
        let fx = fixture(true);
        append(&fx, &[BUY, DEPOT]);

        // Facility not tracked yet: the snapshot is ignored.
        let first = fx.pipeline.run_pass().await.unwrap();
        assert!(!first.full_reread);
        assert_eq!(first.snapshots, 0);

        track(&fx.store, 42).await;
        let second = fx.pipeline.run_pass().await.unwrap();
        assert!(second.full_reread);
        assert_eq!(second.cargo_deltas, 0);
        assert_eq!(second.snapshots, 1);

        let ledger = fx.pipeline.ledger();
        assert_eq!(ledger.read().unwrap().quantity("steel"), 50);
        assert!(fx
            .store
            .find_resource(FacilityId::new(42), "Steel")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn each_line_is_applied_once_across_passes() {
        let fx = fixture(false);
        append(&fx, &[BUY]);
        fx.pipeline.run_pass().await.unwrap();
        let idle = fx.pipeline.run_pass().await.unwrap();
        assert_eq!(idle.lines, 0);

        append(&fx, &[BUY]);
        fx.pipeline.run_pass().await.unwrap();
        assert_eq!(fx.pipeline.ledger().read().unwrap().quantity("steel"), 100);
    }

    #[tokio::test]
    async fn missing_journal_is_reported() {
        let fx = fixture(false);
        let err = fx.pipeline.run_pass().await.unwrap_err();
        assert!(matches!(err, PassError::Tail(TailError::NoSourceFound { .. })));
    }

    #[tokio::test]
    async fn worker_runs_until_shutdown() {
        let fx = fixture(false);
        append(&fx, &[BUY]);
        let pipeline = Arc::new(fx.pipeline);
        let ledger = pipeline.ledger();

        let handle = JournalWorker::new(pipeline, Duration::from_millis(10)).start();
        for _ in 0..200 {
            if ledger.read().unwrap().quantity("steel") == 50 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert_eq!(ledger.read().unwrap().quantity("steel"), 50);
    }
}
