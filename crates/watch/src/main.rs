use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};

use depot_infra::journal::{CursorStore, FileCursorStore, JournalPattern, JournalTailer};
use depot_infra::store::{self, ProjectStore};
use depot_infra::{BrokerEvent, DepotReconciler, EngineConfig, JournalPipeline, JournalWorker};
use depot_observability::{LogFormat, LogSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = std::env::var("DEPOT_LOG_FORMAT")
        .ok()
        .and_then(|raw| LogFormat::parse(&raw))
        .unwrap_or_default();
    depot_observability::tracing::init(LogSettings::default().with_format(format));

    let config = EngineConfig::from_env().context("invalid DEPOT_* configuration")?;
    info!(
        backend = config.backend.kind(),
        journal_dir = ?config.journal_dir,
        pattern = %config.journal_pattern,
        "starting depot watch"
    );

    let opened = store::open(&config.backend)
        .await
        .context("failed to open project store")?;
    report_projects(opened.store.as_ref()).await;

    let cursors: Box<dyn CursorStore> = Box::new(FileCursorStore::new(&config.cursor_path));
    let tailer = JournalTailer::new(cursors, config.tailer.clone())
        .with_context(|| format!("failed to load journal cursor from {:?}", config.cursor_path))?;

    let pattern = JournalPattern::new(&config.journal_pattern).context("invalid journal pattern")?;
    let pipeline = Arc::new(JournalPipeline::new(
        &config.journal_dir,
        pattern,
        tailer,
        DepotReconciler::new(Arc::clone(&opened.store)),
    ));

    // Notification buses are blocking channels; drain them on plain threads
    // so they never hold up runtime shutdown.
    let ledger = pipeline.ledger();
    let ledger_changes = ledger
        .read()
        .map_err(|_| anyhow::anyhow!("cargo ledger lock poisoned"))?
        .subscribe();
    std::thread::Builder::new()
        .name("ledger-changes".to_string())
        .spawn(move || {
            while let Ok(change) = ledger_changes.recv() {
                match ledger.read() {
                    Ok(ledger) => info!(items = change.items, hold = ?ledger.snapshot(), "cargo hold changed"),
                    Err(_) => break,
                }
            }
        })
        .context("failed to spawn ledger listener")?;

    if let Some(broker) = &opened.broker {
        let changes = broker.subscribe();
        std::thread::Builder::new()
            .name("broker-changes".to_string())
            .spawn(move || {
                while let Ok(BrokerEvent::StateChanged { on_failover }) = changes.recv() {
                    if on_failover {
                        warn!("networked store running on fallback endpoint");
                    } else {
                        info!("networked store back on primary endpoint");
                    }
                }
            })
            .context("failed to spawn broker listener")?;
    }

    let worker = JournalWorker::new(Arc::clone(&pipeline), config.poll_interval).start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    worker.shutdown().await;
    if let Some(broker) = &opened.broker {
        broker.shutdown();
    }
    report_projects(opened.store.as_ref()).await;
    Ok(())
}

/// Log tracked projects and what each still needs.
async fn report_projects(store: &dyn ProjectStore) {
    let projects = match store.load().await {
        Ok(projects) => projects,
        Err(err) => {
            warn!(error = %err, "could not list projects");
            return;
        }
    };
    info!(count = projects.len(), origin = %store.origin(), "tracked projects");

    for project in projects {
        match store.materials_needed(project.facility_id).await {
            Ok(needs) => {
                let outstanding: i64 = needs.iter().map(|n| n.needed).sum();
                debug!(
                    facility_id = %project.facility_id,
                    facility = %project.facility_name,
                    outstanding,
                    resources = needs.len(),
                    "project materials"
                );
            }
            Err(err) => warn!(facility_id = %project.facility_id, error = %err, "could not load materials"),
        }
    }
}
