//! Debounced source-tree watcher driving background ingestion.

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecursiveMode},
    DebounceEventResult,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::KnowledgeError;
use super::snapshot::{scan_source_dir, SourceFilter};
use super::store::KnowledgeStore;

/// Events emitted by the knowledge watcher.
#[derive(Debug)]
pub enum WatchEvent {
    /// A debounced batch touched these eligible files.
    Changed(Vec<PathBuf>),
    /// The underlying watcher reported an error.
    Error(String),
}

/// Watches a source directory recursively.
///
/// Uses notify-debouncer-full and bridges batches to a tokio mpsc channel.
pub struct KnowledgeWatcher {
    source_dir: PathBuf,
    stop_tx: std_mpsc::Sender<()>,
    bridge_handle: Option<thread::JoinHandle<()>>,
}

impl KnowledgeWatcher {
    /// Start watching `source_dir`.
    ///
    /// Returns the watcher and a receiver of debounced change batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the file watcher cannot be created.
    pub fn new(
        source_dir: PathBuf,
        debounce: Duration,
        filter: SourceFilter,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>), KnowledgeError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let (notify_tx, notify_rx) = std_mpsc::channel();

        let mut debouncer = new_debouncer(debounce, None, move |result| {
            let _ = notify_tx.send(result);
        })?;
        debouncer.watch(&source_dir, RecursiveMode::Recursive)?;

        let bridge_handle = thread::spawn(move || {
            loop {
                if stop_rx.try_recv().is_ok() {
                    break;
                }
                match notify_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(result) => {
                        if !Self::forward(result, &filter, &event_tx) {
                            break;
                        }
                    }
                    Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            // Keep debouncer alive until thread exits
            drop(debouncer);
        });

        tracing::info!(path = %source_dir.display(), "Watching knowledge sources");
        Ok((
            Self {
                source_dir,
                stop_tx,
                bridge_handle: Some(bridge_handle),
            },
            event_rx,
        ))
    }

    /// Forward one debounced batch. Returns `false` once the receiver is gone.
    fn forward(
        result: DebounceEventResult,
        filter: &SourceFilter,
        event_tx: &mpsc::UnboundedSender<WatchEvent>,
    ) -> bool {
        match result {
            Ok(events) => {
                let mut paths: Vec<PathBuf> = events
                    .iter()
                    .filter(|e| {
                        matches!(
                            e.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        )
                    })
                    .flat_map(|e| e.paths.iter())
                    .filter(|p| filter.is_eligible(p))
                    .cloned()
                    .collect();
                paths.sort();
                paths.dedup();
                if paths.is_empty() {
                    return true;
                }
                event_tx.send(WatchEvent::Changed(paths)).is_ok()
            }
            Err(errors) => errors
                .into_iter()
                .all(|e| event_tx.send(WatchEvent::Error(e.to_string())).is_ok()),
        }
    }

    /// The watched directory.
    #[must_use]
    pub fn source_dir(&self) -> &PathBuf {
        &self.source_dir
    }

    /// Stop watching and wait for the bridge thread.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.bridge_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KnowledgeWatcher {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

/// Re-ingest the full source tree for every change batch until cancelled.
///
/// Errors are logged; the loop keeps running.
pub async fn run_ingest_loop(
    store: Arc<KnowledgeStore>,
    source_dir: PathBuf,
    filter: SourceFilter,
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(WatchEvent::Changed(paths)) => {
                tracing::debug!(count = paths.len(), "Source change detected");
                let dir = source_dir.clone();
                let scan_filter = filter.clone();
                let snapshot =
                    tokio::task::spawn_blocking(move || scan_source_dir(&dir, &scan_filter)).await;
                match snapshot {
                    Ok(Ok(docs)) => {
                        if let Err(e) = store.ingest(&docs).await {
                            tracing::error!(error = %e, "Ingestion failed");
                        }
                    }
                    Ok(Err(e)) => tracing::error!(error = %e, "Failed to snapshot sources"),
                    Err(e) => tracing::error!(error = %e, "Snapshot task failed"),
                }
            }
            Some(WatchEvent::Error(e)) => tracing::warn!(error = %e, "Watcher error"),
            None => break,
        }
    }
    tracing::debug!("Ingest loop stopped");
}
