use std::{
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use ledgerstore_core::CancellationToken;

use crate::store::LedgerStore;

/// Background thread running reconciliation passes on a fixed interval.
///
/// Stopping cancels a pass in progress at the next record boundary, so
/// shutdown never waits for a full sweep.
pub struct ReconciliationWorker {
    shutdown: mpsc::Sender<()>,
    cancel: CancellationToken,
    join: Option<thread::JoinHandle<()>>,
}

impl ReconciliationWorker {
    pub fn spawn(store: Arc<LedgerStore>, interval: Duration) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let join = thread::Builder::new()
            .name("ledger-reconcile".to_string())
            .spawn(move || worker_loop(&store, interval, shutdown_rx, &token))?;

        Ok(Self {
            shutdown: shutdown_tx,
            cancel,
            join: Some(join),
        })
    }

    /// Requests shutdown and waits for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.cancel.cancel();
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl Drop for ReconciliationWorker {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn worker_loop(store: &LedgerStore, interval: Duration, shutdown_rx: mpsc::Receiver<()>, cancel: &CancellationToken) {
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if cancel.is_cancelled() {
            break;
        }
        match store.reconcile(cancel) {
            Ok(report) => tracing::debug!(
                resolved = report.resolved(),
                unresolved = report.unresolved.len(),
                finished = report.finished,
                "Reconciliation pass done"
            ),
            Err(e) => tracing::warn!(error = %e, "Reconciliation pass failed"),
        }
    }
    tracing::debug!("Reconciliation worker stopped");
}
