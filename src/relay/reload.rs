//! Full-history resynchronization.
//!
//! A reload fans out one history fetch per target through the dispatch
//! bridge, admits at most `concurrency` of them at a time and bounds the
//! whole fan-out by one deadline. Whatever completed by the deadline is
//! merged; the rest is cancelled and its late results discarded. Fetched
//! histories replace local logs outright.

use super::bridge::{DispatchBridge, DispatchError};
use super::persist::Persister;
use super::state::{FetchedLog, SharedState};
use super::types::CorrespondentId;
use crate::channels::{DirectMessenger, HistoryLimit, MessengerError};
use crate::concurrency::{AdmissionGate, DEFAULT_RELOAD_CONCURRENCY};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSettings {
    /// History fetches allowed in flight at once.
    pub concurrency: usize,
    /// Deadline for the whole fan-out.
    pub timeout: Duration,
    pub history_limit: HistoryLimit,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_RELOAD_CONCURRENCY,
            timeout: Duration::from_secs(120),
            history_limit: HistoryLimit::Unbounded,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub targets: usize,
    /// Correspondents whose logs were replaced.
    pub updated: Vec<CorrespondentId>,
    /// Targets whose fetch reported an error.
    pub failed: Vec<CorrespondentId>,
    /// Targets still outstanding when the deadline passed.
    pub timed_out: Vec<CorrespondentId>,
    /// Queue entries drained after the merge.
    pub drained: usize,
}

impl ReloadSummary {
    pub fn updated_count(&self) -> usize {
        self.updated.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Another reload is still in flight; nothing was done.
    AlreadyRunning,
    Completed(ReloadSummary),
}

pub struct ReloadOrchestrator {
    state: Arc<SharedState>,
    persister: Arc<Persister>,
    messenger: Arc<dyn DirectMessenger>,
    bridge: DispatchBridge,
    gate: Arc<AdmissionGate>,
    settings: ReloadSettings,
    running: AtomicBool,
}

/// Clears the running flag and the arrival watch however the run ends.
struct RunGuard<'a> {
    running: &'a AtomicBool,
    state: &'a SharedState,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.end_reload_watch();
        self.running.store(false, Ordering::Release);
    }
}

impl ReloadOrchestrator {
    pub fn new(
        state: Arc<SharedState>,
        persister: Arc<Persister>,
        messenger: Arc<dyn DirectMessenger>,
        bridge: DispatchBridge,
        settings: ReloadSettings,
    ) -> Self {
        Self {
            state,
            persister,
            messenger,
            bridge,
            gate: Arc::new(AdmissionGate::new(settings.concurrency)),
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Reload every known correspondent plus any with an open direct
    /// channel. Rejects with [`ReloadOutcome::AlreadyRunning`] while another
    /// run is in flight.
    pub async fn run(&self) -> ReloadOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!("Reload requested while one is in flight; rejected");
            return ReloadOutcome::AlreadyRunning;
        }
        let _guard = RunGuard {
            running: &self.running,
            state: &self.state,
        };

        let deadline = Instant::now() + self.settings.timeout;
        self.state.begin_reload_watch();

        let targets = self.collect_targets(deadline).await;
        tracing::info!(
            "Reloading history for {} correspondents (concurrency {})",
            targets.len(),
            self.gate.capacity()
        );

        let mut summary = ReloadSummary {
            targets: targets.len(),
            ..ReloadSummary::default()
        };
        let fetched = self.fetch_all(targets, deadline, &mut summary).await;

        summary.updated = self.state.replace_logs(fetched);
        summary.drained = self.state.drain_queue().len();

        if let Err(e) = self.persister.flush_async().await {
            tracing::warn!("Persisting reloaded history failed: {e:#}");
        }

        tracing::info!(
            "Reload finished: {} updated, {} failed, {} timed out, {} drained",
            summary.updated.len(),
            summary.failed.len(),
            summary.timed_out.len(),
            summary.drained
        );
        ReloadOutcome::Completed(summary)
    }

    async fn collect_targets(&self, deadline: Instant) -> BTreeSet<CorrespondentId> {
        let mut targets: BTreeSet<CorrespondentId> =
            self.state.snapshot_known().into_iter().collect();

        let messenger = Arc::clone(&self.messenger);
        let open = self
            .bridge
            .submit(async move { Ok::<_, MessengerError>(messenger.list_open_direct_channels().await) });
        match tokio::time::timeout_at(deadline, open.result()).await {
            Ok(Ok(channels)) => targets.extend(channels),
            Ok(Err(e)) => tracing::warn!("Listing open direct channels failed: {e}"),
            Err(_) => tracing::warn!("Listing open direct channels timed out"),
        }
        targets
    }

    async fn fetch_all(
        &self,
        targets: BTreeSet<CorrespondentId>,
        deadline: Instant,
        summary: &mut ReloadSummary,
    ) -> Vec<FetchedLog> {
        let mut cancellers = BTreeMap::new();
        let mut pending = FuturesUnordered::new();

        for who in targets {
            let gate = Arc::clone(&self.gate);
            let messenger = Arc::clone(&self.messenger);
            let state = Arc::clone(&self.state);
            let limit = self.settings.history_limit;
            let handle = self.bridge.submit(async move {
                let _permit = gate.acquire().await;
                let records = messenger.fetch_history(who, limit).await?;
                Ok::<_, MessengerError>((records, state.arrival_mark()))
            });
            cancellers.insert(who, handle.canceller());
            pending.push(async move { (who, handle.result().await) });
        }

        let mut fetched = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((who, outcome))) => {
                    cancellers.remove(&who);
                    match outcome {
                        Ok((records, completed_at)) => {
                            tracing::debug!("Fetched {} messages for {who}", records.len());
                            fetched.push(FetchedLog {
                                who,
                                lines: records.iter().map(|r| r.line()).collect(),
                                completed_at,
                            });
                        }
                        Err(DispatchError::Messenger(e)) if !e.is_transient() => {
                            tracing::warn!("Skipping {who}: {e}");
                            summary.failed.push(who);
                        }
                        Err(e) => {
                            tracing::warn!("History fetch for {who} failed, retry later: {e}");
                            summary.failed.push(who);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    for (who, canceller) in std::mem::take(&mut cancellers) {
                        canceller.abort();
                        summary.timed_out.push(who);
                    }
                    tracing::warn!(
                        "Reload deadline reached with {} fetches outstanding",
                        summary.timed_out.len()
                    );
                    break;
                }
            }
        }
        fetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_use_small_gate_and_unbounded_history() {
        let settings = ReloadSettings::default();
        assert_eq!(settings.concurrency, 3);
        assert_eq!(settings.history_limit, HistoryLimit::Unbounded);
        assert_eq!(settings.timeout, Duration::from_secs(120));
    }

    #[test]
    fn updated_count_reflects_replaced_logs() {
        let summary = ReloadSummary {
            targets: 3,
            updated: vec![CorrespondentId(1), CorrespondentId(2)],
            failed: vec![CorrespondentId(3)],
            ..ReloadSummary::default()
        };
        assert_eq!(summary.updated_count(), 2);
    }
}
