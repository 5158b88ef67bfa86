//! Background persistence of the shared state.
//!
//! Mutation paths call [`Persister::schedule`], which never blocks. A writer
//! task on the network context waits for schedule requests and writes both
//! documents off the async threads. Requests that arrive while a write is
//! pending collapse into one write of the latest snapshot.

use super::state::SharedState;
use super::types::{ConversationMap, CorrespondentId};
use crate::store::{Document, DurableStore};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct Persister {
    state: Arc<SharedState>,
    store: DurableStore,
    /// Serializes writers so a later write always carries a later snapshot.
    save_lock: Mutex<()>,
    pending: Notify,
}

impl Persister {
    pub fn new(state: Arc<SharedState>, store: DurableStore) -> Self {
        Self {
            state,
            store,
            save_lock: Mutex::new(()),
            pending: Notify::new(),
        }
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    /// Request a write of both documents.
    pub fn schedule(&self) {
        self.pending.notify_one();
    }

    /// Write both documents now, on the calling thread.
    pub fn flush(&self) -> Result<()> {
        let _writer = self.save_lock.lock();
        let conversations = self.state.snapshot_conversations();
        let known = self.state.snapshot_known();
        self.store.save(Document::Conversations, &conversations)?;
        self.store.save(Document::Correspondents, &known)?;
        tracing::debug!(
            "Persisted {} conversations, {} correspondents",
            conversations.len(),
            known.len()
        );
        Ok(())
    }

    /// Write both documents on the blocking pool and wait for it.
    pub async fn flush_async(self: &Arc<Self>) -> Result<()> {
        let persister = Arc::clone(self);
        tokio::task::spawn_blocking(move || persister.flush()).await?
    }

    /// Writer loop; runs until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.pending.notified() => {
                    if let Err(e) = self.flush_async().await {
                        tracing::warn!("Persistence failed, keeping in-memory state: {e:#}");
                    }
                }
            }
        }
        tracing::debug!("Persistence writer stopped");
    }
}

/// Seed shared state from the store; missing or corrupt documents start empty.
pub fn load_state(store: &DurableStore) -> SharedState {
    let conversations: ConversationMap = store.load(Document::Conversations, ConversationMap::new());
    let known: Vec<CorrespondentId> = store.load(Document::Correspondents, Vec::new());
    tracing::info!(
        "Loaded {} conversations, {} known correspondents from {}",
        conversations.len(),
        known.len(),
        store.dir().display()
    );
    SharedState::from_snapshot(conversations, known)
}
