//! The relay core.
//!
//! [`Relay`] is the control side's view of the system: it reads shared state,
//! routes sends and reloads through the dispatch bridge and reconciles the
//! hand-off queue. The network side only ever sees the [`InboundRelay`]
//! handler returned by [`Relay::inbound_handler`].

pub mod bridge;
pub mod drain;
pub mod inbound;
pub mod persist;
pub mod reload;
pub mod state;
pub mod types;

pub use bridge::{DispatchBridge, DispatchError, DispatchHandle, NetworkContext};
pub use inbound::InboundRelay;
pub use persist::{Persister, load_state};
pub use reload::{ReloadOrchestrator, ReloadOutcome, ReloadSettings, ReloadSummary};
pub use state::{FetchedLog, SharedState};
pub use types::{CorrespondentId, MessageRecord};

use crate::channels::{DirectMessenger, HistoryLimit, InboundHandler};
use crate::config::Config;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// How long a send waits for the network side before reporting a timeout.
    pub dispatch_timeout: Duration,
    pub reload: ReloadSettings,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(15),
            reload: ReloadSettings::default(),
        }
    }
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        let relay = &config.relay;
        Self {
            dispatch_timeout: Duration::from_secs(relay.dispatch_timeout_secs),
            reload: ReloadSettings {
                concurrency: relay.reload_concurrency.max(1),
                timeout: Duration::from_secs(relay.reload_timeout_secs),
                history_limit: relay
                    .history_limit
                    .map_or(HistoryLimit::Unbounded, HistoryLimit::Latest),
            },
        }
    }
}

pub struct Relay {
    state: Arc<SharedState>,
    persister: Arc<Persister>,
    messenger: Arc<dyn DirectMessenger>,
    bridge: DispatchBridge,
    reloader: ReloadOrchestrator,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(
        state: Arc<SharedState>,
        persister: Arc<Persister>,
        messenger: Arc<dyn DirectMessenger>,
        bridge: DispatchBridge,
        settings: RelaySettings,
    ) -> Self {
        let reloader = ReloadOrchestrator::new(
            Arc::clone(&state),
            Arc::clone(&persister),
            Arc::clone(&messenger),
            bridge.clone(),
            settings.reload,
        );
        Self {
            state,
            persister,
            messenger,
            bridge,
            reloader,
            settings,
        }
    }

    /// Handler to register with the messenger's listener.
    pub fn inbound_handler(&self) -> Arc<dyn InboundHandler> {
        Arc::new(InboundRelay::new(
            Arc::clone(&self.state),
            Arc::clone(&self.persister),
        ))
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn persister(&self) -> &Arc<Persister> {
        &self.persister
    }

    pub fn get_status(&self) -> String {
        self.state.get_status()
    }

    pub fn get_unread_count(&self) -> usize {
        self.state.get_unread()
    }

    /// Message count per correspondent.
    pub fn list_conversations(&self) -> BTreeMap<CorrespondentId, usize> {
        self.state.conversation_counts()
    }

    pub fn get_conversation(&self, who: CorrespondentId) -> Vec<String> {
        self.state.get_log(who)
    }

    /// Send `text` to `who` and record it once the platform confirms.
    ///
    /// Blocks the calling thread up to the dispatch timeout. On timeout the
    /// message may still be delivered; nothing is recorded and the caller
    /// must not resend blindly.
    pub fn send_to(&self, who: CorrespondentId, text: &str) -> Result<(), DispatchError> {
        self.bridge
            .send_message(Arc::clone(&self.messenger), who, text.to_string())
            .wait(self.settings.dispatch_timeout)?;
        self.record_outbound(who, text);
        Ok(())
    }

    fn record_outbound(&self, who: CorrespondentId, text: &str) {
        self.state.append_message(who, &MessageRecord::outbound(text));
        self.persister.schedule();
        tracing::debug!("Sent message to {who}");
    }

    /// Run a full-history reload, blocking the calling thread.
    pub fn trigger_reload(&self) -> ReloadOutcome {
        self.bridge.block_on(self.reloader.run())
    }

    pub fn reload_in_progress(&self) -> bool {
        self.reloader.is_running()
    }

    /// Reconcile the hand-off queue; returns the number of entries drained.
    pub fn drain(&self) -> usize {
        drain::drain_queue(&self.state, &self.persister)
    }

    /// Write both documents synchronously.
    pub fn shutdown_flush(&self) -> Result<()> {
        self.persister.flush()
    }
}
