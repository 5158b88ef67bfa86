//! Shared fixtures for the relay integration tests.
//!
//! [`ScriptedMessenger`] stands in for the platform: histories, send
//! outcomes and delays are programmed per test, and every call is recorded.

#![allow(dead_code)]

use async_trait::async_trait;
use dmrelay::channels::{
    DirectMessenger, HistoryLimit, InboundHandler, InboundMessage, MessengerError,
};
use dmrelay::relay::{
    CorrespondentId, MessageRecord, NetworkContext, Persister, Relay, RelaySettings,
    ReloadSettings, SharedState,
};
use dmrelay::store::DurableStore;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

type FetchHook = Box<dyn Fn(CorrespondentId) + Send + Sync>;

#[derive(Clone)]
struct Scripted<T> {
    delay: Duration,
    result: Result<T, MessengerError>,
}

pub struct ScriptedMessenger {
    histories: Mutex<HashMap<CorrespondentId, Scripted<Vec<MessageRecord>>>>,
    open: Mutex<BTreeSet<CorrespondentId>>,
    send: Mutex<Scripted<()>>,
    sent: Mutex<Vec<(CorrespondentId, String)>>,
    limits_seen: Mutex<Vec<HistoryLimit>>,
    on_fetch: Mutex<Option<FetchHook>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetch_calls: AtomicUsize,
}

/// Keeps the in-flight count right even when a fetch is aborted.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedMessenger {
    pub fn new() -> Self {
        Self {
            histories: Mutex::new(HashMap::new()),
            open: Mutex::new(BTreeSet::new()),
            send: Mutex::new(Scripted {
                delay: Duration::ZERO,
                result: Ok(()),
            }),
            sent: Mutex::new(Vec::new()),
            limits_seen: Mutex::new(Vec::new()),
            on_fetch: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_history(self, who: u64, lines: &[(&str, &str)]) -> Self {
        self.with_delayed_history(who, lines, Duration::ZERO)
    }

    pub fn with_delayed_history(self, who: u64, lines: &[(&str, &str)], delay: Duration) -> Self {
        let records = lines
            .iter()
            .map(|(label, text)| MessageRecord::new(*label, *text))
            .collect();
        self.histories.lock().insert(
            CorrespondentId(who),
            Scripted {
                delay,
                result: Ok(records),
            },
        );
        self
    }

    pub fn with_fetch_error(self, who: u64, error: MessengerError) -> Self {
        self.histories.lock().insert(
            CorrespondentId(who),
            Scripted {
                delay: Duration::ZERO,
                result: Err(error),
            },
        );
        self
    }

    pub fn with_open_channel(self, who: u64) -> Self {
        self.open.lock().insert(CorrespondentId(who));
        self
    }

    pub fn with_send(self, result: Result<(), MessengerError>, delay: Duration) -> Self {
        *self.send.lock() = Scripted { delay, result };
        self
    }

    /// Run `hook` at the start of every history fetch, on the network context.
    pub fn set_on_fetch(&self, hook: impl Fn(CorrespondentId) + Send + Sync + 'static) {
        *self.on_fetch.lock() = Some(Box::new(hook));
    }

    pub fn sent(&self) -> Vec<(CorrespondentId, String)> {
        self.sent.lock().clone()
    }

    pub fn limits_seen(&self) -> Vec<HistoryLimit> {
        self.limits_seen.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectMessenger for ScriptedMessenger {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send_message(&self, to: CorrespondentId, text: &str) -> Result<(), MessengerError> {
        let script = self.send.lock().clone();
        tokio::time::sleep(script.delay).await;
        if script.result.is_ok() {
            self.sent.lock().push((to, text.to_string()));
        }
        script.result
    }

    async fn fetch_history(
        &self,
        with: CorrespondentId,
        limit: HistoryLimit,
    ) -> Result<Vec<MessageRecord>, MessengerError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.limits_seen.lock().push(limit);
        if let Some(hook) = self.on_fetch.lock().as_ref() {
            hook(with);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let script = self.histories.lock().get(&with).cloned();
        match script {
            Some(script) => {
                tokio::time::sleep(script.delay).await;
                script.result
            }
            None => Ok(Vec::new()),
        }
    }

    async fn list_open_direct_channels(&self) -> BTreeSet<CorrespondentId> {
        self.open.lock().clone()
    }

    async fn listen(&self, _handler: Arc<dyn InboundHandler>) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

pub fn direct(author: u64, label: &str, text: &str) -> InboundMessage {
    InboundMessage {
        author_id: CorrespondentId(author),
        author_label: label.to_string(),
        text: text.to_string(),
        author_is_bot: false,
        from_self: false,
        direct: true,
    }
}

pub fn settings(dispatch_timeout: Duration, reload_timeout: Duration) -> RelaySettings {
    RelaySettings {
        dispatch_timeout,
        reload: ReloadSettings {
            concurrency: 3,
            timeout: reload_timeout,
            history_limit: HistoryLimit::Unbounded,
        },
    }
}

/// A relay wired to a scripted messenger on a live network context.
pub struct Harness {
    pub relay: Arc<Relay>,
    pub state: Arc<SharedState>,
    pub messenger: Arc<ScriptedMessenger>,
    pub store: DurableStore,
    pub network: NetworkContext,
    pub tmp: TempDir,
}

impl Harness {
    pub fn new(messenger: ScriptedMessenger, settings: RelaySettings) -> Self {
        Self::with_state(SharedState::new(), messenger, settings)
    }

    pub fn with_state(
        state: SharedState,
        messenger: ScriptedMessenger,
        settings: RelaySettings,
    ) -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let store = DurableStore::new(tmp.path());
        let state = Arc::new(state);
        let persister = Arc::new(Persister::new(Arc::clone(&state), store.clone()));
        let network = NetworkContext::start().expect("network context");
        let messenger = Arc::new(messenger);
        let relay = Arc::new(Relay::new(
            Arc::clone(&state),
            persister,
            Arc::clone(&messenger) as Arc<dyn DirectMessenger>,
            network.bridge(),
            settings,
        ));
        Self {
            relay,
            state,
            messenger,
            store,
            network,
            tmp,
        }
    }

    pub fn handler(&self) -> Arc<dyn InboundHandler> {
        self.relay.inbound_handler()
    }
}
