use crate::channels::{DirectMessenger, DiscordMessenger, InboundHandler};
use crate::config::Config;
use crate::control::{self, SessionEnd};
use crate::relay::{NetworkContext, Persister, Relay, RelaySettings, SharedState, load_state};
use crate::store::DurableStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run the interactive relay against Discord until the operator leaves.
pub fn run(config: Config) -> Result<SessionEnd> {
    let token = config
        .token()
        .context("No bot token configured; run `dmrelay set-token` first")?
        .to_string();
    let messenger: Arc<dyn DirectMessenger> = Arc::new(DiscordMessenger::new(token));

    run_with(config, messenger, |relay, mut config| {
        control::run(&relay, &mut config)
    })
}

/// Wire the relay around `messenger` and hand it to `control` on its own
/// thread. Returns once `control` does, after the final flush.
pub fn run_with<C, T>(config: Config, messenger: Arc<dyn DirectMessenger>, control: C) -> Result<T>
where
    C: FnOnce(Arc<Relay>, Config) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = DurableStore::new(&config.data_dir);
    store.sweep_stale_temps();
    let state = Arc::new(load_state(&store));
    let persister = Arc::new(Persister::new(Arc::clone(&state), store));

    let network = NetworkContext::start()?;
    let relay = Arc::new(Relay::new(
        Arc::clone(&state),
        Arc::clone(&persister),
        Arc::clone(&messenger),
        network.bridge(),
        RelaySettings::from_config(&config),
    ));

    let shutdown = CancellationToken::new();
    let writer = network
        .handle()
        .spawn(Arc::clone(&persister).run(shutdown.clone()));
    let listener = spawn_listener_supervisor(
        network.handle(),
        messenger,
        relay.inbound_handler(),
        state,
        config.reliability.initial_backoff_secs,
        config.reliability.max_backoff_secs,
        shutdown.clone(),
    );

    tracing::info!("Relay started; data in {}", config.data_dir.display());

    let control_relay = Arc::clone(&relay);
    let outcome = std::thread::Builder::new()
        .name("dmrelay-control".into())
        .spawn(move || control(control_relay, config))
        .context("Failed to spawn control thread")?
        .join()
        .map_err(|_| anyhow::anyhow!("Control thread panicked"));

    shutdown.cancel();
    for (name, handle) in [("persistence writer", writer), ("listener", listener)] {
        if let Err(e) = network.handle().block_on(handle) {
            tracing::warn!("{name} task ended abnormally: {e}");
        }
    }
    if let Err(e) = relay.shutdown_flush() {
        tracing::error!("Final flush failed: {e:#}");
    }
    network.shutdown();
    tracing::info!("Relay stopped");

    outcome?
}

/// Keep the messenger's listener connected, restarting it with exponential
/// backoff whenever it ends, until `shutdown` fires.
fn spawn_listener_supervisor(
    handle: &Handle,
    messenger: Arc<dyn DirectMessenger>,
    handler: Arc<dyn InboundHandler>,
    state: Arc<SharedState>,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);
        let name = messenger.name().to_string();

        loop {
            let outcome = tokio::select! {
                () = shutdown.cancelled() => break,
                outcome = messenger.listen(Arc::clone(&handler)) => outcome,
            };
            match outcome {
                Ok(()) => tracing::warn!("Listener '{name}' exited unexpectedly"),
                Err(e) => tracing::error!("Listener '{name}' failed: {e:#}"),
            }

            state.set_status(format!("Disconnected; retrying in {backoff}s"));
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(backoff)) => {}
            }
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
        tracing::debug!("Listener supervisor for '{name}' stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{HistoryLimit, InboundMessage, MessengerError};
    use crate::relay::{CorrespondentId, MessageRecord};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Fails `listen` a fixed number of times, then delivers one message and
    /// stays connected.
    struct FlakyListener {
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl DirectMessenger for FlakyListener {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send_message(&self, _to: CorrespondentId, _text: &str) -> Result<(), MessengerError> {
            Ok(())
        }

        async fn fetch_history(
            &self,
            _with: CorrespondentId,
            _limit: HistoryLimit,
        ) -> Result<Vec<MessageRecord>, MessengerError> {
            Ok(Vec::new())
        }

        async fn list_open_direct_channels(&self) -> BTreeSet<CorrespondentId> {
            BTreeSet::new()
        }

        async fn listen(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("gateway closed");
            }
            handler.on_ready("flaky#0001");
            handler.on_inbound(InboundMessage {
                author_id: CorrespondentId(7),
                author_label: "seven".into(),
                text: "hello".into(),
                author_is_bot: false,
                from_self: false,
                direct: true,
            });
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn test_config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.config_path = tmp.path().join("config.toml");
        config.data_dir = tmp.path().join("data");
        config.reliability.initial_backoff_secs = 1;
        config.reliability.max_backoff_secs = 1;
        std::fs::create_dir_all(&config.data_dir).unwrap();
        config
    }

    #[test]
    fn listener_is_restarted_and_state_flushed_on_exit() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let data_dir = config.data_dir.clone();
        let orphan = data_dir.join(".conversations.json.tmp-dead");
        std::fs::write(&orphan, b"{").unwrap();
        let messenger = Arc::new(FlakyListener {
            failures_left: AtomicUsize::new(1),
            attempts: AtomicUsize::new(0),
        });

        let status = run_with(config, messenger.clone(), |relay, _config| {
            for _ in 0..300 {
                if relay.get_unread_count() > 0 {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            relay.drain();
            Ok(relay.get_status())
        })
        .unwrap();

        assert_eq!(status, "Connected as flaky#0001");
        assert_eq!(messenger.attempts.load(Ordering::SeqCst), 2);
        assert!(!orphan.exists());

        let restored = load_state(&DurableStore::new(&data_dir));
        assert_eq!(restored.get_log(CorrespondentId(7)), vec!["seven: hello"]);
    }

    #[test]
    fn missing_token_is_reported() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let err = run(config).unwrap_err();
        assert!(err.to_string().contains("No bot token"));
    }
}
