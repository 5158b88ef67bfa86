use crate::relay::types::{CorrespondentId, MessageRecord};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Failure reported by the messaging platform for one operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessengerError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("rate limited{}", retry_hint(.retry_after))]
    RateLimit { retry_after: Option<Duration> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {:.1}s)", d.as_secs_f64()))
        .unwrap_or_default()
}

impl MessengerError {
    /// Rate limits and transport failures may succeed on a later manual retry;
    /// auth, permission and not-found failures will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit { .. } | Self::Transport(_))
    }
}

/// How much history to fetch for one correspondent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryLimit {
    #[default]
    Unbounded,
    /// Only the most recent `n` messages.
    Latest(usize),
}

/// A message event as delivered by the platform, before relay filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub author_id: CorrespondentId,
    pub author_label: String,
    pub text: String,
    /// Author is a bot or system account.
    pub author_is_bot: bool,
    /// Author is this relay's own account.
    pub from_self: bool,
    /// Message arrived on a one-to-one channel.
    pub direct: bool,
}

/// Callbacks the platform listener drives on the network context.
///
/// Implementations must return promptly: the listener delivers events one
/// at a time and the next event waits for the previous callback.
pub trait InboundHandler: Send + Sync {
    fn on_ready(&self, self_label: &str);
    fn on_inbound(&self, message: InboundMessage);
}

/// The messaging platform as seen by the relay core.
///
/// Every method performs network I/O and must only be awaited on the
/// network context.
#[async_trait]
pub trait DirectMessenger: Send + Sync {
    /// Human-readable platform name
    fn name(&self) -> &str;

    /// Send `text` to `to` over a direct channel, opening one if needed.
    async fn send_message(&self, to: CorrespondentId, text: &str) -> Result<(), MessengerError>;

    /// History of the direct channel with `with`, oldest first.
    async fn fetch_history(
        &self,
        with: CorrespondentId,
        limit: HistoryLimit,
    ) -> Result<Vec<MessageRecord>, MessengerError>;

    /// Correspondents of the direct channels currently open on this session.
    async fn list_open_direct_channels(&self) -> BTreeSet<CorrespondentId>;

    /// Connect and deliver events to `handler` until the connection ends.
    async fn listen(&self, handler: Arc<dyn InboundHandler>) -> anyhow::Result<()>;
}
