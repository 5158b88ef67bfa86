use super::persist::Persister;
use super::state::SharedState;
use super::types::MessageRecord;
use crate::channels::{InboundHandler, InboundMessage};
use std::sync::Arc;

/// Accepts platform events on the network context.
///
/// Every accepted message is queued, counted, appended and its author marked
/// known before the callback returns, so the listener's event order is the
/// log order. Persistence is only scheduled here, never performed.
pub struct InboundRelay {
    state: Arc<SharedState>,
    persister: Arc<Persister>,
}

impl InboundRelay {
    pub fn new(state: Arc<SharedState>, persister: Arc<Persister>) -> Self {
        Self { state, persister }
    }

    fn accepts(message: &InboundMessage) -> bool {
        message.direct && !message.author_is_bot && !message.from_self
    }
}

impl InboundHandler for InboundRelay {
    fn on_ready(&self, self_label: &str) {
        tracing::info!("Messenger ready as {self_label}");
        self.state.set_status(format!("Connected as {self_label}"));
    }

    fn on_inbound(&self, message: InboundMessage) {
        if !Self::accepts(&message) {
            tracing::debug!(
                "Ignoring message from {} (bot={}, self={}, direct={})",
                message.author_id,
                message.author_is_bot,
                message.from_self,
                message.direct
            );
            return;
        }

        let author = message.author_id;
        let seq = self.state.accept_inbound(
            author,
            MessageRecord::new(message.author_label, message.text),
        );
        tracing::debug!("Accepted inbound #{seq} from {author}");
        self.persister.schedule();
    }
}
