use super::persist::Persister;
use super::state::SharedState;

/// Reconcile the hand-off queue with the control side's view.
///
/// Pops every queued arrival, settling the unread counter and the known set
/// for each. Logs are left alone since the inbound path already appended.
/// Safe to call at any time; returns how many entries were drained.
pub fn drain_queue(state: &SharedState, persister: &Persister) -> usize {
    let drained = state.drain_queue();
    if drained.is_empty() {
        return 0;
    }
    tracing::debug!("Drained {} queued arrivals", drained.len());
    persister.schedule();
    drained.len()
}
