//! Shared conversation state.
//!
//! One [`SharedState`] is shared by the network context (inbound relay) and
//! the control context (menu, sends, reloads). Every operation takes the
//! same lock, so readers never see a half-applied append and cross-log
//! operations such as a reload merge see a consistent snapshot.

use super::types::{ConversationMap, CorrespondentId, MessageRecord, QueuedMessage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Status shown until the network side reports readiness.
pub const DEFAULT_STATUS: &str = "Not connected";

struct Inner {
    conversations: ConversationMap,
    known: BTreeSet<CorrespondentId>,
    unread: usize,
    status: String,
    queue: VecDeque<QueuedMessage>,
    next_seq: u64,
    /// Inbound arrivals recorded while a reload is in flight.
    reload_watch: Option<Vec<QueuedMessage>>,
}

pub struct SharedState {
    inner: Mutex<Inner>,
}

/// One correspondent's fetched history, tagged with the arrival mark read
/// when the fetch returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedLog {
    pub who: CorrespondentId,
    pub lines: Vec<String>,
    /// Arrivals numbered at or above this came after the fetch and cannot
    /// be part of `lines`.
    pub completed_at: u64,
}

impl SharedState {
    pub fn new() -> Self {
        Self::from_snapshot(ConversationMap::new(), Vec::new())
    }

    /// Seed the state from persisted documents.
    ///
    /// Every correspondent with a log is added to the known set, so a
    /// correspondents document that lags the conversations document heals
    /// on load.
    pub fn from_snapshot(conversations: ConversationMap, known: Vec<CorrespondentId>) -> Self {
        let mut known: BTreeSet<CorrespondentId> = known.into_iter().collect();
        known.extend(conversations.keys().copied());
        Self {
            inner: Mutex::new(Inner {
                conversations,
                known,
                unread: 0,
                status: DEFAULT_STATUS.to_string(),
                queue: VecDeque::new(),
                next_seq: 0,
                reload_watch: None,
            }),
        }
    }

    /// Append one record to `who`'s log, creating the log on first use.
    pub fn append_message(&self, who: CorrespondentId, record: &MessageRecord) {
        let mut inner = self.inner.lock();
        inner.conversations.entry(who).or_default().push(record.line());
        inner.known.insert(who);
    }

    pub fn get_log(&self, who: CorrespondentId) -> Vec<String> {
        self.inner
            .lock()
            .conversations
            .get(&who)
            .cloned()
            .unwrap_or_default()
    }

    pub fn list_correspondents(&self) -> BTreeSet<CorrespondentId> {
        self.inner.lock().known.clone()
    }

    /// Message count per correspondent that has a log.
    pub fn conversation_counts(&self) -> BTreeMap<CorrespondentId, usize> {
        self.inner
            .lock()
            .conversations
            .iter()
            .map(|(who, lines)| (*who, lines.len()))
            .collect()
    }

    /// Adjust the unread counter by `delta`, flooring at zero.
    pub fn set_unread(&self, delta: i64) {
        let mut inner = self.inner.lock();
        inner.unread = apply_delta(inner.unread, delta);
    }

    pub fn get_unread(&self) -> usize {
        self.inner.lock().unread
    }

    pub fn set_status(&self, text: impl Into<String>) {
        self.inner.lock().status = text.into();
    }

    pub fn get_status(&self) -> String {
        self.inner.lock().status.clone()
    }

    /// Number of hand-off entries not yet drained.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Accept one inbound direct message in a single critical section:
    /// enqueue it, bump the unread counter, append it to the author's log
    /// and record the author as known. Returns the arrival number.
    pub fn accept_inbound(&self, author: CorrespondentId, record: MessageRecord) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        inner
            .conversations
            .entry(author)
            .or_default()
            .push(record.line());
        inner.known.insert(author);
        inner.unread += 1;

        let queued = QueuedMessage {
            seq,
            author,
            record,
        };
        if let Some(watch) = inner.reload_watch.as_mut() {
            watch.push(queued.clone());
        }
        inner.queue.push_back(queued);
        seq
    }

    /// Pop every queued entry. Each one decrements the unread counter (floor
    /// zero) and marks its author as known. The log is not touched: the
    /// append already happened when the message was accepted.
    pub fn drain_queue(&self) -> Vec<QueuedMessage> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::with_capacity(inner.queue.len());
        while let Some(entry) = inner.queue.pop_front() {
            inner.unread = inner.unread.saturating_sub(1);
            inner.known.insert(entry.author);
            drained.push(entry);
        }
        drained
    }

    pub fn snapshot_conversations(&self) -> ConversationMap {
        self.inner.lock().conversations.clone()
    }

    pub fn snapshot_known(&self) -> Vec<CorrespondentId> {
        self.inner.lock().known.iter().copied().collect()
    }

    /// Sequence number the next accepted arrival will get.
    pub fn arrival_mark(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Start recording inbound arrivals for a reload that is about to fan out.
    pub fn begin_reload_watch(&self) {
        self.inner.lock().reload_watch = Some(Vec::new());
    }

    /// Stop recording arrivals without merging anything.
    pub fn end_reload_watch(&self) {
        self.inner.lock().reload_watch = None;
    }

    /// Replace the logs of every correspondent in `fetched` with its fetched
    /// history, under one lock acquisition.
    ///
    /// Messages accepted since [`begin_reload_watch`](Self::begin_reload_watch)
    /// for a replaced correspondent are re-attached after the fetched history.
    /// Arrivals from before the fetch returned are dropped only when the
    /// fetched history already ends with them; later arrivals are always
    /// kept. Empty histories are skipped. Returns the correspondents whose
    /// logs were replaced.
    pub fn replace_logs(&self, fetched: Vec<FetchedLog>) -> Vec<CorrespondentId> {
        let mut inner = self.inner.lock();
        let arrivals = inner.reload_watch.take().unwrap_or_default();

        let mut updated = Vec::new();
        for FetchedLog {
            who,
            lines: mut history,
            completed_at,
        } in fetched
        {
            if history.is_empty() {
                continue;
            }
            let (overlapping, later): (Vec<&QueuedMessage>, Vec<&QueuedMessage>) = arrivals
                .iter()
                .filter(|entry| entry.author == who)
                .partition(|entry| entry.seq < completed_at);
            let overlapping: Vec<String> =
                overlapping.iter().map(|entry| entry.record.line()).collect();
            attach_unseen(&mut history, &overlapping);
            history.extend(later.iter().map(|entry| entry.record.line()));

            inner.conversations.insert(who, history);
            inner.known.insert(who);
            updated.push(who);
        }
        updated
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_delta(current: usize, delta: i64) -> usize {
    let magnitude = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);
    if delta >= 0 {
        current.saturating_add(magnitude)
    } else {
        current.saturating_sub(magnitude)
    }
}

/// Append the part of `pending` that `history` does not already end with.
fn attach_unseen(history: &mut Vec<String>, pending: &[String]) {
    let max = pending.len().min(history.len());
    let overlap = (0..=max)
        .rev()
        .find(|&n| history.ends_with(&pending[..n]))
        .unwrap_or(0);
    history.extend_from_slice(&pending[overlap..]);
}
