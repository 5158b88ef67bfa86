use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Label recorded for messages the operator sends from the control side.
pub const OUTBOUND_LABEL: &str = "You";

/// Stable identifier of the remote party of a direct conversation.
///
/// Persisted as a JSON number in the correspondents document and as a string
/// key in the conversations document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrespondentId(pub u64);

impl fmt::Display for CorrespondentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrespondentId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl From<u64> for CorrespondentId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// One message in a conversation: who wrote it and what they wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub author_label: String,
    pub text: String,
}

impl MessageRecord {
    pub fn new(author_label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author_label: author_label.into(),
            text: text.into(),
        }
    }

    /// A record for text the operator sent.
    pub fn outbound(text: impl Into<String>) -> Self {
        Self::new(OUTBOUND_LABEL, text)
    }

    /// Stored form: `"<author_label>: <text>"`.
    pub fn line(&self) -> String {
        format!("{}: {}", self.author_label, self.text)
    }
}

impl fmt::Display for MessageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.author_label, self.text)
    }
}

/// An accepted inbound message waiting in the hand-off queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Monotonic arrival number assigned by the shared state.
    pub seq: u64,
    pub author: CorrespondentId,
    pub record: MessageRecord,
}

/// Conversation logs keyed by correspondent, oldest line first.
pub type ConversationMap = BTreeMap<CorrespondentId, Vec<String>>;
