use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First 8 characters, used as a compact display identifier.
            pub fn short(&self) -> &str {
                match self.0.char_indices().nth(8) {
                    Some((i, _)) => &self.0[..i],
                    None => &self.0,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

opaque_id!(
    /// Identity of a conversation participant.
    UserId
);
opaque_id!(
    /// Identity of a single chat turn.  Unique and immutable once assigned.
    MessageId
);
opaque_id!(
    /// Identity of a topic node.  Assigned only when the topic is first created;
    /// the canonical name, not this id, is the dedup key.
    TopicId
);
opaque_id!(LinkId);

/// Who produced a chat turn.
///
/// | Sender  | Wire label | Effect on ingestion                              |
/// |---------|------------|--------------------------------------------------|
/// | `Human` | `"human"`  | bumps the owner's `last_active_at`               |
/// | `Ai`    | `"ai"`     | none beyond the message itself                   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Human,
    Ai,
}

impl Sender {
    pub fn label(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Ai => "ai",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub language: String,
    pub tone: String,
    /// How the assistant should address the user (e.g. "anh", "chị", "bạn").
    pub addressing: String,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            language: "vi".to_string(),
            tone: "friendly".to_string(),
            addressing: "bạn".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub preferences: UserPreferences,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Owning user.  Always `Some` in user-scoped deployments, `None` in the
    /// global-scope deployment.
    #[serde(default)]
    pub owner: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    pub sender: Sender,
    pub content: String,
    /// Empty when the embedding collaborator failed upstream.
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Canonical topic names, in normalizer order.
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Weighted, undirected `CONTEXTUAL_LINK` edge between two messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextualLink {
    pub id: LinkId,
    pub source: MessageId,
    pub target: MessageId,
    pub similarity: f64,
    pub timestamp: DateTime<Utc>,
}

impl ContextualLink {
    /// Canonical key for the unordered `{source, target}` pair.
    pub fn pair_key(&self) -> String {
        pair_key(&self.source, &self.target)
    }

    /// The endpoint opposite to `id`, or `None` if `id` is not an endpoint.
    pub fn other_end(&self, id: &MessageId) -> Option<&MessageId> {
        if &self.source == id {
            Some(&self.target)
        } else if &self.target == id {
            Some(&self.source)
        } else {
            None
        }
    }
}

/// Order-independent key for a message pair: the two ids sorted and joined.
pub fn pair_key(a: &MessageId, b: &MessageId) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

/// Truncate `s` to at most `max_chars` Unicode scalar values, returning a
/// sub-slice.  Used for log lines and CLI previews.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_serializes_as_its_label() {
        for sender in [Sender::Human, Sender::Ai] {
            let json = serde_json::to_string(&sender).unwrap();
            assert_eq!(json, format!("\"{}\"", sender.label()));
            assert_eq!(serde_json::from_str::<Sender>(&json).unwrap(), sender);
        }
    }

    #[test]
    fn pair_key_is_order_independent() {
        let a = MessageId::new("aaa");
        let b = MessageId::new("bbb");
        assert_eq!(pair_key(&a, &b), pair_key(&b, &a));
        assert_eq!(pair_key(&a, &b), "aaa|bbb");
    }

    #[test]
    fn other_end_resolves_both_directions() {
        let link = ContextualLink {
            id: LinkId::new("l1"),
            source: MessageId::new("m1"),
            target: MessageId::new("m2"),
            similarity: 0.9,
            timestamp: Utc::now(),
        };
        assert_eq!(link.other_end(&MessageId::new("m1")), Some(&MessageId::new("m2")));
        assert_eq!(link.other_end(&MessageId::new("m2")), Some(&MessageId::new("m1")));
        assert_eq!(link.other_end(&MessageId::new("m3")), None);
    }

    #[test]
    fn short_id_handles_short_input() {
        assert_eq!(MessageId::new("0123456789abcdef").short(), "01234567");
        assert_eq!(MessageId::new("abc").short(), "abc");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("Tôi muốn mua áo", 5), "Tôi m");
        assert_eq!(truncate_str("áo", 10), "áo");
    }
}
