use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

/// Message content variants. Audio carries the backend media reference and
/// the recorded duration; before upload completes the reference is a local
/// file path, substituted once the remote reference is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
    Audio { media_ref: String, duration_ms: u32 },
}

/// Local-only delivery state of an outgoing message. Never serialized to the
/// backend; the wire only carries confirmed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

/// Normalize a participant pair so `(a, b)` and `(b, a)` resolve to the same
/// conversation record.
pub fn normalize_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_normalization_is_order_independent() {
        let (a, b) = (UserId(42), UserId(7));
        assert_eq!(normalize_pair(a, b), normalize_pair(b, a));
        assert_eq!(normalize_pair(a, b), (UserId(7), UserId(42)));
    }

    #[test]
    fn pair_normalization_keeps_self_pairs() {
        assert_eq!(normalize_pair(UserId(3), UserId(3)), (UserId(3), UserId(3)));
    }
}
