use std::fmt;
use uuid::Uuid;

/// Identity of one pending entry in the delivery queue.
///
/// Used to find an entry again when its timeout fires, and to tag log lines.
/// It never leaves the process; the broker only ever sees the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new unique message ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_generate_unique() {
        // ---
        let id1 = MessageId::generate();
        let id2 = MessageId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_format() {
        // ---
        let id = MessageId::generate();
        assert_eq!(id.to_string().len(), 36); // Standard UUID format
    }
}
