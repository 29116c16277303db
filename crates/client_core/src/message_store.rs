use std::collections::HashSet;

use shared::domain::MessageId;
use tracing::debug;

use crate::types::{Message, MessageKey, ProvisionalId};

/// Ordered collection of the messages shown for one conversation.
///
/// Durable messages appear at most once: every durable id that has entered the
/// store is remembered in the seen set, so re-delivered poll results are ignored.
/// Ordering is arrival order; nothing is ever re-sorted.
#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    entries: Vec<Message>,
    seen: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends every durable message not seen before, in input order, and
    /// returns the ids that were actually added.
    pub fn merge<I>(&mut self, incoming: I) -> Vec<MessageId>
    where
        I: IntoIterator<Item = Message>,
    {
        let mut merged = Vec::new();
        for message in incoming {
            let Some(id) = message.durable_id() else {
                debug!(key = %message.key, "merge skipped provisional message");
                continue;
            };
            if self.seen.insert(id) {
                self.entries.push(message);
                merged.push(id);
            }
        }
        merged
    }

    pub fn insert_provisional(&mut self, message: Message) -> Option<ProvisionalId> {
        let id = message.provisional_id()?;
        if self.position(MessageKey::Provisional(id)).is_some() {
            return None;
        }
        self.entries.push(message);
        Some(id)
    }

    /// Drops the provisional entry and merges the durable one in its place.
    ///
    /// Returns `true` when the durable message was new to the store. When the
    /// durable id was already merged by a poll, only the provisional is removed.
    pub fn replace_provisional(&mut self, id: ProvisionalId, durable: Message) -> bool {
        self.remove_provisional(id);
        !self.merge([durable]).is_empty()
    }

    pub fn remove_provisional(&mut self, id: ProvisionalId) -> bool {
        match self.position(MessageKey::Provisional(id)) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains_durable(&self, id: MessageId) -> bool {
        self.seen.contains(&id)
    }

    pub fn get(&self, key: MessageKey) -> Option<&Message> {
        self.position(key).map(|index| &self.entries[index])
    }

    /// Snapshot in display order.
    pub fn all(&self) -> Vec<Message> {
        self.entries.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: MessageKey) -> Option<usize> {
        self.entries.iter().position(|message| message.key == key)
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
