use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{DeliveryStatus, GroupId, MessageId};
use tracing::{debug, warn};

use crate::{
    message_store::MessageStore,
    types::{Author, Message, MessageKey, ProvisionalId},
};

/// What the user typed, before it has an identity.
#[derive(Debug, Clone)]
pub struct Draft {
    pub group_id: GroupId,
    pub author: Author,
    pub text: String,
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
    Pending { submitted_at: DateTime<Utc> },
    Resolved(MessageId),
    Discarded,
}

/// Result of asking the tracker to move a send forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Id was never issued by this tracker.
    Unknown,
    /// Send already reached a terminal state.
    AlreadySettled,
}

#[derive(Debug, Clone)]
struct PendingSend {
    state: SendState,
    text: String,
    author: Author,
    is_anonymous: bool,
}

/// Drives each send through `Pending -> Resolved | Discarded`, keeping the
/// message store in step with every transition.
#[derive(Debug, Default)]
pub struct SendTracker {
    last_issued: u64,
    sends: HashMap<ProvisionalId, PendingSend>,
}

impl SendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh provisional id and puts a pending copy of the draft in the store.
    pub fn begin(
        &mut self,
        store: &mut MessageStore,
        draft: Draft,
        now: DateTime<Utc>,
    ) -> ProvisionalId {
        self.last_issued += 1;
        let id = ProvisionalId(self.last_issued);
        store.insert_provisional(Message {
            key: MessageKey::Provisional(id),
            group_id: draft.group_id,
            author: draft.author.clone(),
            text: draft.text.clone(),
            is_anonymous: draft.is_anonymous,
            status: DeliveryStatus::Pending,
            created_at: now,
        });
        self.sends.insert(
            id,
            PendingSend {
                state: SendState::Pending { submitted_at: now },
                text: draft.text,
                author: draft.author,
                is_anonymous: draft.is_anonymous,
            },
        );
        id
    }

    pub fn resolve(
        &mut self,
        store: &mut MessageStore,
        id: ProvisionalId,
        durable: Message,
    ) -> Transition {
        let Some(durable_id) = durable.durable_id() else {
            warn!(%id, "resolve called without a durable message");
            return Transition::Unknown;
        };
        let transition = self.settle(id, SendState::Resolved(durable_id));
        if transition == Transition::Applied {
            store.replace_provisional(id, durable);
        }
        transition
    }

    pub fn discard(&mut self, store: &mut MessageStore, id: ProvisionalId) -> Transition {
        let transition = self.settle(id, SendState::Discarded);
        if transition == Transition::Applied {
            store.remove_provisional(id);
        }
        transition
    }

    /// Resolves the oldest pending send that this durable message echoes.
    ///
    /// A poll can return our own message before the POST response arrives; the
    /// echo matches on author, text and anonymity.
    pub fn adopt_echo(
        &mut self,
        store: &mut MessageStore,
        durable: &Message,
    ) -> Option<ProvisionalId> {
        let id = self
            .sends
            .iter()
            .filter(|(_, send)| {
                matches!(send.state, SendState::Pending { .. })
                    && send.author.user_id == durable.author.user_id
                    && send.text == durable.text
                    && send.is_anonymous == durable.is_anonymous
            })
            .min_by_key(|(id, _)| **id)
            .map(|(id, _)| *id)?;
        match self.resolve(store, id, durable.clone()) {
            Transition::Applied => Some(id),
            _ => None,
        }
    }

    pub fn state(&self, id: ProvisionalId) -> Option<&SendState> {
        self.sends.get(&id).map(|send| &send.state)
    }

    pub fn pending_count(&self) -> usize {
        self.sends
            .values()
            .filter(|send| matches!(send.state, SendState::Pending { .. }))
            .count()
    }

    fn settle(&mut self, id: ProvisionalId, next: SendState) -> Transition {
        let Some(send) = self.sends.get_mut(&id) else {
            warn!(%id, "ignoring transition for unknown provisional id");
            return Transition::Unknown;
        };
        if !matches!(send.state, SendState::Pending { .. }) {
            debug!(%id, state = ?send.state, "ignoring transition for settled send");
            return Transition::AlreadySettled;
        }
        send.state = next;
        Transition::Applied
    }
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
