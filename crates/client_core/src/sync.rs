use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{GroupId, MessageId, UserId},
    protocol::MessagePayload,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

use crate::{
    error::SyncError,
    message_store::MessageStore,
    optimistic::SendTracker,
    presence::{estimate_members, PresenceReport},
    transport::ChatApi,
    types::{Message, ProvisionalId},
    ClientEvent,
};

/// Highest `created_at` observed from the server. Never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCursor(Option<DateTime<Utc>>);

impl SyncCursor {
    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    pub fn advance(&mut self, to: DateTime<Utc>) -> bool {
        match self.0 {
            Some(current) if current >= to => false,
            _ => {
                self.0 = Some(to);
                true
            }
        }
    }
}

/// Everything the client knows about the conversation it is viewing.
#[derive(Debug)]
pub struct Conversation {
    pub group_id: GroupId,
    pub local_user: UserId,
    pub cursor: SyncCursor,
    pub store: MessageStore,
    pub tracker: SendTracker,
    pub presence: Option<PresenceReport>,
}

#[derive(Debug, Default)]
pub(crate) struct BatchOutcome {
    pub(crate) merged: Vec<Message>,
    pub(crate) adopted: Vec<(ProvisionalId, Message)>,
    pub(crate) unread: Vec<MessageId>,
}

impl Conversation {
    pub fn new(group_id: GroupId, local_user: UserId) -> Self {
        Self {
            group_id,
            local_user,
            cursor: SyncCursor::default(),
            store: MessageStore::new(),
            tracker: SendTracker::new(),
            presence: None,
        }
    }

    /// Merges one poll result: echoes of our own pending sends resolve them,
    /// everything else goes through the store's dedup.
    pub(crate) fn apply_batch(&mut self, batch: Vec<MessagePayload>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let newest = batch.iter().map(|payload| payload.created_at).max();

        for payload in batch {
            let message = Message::from(payload);
            let Some(id) = message.durable_id() else {
                continue;
            };
            if self.store.contains_durable(id) {
                continue;
            }
            if message.author.user_id == self.local_user {
                if let Some(provisional) = self.tracker.adopt_echo(&mut self.store, &message) {
                    outcome.adopted.push((provisional, message));
                    continue;
                }
            } else {
                outcome.unread.push(id);
            }
            self.store.merge([message.clone()]);
            outcome.merged.push(message);
        }

        if let Some(newest) = newest {
            self.cursor.advance(newest);
        }
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    FetchMessages,
    MarkRead,
    Presence,
    Heartbeat,
}

impl SyncStep {
    pub fn label(self) -> &'static str {
        match self {
            SyncStep::FetchMessages => "fetch messages",
            SyncStep::MarkRead => "mark read",
            SyncStep::Presence => "refresh presence",
            SyncStep::Heartbeat => "heartbeat",
        }
    }
}

/// What a single tick did. Failures are recorded per step; none of them stop the tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub stale: bool,
    pub merged: Vec<MessageId>,
    pub adopted: Vec<ProvisionalId>,
    pub marked_read: Vec<MessageId>,
    pub presence: Option<PresenceReport>,
    pub failures: Vec<(SyncStep, SyncError)>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub presence_window: chrono::Duration,
}

/// Periodic driver for one conversation.
///
/// Each tick runs as its own task, so a slow request never delays the next
/// poll. Ticks carry the generation they were started under; once the
/// generation moves on, their results are dropped instead of applied.
pub struct SyncScheduler {
    api: Arc<dyn ChatApi>,
    conversation: Arc<Mutex<Conversation>>,
    generation: Arc<AtomicU64>,
    events: broadcast::Sender<ClientEvent>,
    config: SyncConfig,
}

impl SyncScheduler {
    pub fn new(
        api: Arc<dyn ChatApi>,
        conversation: Arc<Mutex<Conversation>>,
        generation: Arc<AtomicU64>,
        events: broadcast::Sender<ClientEvent>,
        config: SyncConfig,
    ) -> Self {
        Self {
            api,
            conversation,
            generation,
            events,
            config,
        }
    }

    /// Starts a new generation and polls until it is superseded or cancelled.
    /// The first tick fires immediately, which doubles as the initial load.
    pub fn start(self: Arc<Self>) -> SyncHandle {
        let epoch = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let scheduler = Arc::clone(&self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !scheduler.is_current(epoch) {
                    debug!(epoch, "sync loop superseded");
                    break;
                }
                let tick_scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    tick_scheduler.tick(epoch).await;
                });
            }
        });
        SyncHandle {
            epoch,
            generation: Arc::clone(&self.generation),
            scheduler: self,
            task,
        }
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == epoch
    }

    pub async fn tick(&self, epoch: u64) -> TickReport {
        let mut report = TickReport::default();
        if !self.is_current(epoch) {
            report.stale = true;
            return report;
        }

        let (group_id, local_user, since) = {
            let conversation = self.conversation.lock().await;
            (
                conversation.group_id,
                conversation.local_user,
                conversation.cursor.get(),
            )
        };

        match self.api.fetch_messages(group_id, since).await {
            Ok(batch) => {
                let outcome = {
                    let mut conversation = self.conversation.lock().await;
                    if !self.is_current(epoch) {
                        report.stale = true;
                        return report;
                    }
                    conversation.apply_batch(batch)
                };
                self.publish_batch(group_id, &outcome, &mut report);

                if !outcome.unread.is_empty() {
                    match self.api.mark_read(group_id, &outcome.unread).await {
                        Ok(()) => report.marked_read = outcome.unread,
                        Err(err) => {
                            self.record_failure(&mut report, group_id, SyncStep::MarkRead, err)
                        }
                    }
                }
            }
            Err(err) => {
                self.record_failure(&mut report, group_id, SyncStep::FetchMessages, err)
            }
        }

        match self.api.list_members(group_id).await {
            Ok(members) => {
                let presence =
                    estimate_members(&members, Utc::now(), self.config.presence_window);
                {
                    let mut conversation = self.conversation.lock().await;
                    if !self.is_current(epoch) {
                        report.stale = true;
                        return report;
                    }
                    conversation.presence = Some(presence.clone());
                }
                let _ = self
                    .events
                    .send(ClientEvent::PresenceUpdated(presence.clone()));
                report.presence = Some(presence);
            }
            Err(err) => self.record_failure(&mut report, group_id, SyncStep::Presence, err),
        }

        if let Err(err) = self.api.heartbeat(local_user).await {
            self.record_failure(&mut report, group_id, SyncStep::Heartbeat, err);
        }

        report
    }

    fn record_failure(
        &self,
        report: &mut TickReport,
        group_id: GroupId,
        step: SyncStep,
        err: SyncError,
    ) {
        warn!(
            %group_id,
            step = step.label(),
            transient = err.is_transient(),
            error = %err,
            "sync step failed"
        );
        let _ = self
            .events
            .send(ClientEvent::Error(format!("{}: {err}", step.label())));
        report.failures.push((step, err));
    }

    fn publish_batch(&self, group_id: GroupId, outcome: &BatchOutcome, report: &mut TickReport) {
        for (provisional_id, message) in &outcome.adopted {
            if let Some(id) = message.durable_id() {
                report.merged.push(id);
            }
            report.adopted.push(*provisional_id);
            let _ = self.events.send(ClientEvent::SendConfirmed {
                provisional_id: *provisional_id,
                message: message.clone(),
            });
        }
        report
            .merged
            .extend(outcome.merged.iter().filter_map(Message::durable_id));
        if !outcome.merged.is_empty() {
            let _ = self.events.send(ClientEvent::MessagesMerged {
                group_id,
                messages: outcome.merged.clone(),
            });
        }
    }
}

/// Keeps a sync loop alive. Cancelling (or dropping) it retires the
/// generation so in-flight ticks cannot touch state afterwards.
pub struct SyncHandle {
    epoch: u64,
    generation: Arc<AtomicU64>,
    scheduler: Arc<SyncScheduler>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_active(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.epoch && !self.task.is_finished()
    }

    /// Scheduler driving this loop; pair it with `epoch()` to run a tick by hand.
    pub fn scheduler(&self) -> Arc<SyncScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn cancel(&self) {
        // Only retire our own generation; a newer loop may already own the counter.
        let _ = self.generation.compare_exchange(
            self.epoch,
            self.epoch + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.task.abort();
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
