use std::{
    sync::{atomic::AtomicU64, Arc},
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{GroupId, DEFAULT_GROUP_ID},
    protocol::{SendMessageRequest, UserProfile},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

pub mod error;
pub mod message_store;
pub mod optimistic;
pub mod presence;
pub mod sync;
pub mod transport;
pub mod types;

pub use error::{ClientError, SyncError};
pub use message_store::MessageStore;
pub use optimistic::{Draft, SendState, SendTracker, Transition};
pub use presence::{Presence, PresenceReport};
pub use sync::{Conversation, SyncConfig, SyncCursor, SyncHandle, SyncScheduler, TickReport};
pub use transport::{ChatApi, HttpChatApi};
pub use types::{Author, Message, MessageKey, ProvisionalId};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub group_id: GroupId,
    pub poll_interval: Duration,
    pub presence_window: chrono::Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            group_id: DEFAULT_GROUP_ID,
            poll_interval: Duration::from_secs(3),
            presence_window: presence::default_window(),
        }
    }
}

/// Who is logged in and which group they are looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user: UserProfile,
    pub token: String,
    pub group_id: GroupId,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    LoggedIn(SessionContext),
    LoggedOut,
    /// Durable messages appended to the store by a poll.
    MessagesMerged {
        group_id: GroupId,
        messages: Vec<Message>,
    },
    SendPending(Message),
    SendConfirmed {
        provisional_id: ProvisionalId,
        message: Message,
    },
    SendFailed {
        provisional_id: ProvisionalId,
        error: String,
    },
    PresenceUpdated(PresenceReport),
    Error(String),
}

struct ActiveSession {
    context: SessionContext,
    conversation: Arc<Mutex<Conversation>>,
    sync: SyncHandle,
}

/// Client facade: owns the session, the conversation state and its sync loop.
pub struct ChatClient {
    api: Arc<dyn ChatApi>,
    config: ClientConfig,
    generation: Arc<AtomicU64>,
    session: Mutex<Option<ActiveSession>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(api: Arc<dyn ChatApi>, config: ClientConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            api,
            config,
            generation: Arc::new(AtomicU64::new(0)),
            session: Mutex::new(None),
            events,
        })
    }

    pub fn connect(server_url: &str, config: ClientConfig) -> anyhow::Result<Arc<Self>> {
        let api = HttpChatApi::new(server_url)?;
        info!(api_base = %api.api_base(), "using chat server");
        Ok(Self::new(Arc::new(api), config))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Logs in by name and starts syncing the configured group.
    pub async fn login(&self, name: &str) -> Result<SessionContext, ClientError> {
        let response = self.api.login(name).await?;
        info!(user_id = %response.user.id, name = %response.user.name, "logged in");
        let context = SessionContext {
            user: response.user,
            token: response.token,
            group_id: self.config.group_id,
        };
        self.activate(context.clone()).await;
        let _ = self.events.send(ClientEvent::LoggedIn(context.clone()));
        Ok(context)
    }

    pub async fn logout(&self) {
        let previous = self.session.lock().await.take();
        if let Some(session) = previous {
            session.sync.cancel();
            let unsent = session.conversation.lock().await.tracker.pending_count();
            if unsent > 0 {
                warn!(unsent, "logging out with sends still awaiting the server");
            }
            info!(user_id = %session.context.user.id, "logged out");
        }
        self.api.clear_session();
        let _ = self.events.send(ClientEvent::LoggedOut);
    }

    /// Moves the session to another group with a fresh store and cursor.
    pub async fn switch_group(&self, group_id: GroupId) -> Result<(), ClientError> {
        let current = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.context.clone())
            .ok_or(ClientError::NotLoggedIn)?;
        if current.group_id == group_id {
            return Ok(());
        }
        info!(from = %current.group_id, to = %group_id, "switching group");
        self.activate(SessionContext {
            group_id,
            ..current
        })
        .await;
        Ok(())
    }

    /// Shows the message immediately, then confirms or withdraws it once the
    /// server answers.
    pub async fn send(&self, text: &str, is_anonymous: bool) -> Result<Message, ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let (context, conversation) = {
            let session = self.session.lock().await;
            let session = session.as_ref().ok_or(ClientError::NotLoggedIn)?;
            (session.context.clone(), Arc::clone(&session.conversation))
        };

        let (provisional_id, pending) = {
            let mut guard = conversation.lock().await;
            let state = &mut *guard;
            let id = state.tracker.begin(
                &mut state.store,
                Draft {
                    group_id: context.group_id,
                    author: Author::from(&context.user),
                    text: text.to_string(),
                    is_anonymous,
                },
                Utc::now(),
            );
            (id, state.store.get(MessageKey::Provisional(id)).cloned())
        };
        if let Some(pending) = pending {
            let _ = self.events.send(ClientEvent::SendPending(pending));
        }

        let request = SendMessageRequest {
            text: text.to_string(),
            is_anonymous,
            user_id: Some(context.user.id),
            temp_id: Some(provisional_id.to_string()),
        };
        match self.api.send_message(context.group_id, request).await {
            Ok(response) => {
                let echoed = response.temp_id.as_deref().map(str::parse::<ProvisionalId>);
                if !matches!(echoed, Some(Ok(id)) if id == provisional_id) {
                    warn!(
                        %provisional_id,
                        echoed = ?response.temp_id,
                        "send response carried unexpected tempId"
                    );
                }
                let message = Message::from(response.message);
                let transition = {
                    let mut guard = conversation.lock().await;
                    let state = &mut *guard;
                    let transition =
                        state
                            .tracker
                            .resolve(&mut state.store, provisional_id, message.clone());
                    if transition != Transition::Applied {
                        // Echo adoption can pair text-identical sends out of order.
                        state.store.merge([message.clone()]);
                    }
                    transition
                };
                // A poll may already have adopted the echo and announced it.
                if transition == Transition::Applied {
                    let _ = self.events.send(ClientEvent::SendConfirmed {
                        provisional_id,
                        message: message.clone(),
                    });
                }
                Ok(message)
            }
            Err(err) => {
                warn!(%provisional_id, error = %err, "send failed; withdrawing message");
                {
                    let mut guard = conversation.lock().await;
                    let state = &mut *guard;
                    state.tracker.discard(&mut state.store, provisional_id);
                }
                let _ = self.events.send(ClientEvent::SendFailed {
                    provisional_id,
                    error: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    /// Ordered snapshot of the current conversation, pending sends included.
    pub async fn messages(&self) -> Vec<Message> {
        let Some(conversation) = self.conversation().await else {
            return Vec::new();
        };
        let messages = conversation.lock().await.store.all();
        messages
    }

    pub async fn presence(&self) -> Option<PresenceReport> {
        let conversation = self.conversation().await?;
        let presence = conversation.lock().await.presence.clone();
        presence
    }

    pub async fn session(&self) -> Option<SessionContext> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.context.clone())
    }

    /// Runs one sync tick immediately instead of waiting for the timer.
    pub async fn sync_now(&self) -> Result<TickReport, ClientError> {
        let (scheduler, epoch) = {
            let session = self.session.lock().await;
            let session = session.as_ref().ok_or(ClientError::NotLoggedIn)?;
            (session.sync.scheduler(), session.sync.epoch())
        };
        Ok(scheduler.tick(epoch).await)
    }

    async fn conversation(&self) -> Option<Arc<Mutex<Conversation>>> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| Arc::clone(&session.conversation))
    }

    async fn activate(&self, context: SessionContext) {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            previous.sync.cancel();
        }
        let conversation = Arc::new(Mutex::new(Conversation::new(
            context.group_id,
            context.user.id,
        )));
        let scheduler = Arc::new(SyncScheduler::new(
            Arc::clone(&self.api),
            Arc::clone(&conversation),
            Arc::clone(&self.generation),
            self.events.clone(),
            SyncConfig {
                poll_interval: self.config.poll_interval.max(MIN_POLL_INTERVAL),
                presence_window: self.config.presence_window,
            },
        ));
        let sync = scheduler.start();
        *session = Some(ActiveSession {
            context,
            conversation,
            sync,
        });
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
