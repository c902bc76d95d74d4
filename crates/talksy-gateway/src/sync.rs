use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, timeout};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use talksy_types::events::{GatewayCommand, GatewayEvent};
use talksy_types::models::{DirectoryRow, MessageBody, sort_directory};

use crate::dispatcher::{ChangeEvent, ConversationSubscription};
use crate::messaging::{deliver, participant_row};
use crate::presence::PresenceSample;
use crate::store::blocking;
use crate::{Hub, SyncError};

struct OpenConversation {
    conversation_id: Uuid,
    peer_user_id: Uuid,
    subscription: ConversationSubscription,
}

/// What the client was last shown for its open conversation. The message
/// log is append-only, so the newest seq plus the count identify a view.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MessageCursor {
    conversation_id: Uuid,
    last_seq: Option<i64>,
    count: usize,
}

enum Step {
    Command(Option<GatewayCommand>),
    Heartbeat,
    Reconcile,
    Change(Option<ChangeEvent>),
}

/// One connected client's view of the world.
///
/// Every update source (push notification, reconciliation tick, the
/// session's own writes) triggers a full re-read of the affected view, which
/// replaces the previous one wholesale. A snapshot is only forwarded when it
/// differs from the last one sent, so overlapping sources never show the
/// client the same update twice.
pub struct SyncSession {
    hub: Hub,
    user_id: Uuid,
    open: Option<OpenConversation>,
    last_directory_snapshot: Option<Vec<DirectoryRow>>,
    last_message_seen_cursor: Option<MessageCursor>,
    last_peer_presence: Option<PresenceSample>,
    transient_failures: u32,
    outbox: mpsc::UnboundedSender<GatewayEvent>,
}

impl SyncSession {
    pub fn new(hub: Hub, user_id: Uuid, outbox: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self {
            hub,
            user_id,
            open: None,
            last_directory_snapshot: None,
            last_message_seen_cursor: None,
            last_peer_presence: None,
            transient_failures: 0,
            outbox,
        }
    }

    pub fn open_conversation_id(&self) -> Option<Uuid> {
        self.open.as_ref().map(|o| o.conversation_id)
    }

    /// Drive the session until the command channel closes. Heartbeats and
    /// reconciliation run on their own timers; a slow tick delays the next
    /// one rather than queuing extra work.
    pub async fn run(
        mut self,
        initial_conversation: Option<Uuid>,
        mut commands: mpsc::Receiver<GatewayCommand>,
    ) {
        info!("sync session started for {}", self.user_id);
        self.start(initial_conversation).await;

        let config = self.hub.config.clone();
        let mut heartbeat = interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile = interval_at(
            Instant::now() + config.reconcile_interval,
            config.reconcile_interval,
        );
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                cmd = commands.recv() => Step::Command(cmd),
                _ = heartbeat.tick() => Step::Heartbeat,
                _ = reconcile.tick() => Step::Reconcile,
                change = next_change(&mut self.open) => Step::Change(change),
            };

            match step {
                Step::Command(Some(cmd)) => self.handle_command(cmd).await,
                Step::Command(None) => break,
                Step::Heartbeat => self.heartbeat().await,
                Step::Reconcile => self.reconcile().await,
                Step::Change(Some(event)) => self.on_change(event).await,
                Step::Change(None) => self.resubscribe(),
            }
        }

        info!("sync session closed for {}", self.user_id);
    }

    /// Initial pulls: the directory, then the open conversation if any.
    pub async fn start(&mut self, initial_conversation: Option<Uuid>) {
        if let Err(e) = self.refresh_directory().await {
            self.report("initial directory pull", e);
        }
        if let Some(conversation_id) = initial_conversation {
            if let Err(e) = self.open_conversation(conversation_id).await {
                self.report("open conversation", e);
            }
        }
    }

    pub async fn handle_command(&mut self, cmd: GatewayCommand) {
        let result = match cmd {
            GatewayCommand::OpenConversation { conversation_id } => {
                self.open_conversation(conversation_id).await
            }
            GatewayCommand::StartConversation { peer_user_id } => {
                self.start_conversation(peer_user_id).await
            }
            GatewayCommand::SendMessage { body } => self.send_message(body).await,
        };
        if let Err(e) = result {
            self.report("command", e);
        }
    }

    /// Failures are logged and left to the next tick.
    pub async fn heartbeat(&mut self) {
        if let Err(e) = self.hub.presence.heartbeat(self.user_id).await {
            warn!("heartbeat for {} failed: {}", self.user_id, e);
        }
    }

    pub async fn reconcile(&mut self) {
        trace!("reconcile tick for {}", self.user_id);
        if let Err(e) = self.refresh_directory().await {
            self.report("directory pull", e);
        }
        if let Err(e) = self.refresh_presence().await {
            self.report("presence pull", e);
        }
    }

    /// Push path. Only the open conversation matters; anything else is
    /// covered by the directory pull.
    pub async fn on_change(&mut self, event: ChangeEvent) {
        if self.open_conversation_id() != Some(event.conversation_id) {
            return;
        }
        if let (Some(seq), Some(cursor)) = (event.seq, &self.last_message_seen_cursor) {
            if cursor.conversation_id == event.conversation_id
                && cursor.last_seq.is_some_and(|shown| shown >= seq)
            {
                trace!("change {} on {} already shown", seq, event.conversation_id);
                return;
            }
        }
        if let Err(e) = self.refresh_messages().await {
            self.report("message pull", e);
        }
    }

    /// Marks the conversation seen, moves the push subscription to it and
    /// pulls its history.
    pub async fn open_conversation(&mut self, conversation_id: Uuid) -> Result<(), SyncError> {
        let row = participant_row(&self.hub, self.user_id, conversation_id).await?;

        // Subscribe before pulling so no append can fall between the two.
        let subscription = self.hub.dispatcher.subscribe(conversation_id);

        let user_id = self.user_id;
        blocking(&self.hub.db, move |db| db.mark_seen(user_id, conversation_id)).await?;

        // Replacing the previous entry drops, and so releases, its subscription.
        self.open = Some(OpenConversation {
            conversation_id,
            peer_user_id: row.peer_user_id,
            subscription,
        });
        self.last_message_seen_cursor = None;
        self.last_peer_presence = None;
        debug!("{} opened conversation {}", self.user_id, conversation_id);

        self.emit(GatewayEvent::ConversationOpened {
            conversation_id,
            peer_user_id: row.peer_user_id,
        });

        self.refresh_messages().await?;
        self.refresh_directory().await?;
        self.refresh_presence().await
    }

    pub async fn start_conversation(&mut self, peer_user_id: Uuid) -> Result<(), SyncError> {
        let creation = self
            .hub
            .creator
            .find_or_create(self.user_id, peer_user_id)
            .await?;
        self.open_conversation(creation.conversation_id).await
    }

    /// Sends to the open conversation. Once the append succeeds the send
    /// counts as done; refresh failures after it are reported separately.
    pub async fn send_message(&mut self, body: MessageBody) -> Result<(), SyncError> {
        let conversation_id = self
            .open_conversation_id()
            .ok_or_else(|| SyncError::InvalidInput("no conversation is open".into()))?;

        deliver(&self.hub, self.user_id, conversation_id, body).await?;

        if let Err(e) = self.refresh_messages().await {
            self.report("message pull", e);
        }
        if let Err(e) = self.refresh_directory().await {
            self.report("directory pull", e);
        }
        Ok(())
    }

    async fn refresh_directory(&mut self) -> Result<(), SyncError> {
        let user_id = self.user_id;
        let mut rows = self.pull(move |db| db.list_directory(user_id)).await?;
        sort_directory(&mut rows);

        if self.last_directory_snapshot.as_ref() == Some(&rows) {
            return Ok(());
        }
        self.last_directory_snapshot = Some(rows.clone());
        self.emit(GatewayEvent::DirectorySnapshot { rows });
        Ok(())
    }

    async fn refresh_messages(&mut self) -> Result<(), SyncError> {
        let Some(conversation_id) = self.open_conversation_id() else {
            return Ok(());
        };
        let messages = self.pull(move |db| db.list_messages(conversation_id)).await?;

        let cursor = MessageCursor {
            conversation_id,
            last_seq: messages.last().map(|m| m.seq),
            count: messages.len(),
        };
        if self.last_message_seen_cursor.as_ref() == Some(&cursor) {
            return Ok(());
        }
        self.last_message_seen_cursor = Some(cursor);
        self.emit(GatewayEvent::MessagesSnapshot {
            conversation_id,
            messages,
        });
        Ok(())
    }

    async fn refresh_presence(&mut self) -> Result<(), SyncError> {
        let Some(peer) = self.open.as_ref().map(|o| o.peer_user_id) else {
            return Ok(());
        };
        let sample = timeout(self.hub.config.pull_timeout, self.hub.presence.sample(peer))
            .await
            .map_err(|_| SyncError::Transient("presence pull timed out".into()))??;

        if self.last_peer_presence == Some(sample) {
            return Ok(());
        }
        self.last_peer_presence = Some(sample);
        self.emit(GatewayEvent::PresenceSnapshot {
            user_id: peer,
            online: sample.online,
            last_seen: sample.last_seen,
        });
        Ok(())
    }

    /// Store read bounded by `pull_timeout`. An abandoned pull is not retried
    /// here; the next scheduled tick or notification tries again.
    async fn pull<F, T>(&mut self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&talksy_db::Database) -> talksy_db::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let result = timeout(self.hub.config.pull_timeout, blocking(&self.hub.db, f))
            .await
            .map_err(|_| SyncError::Transient("pull timed out".into()))?;
        if result.is_ok() {
            self.transient_failures = 0;
        }
        result
    }

    fn resubscribe(&mut self) {
        let dispatcher = &self.hub.dispatcher;
        if let Some(open) = self.open.as_mut() {
            warn!("change feed for {} closed, resubscribing", open.conversation_id);
            open.subscription = dispatcher.subscribe(open.conversation_id);
        }
    }

    /// Decides between retry-later and telling the client. Never touches
    /// view state.
    fn report(&mut self, context: &str, err: SyncError) {
        match &err {
            SyncError::Transient(_) => {
                self.transient_failures += 1;
                warn!(
                    "{} for {} failed ({} in a row): {}",
                    context, self.user_id, self.transient_failures, err
                );
                if self.transient_failures == self.hub.config.transient_budget {
                    self.emit(GatewayEvent::Error {
                        message: "Sync is delayed, retrying in the background".into(),
                    });
                }
            }
            SyncError::Conflict(_) | SyncError::Internal(_) => {
                error!("{} for {} failed: {}", context, self.user_id, err);
                self.emit(GatewayEvent::Error {
                    message: "Something went wrong, please try again".into(),
                });
            }
            SyncError::NotFound(_) | SyncError::Unauthorized | SyncError::InvalidInput(_) => {
                debug!("{} for {} rejected: {}", context, self.user_id, err);
                self.emit(GatewayEvent::Error {
                    message: err.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: GatewayEvent) {
        // A closed outbox means the connection is going away; the run loop
        // ends when its command channel closes.
        let _ = self.outbox.send(event);
    }
}

async fn next_change(open: &mut Option<OpenConversation>) -> Option<ChangeEvent> {
    match open {
        Some(open) => open.subscription.recv().await,
        None => std::future::pending().await,
    }
}
