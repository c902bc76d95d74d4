use std::sync::Arc;

use talksy_db::Database;

use crate::SyncConfig;
use crate::creation::ConversationCreator;
use crate::dispatcher::Dispatcher;
use crate::presence::PresenceTracker;

/// Shared services handed to every session and HTTP handler.
/// Sessions share nothing else; all cross-session state lives in the stores.
#[derive(Clone)]
pub struct Hub {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub creator: ConversationCreator,
    pub presence: PresenceTracker,
    pub config: SyncConfig,
}

impl Hub {
    pub fn new(db: Arc<Database>, config: SyncConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            creator: ConversationCreator::new(db.clone()),
            presence: PresenceTracker::new(db.clone(), config.online_window),
            db,
            config,
        }
    }
}
