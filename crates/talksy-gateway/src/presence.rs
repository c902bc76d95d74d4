use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use talksy_db::Database;

use crate::SyncError;
use crate::store::blocking;

/// Online iff the last heartbeat is strictly younger than `window`.
/// Never having sent one means offline.
pub fn is_online_at(last_active: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    let Some(last_active) = last_active else {
        return false;
    };
    match (now - last_active).to_std() {
        Ok(elapsed) => elapsed < window,
        // Heartbeat stamped slightly in the future by a skewed clock
        Err(_) => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSample {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Liveness-window presence. Nothing is pushed; every read recomputes.
#[derive(Clone)]
pub struct PresenceTracker {
    db: Arc<Database>,
    window: Duration,
}

impl PresenceTracker {
    pub fn new(db: Arc<Database>, window: Duration) -> Self {
        Self { db, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Unconditionally stamps `last_active = now`.
    pub async fn heartbeat(&self, user_id: Uuid) -> Result<(), SyncError> {
        let now = Utc::now();
        blocking(&self.db, move |db| db.touch_last_active(user_id, now)).await?;
        debug!("heartbeat from {}", user_id);
        Ok(())
    }

    pub async fn sample(&self, user_id: Uuid) -> Result<PresenceSample, SyncError> {
        let last_seen = blocking(&self.db, move |db| db.last_active(user_id)).await?;
        Ok(PresenceSample {
            online: is_online_at(last_seen, Utc::now(), self.window),
            last_seen,
        })
    }

    pub async fn is_online(&self, user_id: Uuid) -> Result<bool, SyncError> {
        Ok(self.sample(user_id).await?.online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(70);

    #[test]
    fn online_strictly_inside_window() {
        let now = Utc::now();
        let at = |secs: i64| Some(now - chrono::Duration::seconds(secs));

        assert!(is_online_at(at(0), now, WINDOW));
        assert!(is_online_at(at(69), now, WINDOW));
        assert!(is_online_at(Some(now - chrono::Duration::milliseconds(69_999)), now, WINDOW));
        assert!(!is_online_at(at(70), now, WINDOW));
        assert!(!is_online_at(at(3600), now, WINDOW));
    }

    #[test]
    fn never_seen_is_offline() {
        assert!(!is_online_at(None, Utc::now(), WINDOW));
    }

    #[test]
    fn future_heartbeat_counts_as_online() {
        let now = Utc::now();
        assert!(is_online_at(Some(now + chrono::Duration::seconds(2)), now, WINDOW));
    }

    #[tokio::test]
    async fn heartbeat_brings_user_online() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = Uuid::new_v4();
        db.create_user(user, "alice", "hash", Utc::now()).unwrap();
        let tracker = PresenceTracker::new(db.clone(), WINDOW);

        assert!(!tracker.is_online(user).await.unwrap());
        tracker.heartbeat(user).await.unwrap();
        let sample = tracker.sample(user).await.unwrap();
        assert!(sample.online);
        assert!(sample.last_seen.is_some());
    }

    #[tokio::test]
    async fn stale_heartbeat_goes_offline() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = Uuid::new_v4();
        db.create_user(user, "alice", "hash", Utc::now()).unwrap();
        db.touch_last_active(user, Utc::now() - chrono::Duration::seconds(71)).unwrap();

        let tracker = PresenceTracker::new(db, WINDOW);
        assert!(!tracker.is_online(user).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let tracker = PresenceTracker::new(db, WINDOW);
        assert!(matches!(
            tracker.heartbeat(Uuid::new_v4()).await,
            Err(SyncError::NotFound("user"))
        ));
    }
}
