use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tracing::{debug, error, info};
use uuid::Uuid;

use talksy_db::Database;
use talksy_types::models::PairKey;

use crate::SyncError;
use crate::store::blocking;

/// Outcome of a find-or-create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Creation {
    pub conversation_id: Uuid,
    /// False when an existing conversation was joined.
    pub created: bool,
}

/// Async mutexes keyed by pair. Entries live only while some caller holds
/// or waits on them, so unrelated pairs never contend.
#[derive(Default)]
struct PairLocks {
    entries: Mutex<HashMap<PairKey, Weak<tokio::sync::Mutex<()>>>>,
}

impl PairLocks {
    fn handle(&self, key: &PairKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(lock) = entries.get(key).and_then(Weak::upgrade) {
            return lock;
        }

        entries.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        entries.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }

    fn live(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Guarantees at most one conversation per unordered pair of users.
///
/// Callers for the same pair serialize on that pair's lock, and the store
/// re-checks the key mapping inside the creating transaction, so whoever
/// loses the race joins the winner's conversation. The store's unique key is
/// a second line: tripping it while holding the lock means the lock itself
/// is broken.
#[derive(Clone)]
pub struct ConversationCreator {
    db: Arc<Database>,
    locks: Arc<PairLocks>,
}

impl ConversationCreator {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            locks: Arc::new(PairLocks::default()),
        }
    }

    pub async fn find_or_create(&self, initiator: Uuid, peer: Uuid) -> Result<Creation, SyncError> {
        if initiator == peer {
            return Err(SyncError::InvalidInput(
                "cannot start a conversation with yourself".into(),
            ));
        }

        let key = PairKey::new(initiator, peer);
        let lock = self.locks.handle(&key);
        // Released on every exit path when the guard drops.
        let _guard = lock.lock().await;

        // Re-check and insert run as one store transaction, so a caller that
        // is cancelled after this point cannot leave the pair half-decided.
        let conversation_id = Uuid::new_v4();
        let insert_key = key.clone();
        let result = blocking(&self.db, move |db| {
            db.find_or_create_conversation(conversation_id, &insert_key, initiator, peer, Utc::now())
        })
        .await;

        match result {
            Ok((conversation_id, false)) => {
                debug!("pair {} joins existing conversation {}", key, conversation_id);
                Ok(Creation {
                    conversation_id,
                    created: false,
                })
            }
            Ok((conversation_id, true)) => {
                info!(
                    "conversation {} created for {} and {}",
                    conversation_id, initiator, peer
                );
                Ok(Creation {
                    conversation_id,
                    created: true,
                })
            }
            Err(SyncError::Conflict(msg)) => {
                error!("pair lock for {} did not exclude a concurrent create: {}", key, msg);
                Err(SyncError::Conflict(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Pair locks currently held or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks.live()
    }

    #[cfg(test)]
    async fn hold_pair(&self, a: Uuid, b: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        self.locks.handle(&PairKey::new(a, b)).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn setup(names: &[&str]) -> (Arc<Database>, ConversationCreator, Vec<Uuid>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ids = names
            .iter()
            .map(|name| {
                let id = Uuid::new_v4();
                db.create_user(id, name, "hash", Utc::now()).unwrap();
                id
            })
            .collect();
        let creator = ConversationCreator::new(db.clone());
        (db, creator, ids)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_from_both_sides_share_one_conversation() {
        let (db, creator, ids) = setup(&["alice", "bob"]);
        let (a, b) = (ids[0], ids[1]);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let creator = creator.clone();
            let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
            tasks.push(tokio::spawn(async move { creator.find_or_create(from, to).await }));
        }

        let mut ids_seen = HashSet::new();
        let mut created = 0;
        for task in tasks {
            let creation = task.await.unwrap().unwrap();
            ids_seen.insert(creation.conversation_id);
            if creation.created {
                created += 1;
            }
        }

        assert_eq!(ids_seen.len(), 1);
        assert_eq!(created, 1);

        let cid = *ids_seen.iter().next().unwrap();
        let rows = db.conversation_rows(cid).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(db.list_directory(a).unwrap().len(), 1);
        assert_eq!(db.list_directory(b).unwrap().len(), 1);
        assert_eq!(creator.active_locks(), 0);
    }

    #[tokio::test]
    async fn unrelated_pair_is_not_blocked() {
        let (_db, creator, ids) = setup(&["alice", "bob", "carol"]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);

        // a/b creation is "in flight" for as long as this guard lives
        let held = creator.hold_pair(a, b).await;

        let c_with_a = tokio::time::timeout(Duration::from_secs(2), creator.find_or_create(c, a))
            .await
            .expect("c/a creation blocked on the a/b lock")
            .unwrap();
        assert!(c_with_a.created);

        let blocked =
            tokio::time::timeout(Duration::from_millis(100), creator.find_or_create(b, a)).await;
        assert!(blocked.is_err(), "a/b creation must wait for its pair lock");

        drop(held);
        let a_with_b = creator.find_or_create(b, a).await.unwrap();
        assert!(a_with_b.created);
        assert_ne!(a_with_b.conversation_id, c_with_a.conversation_id);
    }

    /// Holds the store's connection for `hold`, returning once it is held.
    fn hold_store(db: &Arc<Database>, hold: Duration) -> std::thread::JoinHandle<()> {
        let db = db.clone();
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            db.with_conn(|_| {
                held_tx.send(()).unwrap();
                std::thread::sleep(hold);
                Ok(())
            })
            .unwrap();
        });
        held_rx.recv().unwrap();
        handle
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_creator_does_not_break_the_pair() {
        let (db, creator, ids) = setup(&["alice", "bob"]);
        let (a, b) = (ids[0], ids[1]);

        // The first caller gives up while its store work is still queued
        // behind the held connection, dropping its pair guard.
        let store = hold_store(&db, Duration::from_millis(300));
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), creator.find_or_create(a, b)).await;
        assert!(abandoned.is_err());

        let joined = creator.find_or_create(b, a).await.unwrap();
        store.join().unwrap();

        assert_eq!(db.list_directory(a).unwrap().len(), 1);
        assert_eq!(db.list_directory(b).unwrap().len(), 1);
        assert_eq!(
            db.find_conversation(&PairKey::new(a, b)).unwrap(),
            Some(joined.conversation_id)
        );
        assert_eq!(creator.active_locks(), 0);
    }

    #[tokio::test]
    async fn repeat_start_is_idempotent() {
        let (_db, creator, ids) = setup(&["alice", "bob"]);
        let first = creator.find_or_create(ids[0], ids[1]).await.unwrap();
        let second = creator.find_or_create(ids[1], ids[0]).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.conversation_id, second.conversation_id);
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let (_db, creator, ids) = setup(&["alice"]);
        assert!(matches!(
            creator.find_or_create(ids[0], ids[0]).await,
            Err(SyncError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn unknown_peer_releases_lock() {
        let (_db, creator, ids) = setup(&["alice"]);
        let ghost = Uuid::new_v4();
        assert!(matches!(
            creator.find_or_create(ids[0], ghost).await,
            Err(SyncError::NotFound("user"))
        ));
        assert_eq!(creator.active_locks(), 0);

        // A failed attempt leaves the pair usable.
        let again = tokio::time::timeout(Duration::from_secs(1), creator.find_or_create(ids[0], ghost)).await;
        assert!(matches!(again, Ok(Err(SyncError::NotFound("user")))));
    }
}
