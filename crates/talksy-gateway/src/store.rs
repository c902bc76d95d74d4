use std::sync::Arc;

use talksy_db::Database;

use crate::SyncError;

/// Runs a blocking store call off the async runtime.
pub async fn blocking<F, T>(db: &Arc<Database>, f: F) -> Result<T, SyncError>
where
    F: FnOnce(&Database) -> talksy_db::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || f(&db)).await?;
    result.map_err(SyncError::from)
}
