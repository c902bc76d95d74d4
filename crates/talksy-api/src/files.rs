use std::path::PathBuf;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use uuid::Uuid;

use talksy_gateway::store::blocking;
use talksy_types::api::{Claims, UploadResponse};

use crate::auth::AppState;
use crate::error::status;

/// 10 MB upload limit for images
pub const MAX_BLOB_SIZE: usize = 10 * 1024 * 1024;

/// Content-addressed blob storage on local disk: "store bytes, return URL".
pub struct BlobStore {
    dir: PathBuf,
    public_url: String,
}

impl BlobStore {
    pub async fn new(dir: PathBuf, public_url: impl Into<String>) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        info!("Blob storage directory: {}", dir.display());
        Ok(Self {
            dir,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, id: &str) -> String {
        format!("{}/files/{}", self.public_url, id)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Writes the bytes under their SHA-256 and returns the id.
    pub async fn store(&self, bytes: &[u8]) -> std::io::Result<String> {
        let id = hex::encode(Sha256::digest(bytes));
        let path = self.path_for(&id);
        if tokio::fs::try_exists(&path).await? {
            return Ok(id);
        }

        // Write under a per-upload temporary name so a crash never leaves a
        // partial blob and identical concurrent uploads never share a file.
        let tmp = self.dir.join(format!("{}.{}.part", id, Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(id)
    }

    pub async fn load(&self, id: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.path_for(id)).await
    }
}

fn valid_blob_id(id: &str) -> bool {
    id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// POST /files — raw bytes with their Content-Type; returns a public URL.
pub async fn upload(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    if bytes.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if bytes.len() > MAX_BLOB_SIZE {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let id = state.blobs.store(&bytes).await.map_err(|e| {
        error!("Failed to store blob: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let size = bytes.len() as i64;
    let blob_id = id.clone();
    blocking(&state.hub.db, move |db| {
        db.insert_blob(&blob_id, claims.sub, &content_type, size, Utc::now())
    })
    .await
    .map_err(status)?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            url: state.blobs.url_for(&id),
            id,
            size: size as u64,
        }),
    ))
}

/// GET /files/{blob_id} — public, so URLs work directly in image tags.
pub async fn download(
    State(state): State<AppState>,
    Path(blob_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    // Only well-formed hashes reach the filesystem
    if !valid_blob_id(&blob_id) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let id = blob_id.clone();
    let row = blocking(&state.hub.db, move |db| db.get_blob(&id))
        .await
        .map_err(status)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let bytes = state.blobs.load(&blob_id).await.map_err(|e| {
        error!("Failed to read blob {}: {}", blob_id, e);
        StatusCode::NOT_FOUND
    })?;

    Ok(([(header::CONTENT_TYPE, row.content_type)], bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> BlobStore {
        let dir = std::env::temp_dir().join(format!("talksy-blob-store-{}", Uuid::new_v4()));
        BlobStore::new(dir, "http://talksy.test/").await.unwrap()
    }

    #[test]
    fn blob_ids_are_lowercase_sha256_hex() {
        assert!(valid_blob_id(&"ab12".repeat(16)));
        assert!(!valid_blob_id(&"AB12".repeat(16)));
        assert!(!valid_blob_id("../../etc/passwd"));
        assert!(!valid_blob_id(&"a".repeat(63)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn identical_concurrent_uploads_all_succeed() {
        let store = std::sync::Arc::new(temp_store().await);
        let bytes = b"same picture, sent twice".to_vec();

        let uploads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let bytes = bytes.clone();
                tokio::spawn(async move { store.store(&bytes).await })
            })
            .collect();

        let mut ids = Vec::new();
        for upload in uploads {
            ids.push(upload.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.load(&ids[0]).await.unwrap(), bytes);
        assert_eq!(store.url_for(&ids[0]), format!("http://talksy.test/files/{}", ids[0]));

        let mut leftovers = tokio::fs::read_dir(&store.dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = leftovers.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![ids[0].clone()]);
    }
}
