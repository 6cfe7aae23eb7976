use std::{path::Path, sync::Arc};

use anyhow::anyhow;
use axum::body::Body;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use object_store::{local::LocalFileSystem, path::Path as ObjectPath, ObjectStore, ObjectStoreExt};
use sha2::{Digest, Sha256};
use ulid::Ulid;

use super::{
    auth::hex_encode, core::MAX_MIME_SNIFF_BYTES, errors::ApiFailure,
    metrics::record_side_effect_failure,
};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const AVATAR_PREFIX: &str = "avatars";
pub(crate) const SERVER_ICON_PREFIX: &str = "icons";
pub(crate) const ATTACHMENT_PREFIX: &str = "attachments";
const PUBLIC_PREFIXES: [&str; 3] = [AVATAR_PREFIX, SERVER_ICON_PREFIX, ATTACHMENT_PREFIX];
const MAX_OBJECT_KEY_CHARS: usize = 256;

/// Object persisted by a streaming upload.
#[derive(Debug, Clone)]
pub(crate) struct StoredObject {
    pub(crate) key: String,
    pub(crate) mime_type: &'static str,
    pub(crate) size: u64,
    pub(crate) sha256_hex: String,
}

/// Limits applied to one streaming upload.
pub(crate) struct UploadPolicy<'a> {
    pub(crate) prefix: &'a str,
    pub(crate) max_bytes: usize,
    pub(crate) allowed_mime_types: &'a [&'a str],
    pub(crate) declared_content_type: Option<&'a str>,
}

/// File storage on the local filesystem with public and signed read access.
#[derive(Clone)]
pub(crate) struct ObjectStorage {
    store: Arc<LocalFileSystem>,
    public_base_url: Arc<str>,
    signing_key: Arc<[u8]>,
}

impl ObjectStorage {
    pub(crate) fn new(
        root: &Path,
        public_base_url: &str,
        signing_key: Vec<u8>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| anyhow!("storage root init failed: {e}"))?;
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| anyhow!("object store init failed: {e}"))?;
        Ok(Self {
            store: Arc::new(store),
            public_base_url: Arc::from(public_base_url.trim_end_matches('/')),
            signing_key: Arc::from(signing_key),
        })
    }

    pub(crate) fn public_url(&self, key: &str) -> String {
        format!("{}/files/public/{key}", self.public_base_url)
    }

    /// Link valid until `expires_at_unix`.
    pub(crate) fn signed_url(&self, key: &str, expires_at_unix: i64) -> String {
        let signature = self.signature(key, expires_at_unix);
        format!(
            "{}/files/signed/{key}?expires={expires_at_unix}&signature={signature}",
            self.public_base_url
        )
    }

    pub(crate) fn verify_signature(
        &self,
        key: &str,
        expires_at_unix: i64,
        signature: &str,
        now_unix: i64,
    ) -> bool {
        if expires_at_unix < now_unix {
            return false;
        }
        let Ok(presented) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.signing_key) else {
            return false;
        };
        mac.update(signing_input(key, expires_at_unix).as_bytes());
        mac.verify_slice(&presented).is_ok()
    }

    fn signature(&self, key: &str, expires_at_unix: i64) -> String {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.signing_key) else {
            return String::new();
        };
        mac.update(signing_input(key, expires_at_unix).as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Whether `key` may be served without a signature.
    pub(crate) fn is_public_key(key: &str) -> bool {
        key.split_once('/')
            .is_some_and(|(prefix, rest)| PUBLIC_PREFIXES.contains(&prefix) && !rest.is_empty())
    }

    pub(crate) fn parse_key(key: &str) -> Result<ObjectPath, ApiFailure> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_CHARS || key.contains('\\') {
            return Err(ApiFailure::InvalidRequest("Invalid file key"));
        }
        ObjectPath::parse(key).map_err(|_| ApiFailure::InvalidRequest("Invalid file key"))
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Bytes, ApiFailure> {
        let path = Self::parse_key(key)?;
        let result = self.store.get(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => ApiFailure::NotFound("File not found"),
            other => {
                tracing::error!(event = "storage.get", key = %key, error = %other);
                ApiFailure::Internal
            }
        })?;
        result.bytes().await.map_err(|e| {
            tracing::error!(event = "storage.get", key = %key, error = %e);
            ApiFailure::Internal
        })
    }

    /// Removes an object; a missing object counts as removed.
    pub(crate) async fn delete(&self, key: &str) -> Result<(), ApiFailure> {
        let path = Self::parse_key(key)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => {
                tracing::error!(event = "storage.delete", key = %key, error = %e);
                Err(ApiFailure::Internal)
            }
        }
    }

    /// Deletes an object without failing the caller.
    pub(crate) async fn delete_best_effort(&self, key: &str) {
        if self.delete(key).await.is_err() {
            record_side_effect_failure("storage", "delete");
            tracing::warn!(event = "storage.delete", outcome = "skipped", key = %key);
        }
    }

    /// Streams `body` into a fresh object under `policy.prefix`.
    ///
    /// The stored type is sniffed from the leading bytes and must be in the
    /// allowlist; a declared content type must agree with it.
    pub(crate) async fn upload_stream(
        &self,
        body: Body,
        policy: &UploadPolicy<'_>,
    ) -> Result<StoredObject, ApiFailure> {
        let declared = policy
            .declared_content_type
            .map(|value| {
                value
                    .parse::<mime::Mime>()
                    .map_err(|_| ApiFailure::InvalidRequest("Invalid content type"))
            })
            .transpose()?;

        let staging_key = format!("{}/{}", policy.prefix, Ulid::new());
        let staging_path = Self::parse_key(&staging_key)?;
        let mut upload = self.store.put_multipart(&staging_path).await.map_err(|e| {
            tracing::error!(event = "storage.upload", error = %e);
            ApiFailure::Internal
        })?;
        let mut stream = body.into_data_stream();
        let mut sniff_buffer = Vec::new();
        let mut hasher = Sha256::new();
        let mut total_size: u64 = 0;
        let max_bytes = u64::try_from(policy.max_bytes).map_err(|_| ApiFailure::Internal)?;
        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else {
                let _ = upload.abort().await;
                return Err(ApiFailure::InvalidRequest("Upload interrupted"));
            };
            if chunk.is_empty() {
                continue;
            }
            let chunk_len = u64::try_from(chunk.len()).map_err(|_| ApiFailure::PayloadTooLarge)?;
            total_size = total_size
                .checked_add(chunk_len)
                .ok_or(ApiFailure::PayloadTooLarge)?;
            if total_size > max_bytes {
                let _ = upload.abort().await;
                return Err(ApiFailure::PayloadTooLarge);
            }

            if sniff_buffer.len() < MAX_MIME_SNIFF_BYTES {
                let remaining = MAX_MIME_SNIFF_BYTES - sniff_buffer.len();
                let copy_len = remaining.min(chunk.len());
                sniff_buffer.extend_from_slice(&chunk[..copy_len]);
            }
            hasher.update(chunk.as_ref());
            if upload.put_part(chunk.into()).await.is_err() {
                let _ = upload.abort().await;
                return Err(ApiFailure::Internal);
            }
        }

        if total_size == 0 {
            let _ = upload.abort().await;
            return Err(ApiFailure::InvalidRequest("File is empty"));
        }
        let sniffed = infer::get(&sniff_buffer)
            .filter(|kind| policy.allowed_mime_types.contains(&kind.mime_type()));
        let Some(sniffed) = sniffed else {
            let _ = upload.abort().await;
            return Err(ApiFailure::InvalidRequest("Unsupported file type"));
        };
        if let Some(declared) = declared.as_ref() {
            if declared.essence_str() != "application/octet-stream"
                && declared.essence_str() != sniffed.mime_type()
            {
                let _ = upload.abort().await;
                return Err(ApiFailure::InvalidRequest("Content type does not match file"));
            }
        }
        upload.complete().await.map_err(|e| {
            tracing::error!(event = "storage.upload", error = %e);
            ApiFailure::Internal
        })?;

        let key = format!("{staging_key}.{}", sniffed.extension());
        let final_path = Self::parse_key(&key)?;
        if let Err(e) = self.store.rename(&staging_path, &final_path).await {
            tracing::error!(event = "storage.upload", error = %e);
            self.delete_best_effort(&staging_key).await;
            return Err(ApiFailure::Internal);
        }

        Ok(StoredObject {
            key,
            mime_type: sniffed.mime_type(),
            size: total_size,
            sha256_hex: hex_encode(&hasher.finalize()),
        })
    }
}

fn signing_input(key: &str, expires_at_unix: i64) -> String {
    format!("{key}:{expires_at_unix}")
}

/// Object key behind one of our public URLs, if `url` is one.
pub(crate) fn key_from_public_url<'a>(public_base_url: &str, url: &'a str) -> Option<&'a str> {
    url.strip_prefix(public_base_url.trim_end_matches('/'))?
        .strip_prefix("/files/public/")
        .filter(|key| !key.is_empty())
}

impl ObjectStorage {
    pub(crate) fn key_for_public_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        key_from_public_url(&self.public_base_url, url)
    }
}
