use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::err::Error;

const STORAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Durable object storage port for approved certificate artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), Error>;

    /// Issues a time-limited retrieval URL for a stored object.
    async fn signed_url(&self, name: &str, expires_secs: u64) -> Result<String, Error>;

    /// Removes an object; used to compensate a failed approval.
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

/// Supabase storage API client (`/storage/v1`).
pub struct SupabaseStorage {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl SupabaseStorage {
    pub fn new(base_url: String, service_key: String, bucket: String) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(STORAGE_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            bucket,
        })
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.bucket, name
        )
    }
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    async fn put(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), Error> {
        let response = self
            .http
            .post(self.object_url(name))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            log::error!("storage upload failed ({}): {}", status, detail);
            return Err(Error::upstream(
                "ObjectStorage",
                format!("upload of {} failed with {}", name, status),
            ));
        }
        Ok(())
    }

    async fn signed_url(&self, name: &str, expires_secs: u64) -> Result<String, Error> {
        let url = format!(
            "{}/storage/v1/object/sign/{}/{}",
            self.base_url, self.bucket, name
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .json(&serde_json::json!({ "expiresIn": expires_secs }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            log::error!("signing {} failed ({}): {}", name, status, detail);
            return Err(Error::upstream(
                "ObjectStorage",
                format!("signing {} failed with {}", name, status),
            ));
        }

        let signed = response.json::<SignedUrlResponse>().await?;
        Ok(format!("{}/storage/v1{}", self.base_url, signed.signed_url))
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        let response = self
            .http
            .delete(self.object_url(name))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::upstream(
                "ObjectStorage",
                format!("deletion of {} failed with {}", name, status),
            ));
        }
        Ok(())
    }
}

/// In-memory object store for development and tests.
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.objects.read().await.contains_key(name)
    }

    pub async fn count(&self) -> usize {
        self.objects.read().await.len()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, name: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), Error> {
        self.objects.write().await.insert(name.to_string(), bytes);
        Ok(())
    }

    async fn signed_url(&self, name: &str, expires_secs: u64) -> Result<String, Error> {
        if !self.objects.read().await.contains_key(name) {
            return Err(Error::upstream(
                "ObjectStorage",
                format!("no object named {}", name),
            ));
        }
        Ok(format!("memory://{}?expires={}", name, expires_secs))
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        self.objects.write().await.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryObjectStore::new();
        store
            .put("REQ1_abc.pdf", b"%PDF-1.4".to_vec(), "application/pdf")
            .await
            .unwrap();

        let url = store.signed_url("REQ1_abc.pdf", 3600).await.unwrap();
        assert!(url.starts_with("memory://REQ1_abc.pdf"));

        store.delete("REQ1_abc.pdf").await.unwrap();
        assert!(!store.contains("REQ1_abc.pdf").await);
    }

    #[tokio::test]
    async fn signing_a_missing_object_fails() {
        let store = MemoryObjectStore::new();
        let result = store.signed_url("missing.pdf", 3600).await;
        assert!(matches!(result, Err(Error::Upstream { .. })));
    }
}
