//! File blocks - object storage integration.
//!
//! `file_download` stores a resolved value under an object key;
//! `file_upload` reads an object back into the run, for upload_file actions
//! or later blocks to reference. The store itself is an external capability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;

use super::BlockOutcome;
use crate::context::ContextSnapshot;
use crate::error::{Error, Result};
use crate::workflow::expression::{render_template, value_to_string};

/// Opaque object storage capability.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// In-memory object store for tests and embedded use.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Network(format!("Object '{}' not found", key)))
    }
}

/// Store the rendered source value under the rendered destination key.
pub async fn execute_download(
    store: &Arc<dyn ObjectStore>,
    source: &str,
    destination: &str,
    snapshot: &ContextSnapshot,
) -> Result<BlockOutcome> {
    if source.is_empty() {
        return Err(Error::Validation(
            "file_download requires a source template".into(),
        ));
    }

    let key = value_to_string(&render_template(destination, snapshot)?);
    let value = render_template(source, snapshot)?;

    let bytes = match &value {
        Value::String(s) => s.clone().into_bytes(),
        other => serde_json::to_vec(other)?,
    };
    let size = bytes.len();

    debug!(key = %key, size, "Storing file block payload");
    store.put(&key, bytes).await?;

    Ok(BlockOutcome::completed(json!({
        "key": key,
        "size_bytes": size,
    })))
}

/// Read an object back into the run context.
pub async fn execute_upload(
    store: &Arc<dyn ObjectStore>,
    source: &str,
    encode_base64: bool,
    snapshot: &ContextSnapshot,
) -> Result<BlockOutcome> {
    let key = value_to_string(&render_template(source, snapshot)?);

    let bytes = store.get(&key).await?;
    let size = bytes.len();

    let content = if encode_base64 {
        Value::String(BASE64.encode(&bytes))
    } else {
        match String::from_utf8(bytes) {
            Ok(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            Err(e) => Value::String(BASE64.encode(e.into_bytes())),
        }
    };

    Ok(BlockOutcome::completed(json!({
        "key": key,
        "size_bytes": size,
        "content": content,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn snapshot(values: Vec<(&str, Value)>) -> ContextSnapshot {
        ContextSnapshot::for_tests(
            None,
            values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            HashMap::new(),
        )
    }

    fn store() -> Arc<dyn ObjectStore> {
        Arc::new(MemoryObjectStore::new())
    }

    #[tokio::test]
    async fn download_then_upload_round_trip() {
        let store = store();
        let snap = snapshot(vec![
            ("report", json!({"total": 12})),
            ("run_id", json!("r-9")),
        ]);

        let outcome = execute_download(&store, "${report}", "reports/${run_id}.json", &snap)
            .await
            .unwrap();
        assert_eq!(outcome.output.as_ref().unwrap()["key"], "reports/r-9.json");

        let uploaded = execute_upload(&store, "reports/${run_id}.json", false, &snap)
            .await
            .unwrap();
        assert_eq!(
            uploaded.output.unwrap()["content"],
            json!({"total": 12})
        );
    }

    #[tokio::test]
    async fn upload_missing_object_is_network_error() {
        let store = store();
        let snap = snapshot(vec![]);
        let err = execute_upload(&store, "missing/key", false, &snap)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NETWORK_ERROR");
    }

    #[tokio::test]
    async fn upload_can_encode_base64() {
        let store = store();
        store.put("blob", vec![0xde, 0xad]).await.unwrap();

        let snap = snapshot(vec![]);
        let outcome = execute_upload(&store, "blob", true, &snap).await.unwrap();
        assert_eq!(outcome.output.unwrap()["content"], json!("3q0="));
    }

    #[tokio::test]
    async fn download_requires_source() {
        let store = store();
        let snap = snapshot(vec![]);
        let err = execute_download(&store, "", "dest", &snap).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
