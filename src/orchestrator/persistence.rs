//! Best-effort bundle record persistence
//!
//! The orchestrator keeps the authoritative session state in memory and
//! mirrors it here. Every store call is wrapped in a timeout by the caller;
//! failures are logged and never block validation.

use super::record::{BundleRecord, BundleStatus};
use crate::errors::GuardError;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn create_bundle_record(&self, record: &BundleRecord) -> Result<(), GuardError>;

    async fn update_bundle_record(
        &self,
        id: &str,
        status: BundleStatus,
        result: &serde_json::Value,
    ) -> Result<(), GuardError>;

    async fn get_bundle_record(&self, id: &str) -> Result<Option<BundleRecord>, GuardError>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryBundleStore {
    records: DashMap<String, BundleRecord>,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl BundleStore for MemoryBundleStore {
    async fn create_bundle_record(&self, record: &BundleRecord) -> Result<(), GuardError> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_bundle_record(
        &self,
        id: &str,
        status: BundleStatus,
        result: &serde_json::Value,
    ) -> Result<(), GuardError> {
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| GuardError::UnknownBundle(id.to_string()))?;
        entry.status = status;
        entry.last_result = result.clone();
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn get_bundle_record(&self, id: &str) -> Result<Option<BundleRecord>, GuardError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }
}

/// Embedded on-disk store; records are JSON values keyed by id
#[derive(Clone)]
pub struct SledBundleStore {
    db: Arc<sled::Db>,
}

impl SledBundleStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GuardError> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            GuardError::persistence(format!("open sled at {}: {}", path.as_ref().display(), e))
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    fn read(&self, id: &str) -> Result<Option<BundleRecord>, GuardError> {
        let Some(bytes) = self
            .db
            .get(id.as_bytes())
            .map_err(|e| GuardError::persistence(e.to_string()))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| GuardError::persistence(format!("corrupt record {}: {}", id, e)))
    }

    async fn write(&self, record: &BundleRecord) -> Result<(), GuardError> {
        let bytes = serde_json::to_vec(record).map_err(|e| GuardError::persistence(e.to_string()))?;
        self.db
            .insert(record.id.as_bytes(), bytes)
            .map_err(|e| GuardError::persistence(e.to_string()))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| GuardError::persistence(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BundleStore for SledBundleStore {
    async fn create_bundle_record(&self, record: &BundleRecord) -> Result<(), GuardError> {
        self.write(record).await
    }

    async fn update_bundle_record(
        &self,
        id: &str,
        status: BundleStatus,
        result: &serde_json::Value,
    ) -> Result<(), GuardError> {
        let mut record = self
            .read(id)?
            .ok_or_else(|| GuardError::UnknownBundle(id.to_string()))?;
        record.status = status;
        record.last_result = result.clone();
        record.updated_at = Utc::now();
        self.write(&record).await
    }

    async fn get_bundle_record(&self, id: &str) -> Result<Option<BundleRecord>, GuardError> {
        self.read(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::pubkey::Pubkey;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryBundleStore::new();
        let record = BundleRecord::new(&Pubkey::new_unique());
        store.create_bundle_record(&record).await.unwrap();

        store
            .update_bundle_record(&record.id, BundleStatus::Simulated, &serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let stored = store.get_bundle_record(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BundleStatus::Simulated);
        assert_eq!(stored.last_result["n"], 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_unknown_update() {
        let store = MemoryBundleStore::new();
        let err = store
            .update_bundle_record("missing", BundleStatus::Failed, &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::UnknownBundle(_)));
    }

    #[tokio::test]
    async fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");
        let record = BundleRecord::new(&Pubkey::new_unique());

        {
            let store = SledBundleStore::open(&path).unwrap();
            store.create_bundle_record(&record).await.unwrap();
            store
                .update_bundle_record(&record.id, BundleStatus::Failed, &serde_json::json!({"reason": "x"}))
                .await
                .unwrap();
        }

        let reopened = SledBundleStore::open(&path).unwrap();
        let stored = reopened.get_bundle_record(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BundleStatus::Failed);
        assert_eq!(stored.created_at, record.created_at);
        assert!(reopened.get_bundle_record("nope").await.unwrap().is_none());
    }
}
