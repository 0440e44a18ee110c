//! Persistent storage for broker state
//!
//! This module provides a pluggable storage interface for persisting the
//! in-process broker: live envelopes (pending or leased) and dead letters.
//! Envelopes are stored in their wire encoding so a restarted broker sees
//! exactly what producers enqueued.

use crate::dlq::DeadLetter;
use crate::envelope::TaskEnvelope;
use crate::error::{BusError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

/// Storage interface for persisting broker state
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or replace an envelope
    async fn save_envelope(&self, envelope: &TaskEnvelope) -> Result<()>;

    /// Load all live envelopes
    async fn load_envelopes(&self) -> Result<Vec<TaskEnvelope>>;

    /// Remove an envelope (acknowledged, purged or dead-lettered)
    async fn remove_envelope(&self, id: &str) -> Result<()>;

    /// Insert or replace a dead letter
    async fn save_dead_letter(&self, letter: &DeadLetter) -> Result<()>;

    /// Load all dead letters, oldest first
    async fn load_dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Remove a dead letter (requeued or discarded)
    async fn remove_dead_letter(&self, task_id: &str) -> Result<()>;

    /// Clear all storage (envelopes and dead letters)
    async fn clear_all(&self) -> Result<()>;
}

/// Local filesystem-based storage implementation
pub struct LocalStorage {
    /// Directory path for storage files
    storage_dir: PathBuf,
    /// In-memory cache of envelopes (for fast access)
    envelopes: RwLock<HashMap<String, TaskEnvelope>>,
    /// In-memory cache of dead letters
    dead_letters: RwLock<Vec<DeadLetter>>,
    /// Serializes file rewrites
    write_lock: Mutex<()>,
}

impl LocalStorage {
    /// Create a new LocalStorage with the specified directory
    ///
    /// The directory will be created if it doesn't exist.
    pub async fn new(storage_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&storage_dir).await.map_err(|e| {
            BusError::Other(format!("Failed to create storage directory: {}", e))
        })?;

        let storage = Self {
            storage_dir,
            envelopes: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
        };

        storage.load_from_disk().await?;

        Ok(storage)
    }

    fn envelopes_path(&self) -> PathBuf {
        self.storage_dir.join("envelopes.json")
    }

    fn dead_letters_path(&self) -> PathBuf {
        self.storage_dir.join("dead_letters.json")
    }

    /// Load data from disk into memory
    async fn load_from_disk(&self) -> Result<()> {
        if let Ok(data) = fs::read(self.envelopes_path()).await {
            match serde_json::from_slice::<Vec<TaskEnvelope>>(&data) {
                Ok(envelopes) => {
                    let mut cache = self.envelopes.write().await;
                    for envelope in envelopes {
                        cache.insert(envelope.id.clone(), envelope);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "taskbus.storage: ignoring unreadable envelopes file");
                }
            }
        }

        if let Ok(data) = fs::read(self.dead_letters_path()).await {
            match serde_json::from_slice::<Vec<DeadLetter>>(&data) {
                Ok(letters) => *self.dead_letters.write().await = letters,
                Err(e) => {
                    tracing::warn!(error = %e, "taskbus.storage: ignoring unreadable dead letters file");
                }
            }
        }

        Ok(())
    }

    async fn persist_envelopes(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let json = {
            let envelopes = self.envelopes.read().await;
            let mut list: Vec<&TaskEnvelope> = envelopes.values().collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            serde_json::to_vec_pretty(&list)?
        };
        write_atomic(self.envelopes_path(), json).await
    }

    async fn persist_dead_letters(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let json = serde_json::to_vec_pretty(&*self.dead_letters.read().await)?;
        write_atomic(self.dead_letters_path(), json).await
    }
}

// Write to a sibling file, then rename over the target
async fn write_atomic(path: PathBuf, contents: Vec<u8>) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .await
        .map_err(|e| BusError::Other(format!("Failed to write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, &path)
        .await
        .map_err(|e| BusError::Other(format!("Failed to replace {}: {}", path.display(), e)))
}

#[async_trait]
impl Storage for LocalStorage {
    async fn save_envelope(&self, envelope: &TaskEnvelope) -> Result<()> {
        let mut envelopes = self.envelopes.write().await;
        envelopes.insert(envelope.id.clone(), envelope.clone());
        drop(envelopes);

        self.persist_envelopes().await
    }

    async fn load_envelopes(&self) -> Result<Vec<TaskEnvelope>> {
        let envelopes = self.envelopes.read().await;
        let mut list: Vec<TaskEnvelope> = envelopes.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn remove_envelope(&self, id: &str) -> Result<()> {
        let mut envelopes = self.envelopes.write().await;
        let removed = envelopes.remove(id).is_some();
        drop(envelopes);

        if removed {
            self.persist_envelopes().await
        } else {
            Ok(())
        }
    }

    async fn save_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let mut letters = self.dead_letters.write().await;
        letters.retain(|l| l.task_id != letter.task_id);
        letters.push(letter.clone());
        drop(letters);

        self.persist_dead_letters().await
    }

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let letters = self.dead_letters.read().await;
        Ok(letters.clone())
    }

    async fn remove_dead_letter(&self, task_id: &str) -> Result<()> {
        let mut letters = self.dead_letters.write().await;
        let before = letters.len();
        letters.retain(|l| l.task_id != task_id);
        let removed = letters.len() != before;
        drop(letters);

        if removed {
            self.persist_dead_letters().await
        } else {
            Ok(())
        }
    }

    async fn clear_all(&self) -> Result<()> {
        self.envelopes.write().await.clear();
        self.dead_letters.write().await.clear();

        let _guard = self.write_lock.lock().await;
        let _ = fs::remove_file(self.envelopes_path()).await;
        let _ = fs::remove_file(self.dead_letters_path()).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::PriorityClass;
    use tempfile::TempDir;

    fn envelope(task_type: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            task_type,
            serde_json::json!({"data": "test"}),
            "default",
            PriorityClass::Default,
        )
    }

    #[tokio::test]
    async fn test_local_storage_save_and_load_envelopes() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let env = envelope("test");
        storage.save_envelope(&env).await.unwrap();

        let loaded = storage.load_envelopes().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], env);

        // Create new storage instance (simulates restart)
        let storage2 = LocalStorage::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();
        let loaded2 = storage2.load_envelopes().await.unwrap();
        assert_eq!(loaded2.len(), 1);
        assert_eq!(loaded2[0].id, env.id);
        assert_eq!(loaded2[0].payload["data"], "test");
    }

    #[tokio::test]
    async fn test_local_storage_save_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let mut env = envelope("test");
        storage.save_envelope(&env).await.unwrap();
        env.attempt = 2;
        storage.save_envelope(&env).await.unwrap();

        let loaded = storage.load_envelopes().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_local_storage_remove_envelope() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let env1 = envelope("a");
        let env2 = envelope("b");
        storage.save_envelope(&env1).await.unwrap();
        storage.save_envelope(&env2).await.unwrap();

        storage.remove_envelope(&env1.id).await.unwrap();
        // Removing twice is harmless
        storage.remove_envelope(&env1.id).await.unwrap();

        let loaded = storage.load_envelopes().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, env2.id);
    }

    #[tokio::test]
    async fn test_local_storage_dead_letters() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let letter = DeadLetter::new(envelope("test"), "timeout");
        storage.save_dead_letter(&letter).await.unwrap();

        let storage2 = LocalStorage::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();
        let loaded = storage2.load_dead_letters().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].task_id, letter.task_id);
        assert_eq!(loaded[0].error, "timeout");

        storage2.remove_dead_letter(&letter.task_id).await.unwrap();
        assert!(storage2.load_dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_storage_clear_all() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let env = envelope("test");
        storage.save_envelope(&env).await.unwrap();
        storage
            .save_dead_letter(&DeadLetter::new(env.clone(), "failed"))
            .await
            .unwrap();

        storage.clear_all().await.unwrap();

        assert!(storage.load_envelopes().await.unwrap().is_empty());
        assert!(storage.load_dead_letters().await.unwrap().is_empty());

        let reopened = LocalStorage::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(reopened.load_envelopes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_storage_ignores_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("envelopes.json"), b"{not json").unwrap();

        let storage = LocalStorage::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(storage.load_envelopes().await.unwrap().is_empty());
    }
}
