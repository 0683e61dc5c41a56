use crate::domain::errors::PersistenceError;
use crate::domain::ports::ObjectStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// In-memory object store used by tests and backtests.
pub struct InMemoryStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn has(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, PersistenceError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound {
                key: key.to_string(),
            })
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// File-backed object store; one file per key under a base directory.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.base_dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn has(&self, key: &str) -> bool {
        tokio::fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, PersistenceError> {
        tokio::fs::read(self.path_for(key)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PersistenceError::NotFound {
                    key: key.to_string(),
                }
            } else {
                PersistenceError::Io {
                    reason: e.to_string(),
                }
            }
        })
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| PersistenceError::Io {
                reason: e.to_string(),
            })?;
        tokio::fs::write(self.path_for(key), bytes)
            .await
            .map_err(|e| PersistenceError::Io {
                reason: e.to_string(),
            })
    }
}
