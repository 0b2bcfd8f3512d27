use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Blob store the pipeline persists its state through. Implementations only
/// need get/set/clear semantics; the pipeline treats every value as an opaque
/// JSON blob.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

// --- Native filesystem backend ---

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}

// --- In-process backend, for tests and embedders ---

#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// When set, every write fails. Lets tests exercise the persistence-
    /// failure-is-not-fatal path.
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("not found: {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("simulated write failure");
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.blobs.lock().unwrap().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        storage.write("a/b.json", b"{}").await.unwrap();
        assert!(storage.exists("a/b.json").await.unwrap());
        assert_eq!(storage.read("a/b.json").await.unwrap(), b"{}");
        storage.delete("a/b.json").await.unwrap();
        assert!(!storage.exists("a/b.json").await.unwrap());
    }

    #[tokio::test]
    async fn native_storage_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("nested/deep/state.json")
            .to_string_lossy()
            .to_string();
        let storage = NativeStorage::new();
        storage.write(&path, b"blob").await.unwrap();
        assert_eq!(storage.read(&path).await.unwrap(), b"blob");
        storage.delete(&path).await.unwrap();
        assert!(!storage.exists(&path).await.unwrap());
    }
}
