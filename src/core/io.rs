use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Where run artifacts live. Paths are plain strings relative to the
/// configured folders.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn read_text(&self, path: &str) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", path))
    }
}

pub async fn read_json<T: DeserializeOwned>(storage: &dyn Storage, path: &str) -> Result<T> {
    let content = storage.read_text(path).await?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path))
}

pub async fn write_json<T: Serialize>(storage: &dyn Storage, path: &str, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    storage.write(path, content.as_bytes()).await
}

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
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Readers never observe a partially written file.
        let tmp = format!("{}.tmp", path);
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = std::path::Path::new(prefix);
        let mut entries = Vec::new();

        if path.exists() {
            if path.is_dir() {
                let mut dir = tokio::fs::read_dir(path).await?;
                while let Some(entry) = dir.next_entry().await? {
                    entries.push(entry.path().to_string_lossy().to_string());
                }
            } else {
                entries.push(prefix.to_string());
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_native_storage_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let path = dir.path().join("nested/run/state.json");
        let path = path.to_string_lossy().to_string();

        assert!(!storage.exists(&path).await?);
        let mut value = HashMap::new();
        value.insert("batch".to_string(), 2u32);
        write_json(&storage, &path, &value).await?;
        assert!(storage.exists(&path).await?);
        assert!(!storage.exists(&format!("{}.tmp", path)).await?);

        let back: HashMap<String, u32> = read_json(&storage, &path).await?;
        assert_eq!(back, value);

        let listed = storage.list(&dir.path().join("nested/run").to_string_lossy()).await?;
        assert_eq!(listed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_missing_folder_is_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let missing = dir.path().join("nope").to_string_lossy().to_string();
        assert!(storage.list(&missing).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_text_rejects_binary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let path = dir.path().join("blob.bin").to_string_lossy().to_string();
        storage.write(&path, &[0xff, 0xfe, 0x00]).await?;
        assert!(storage.read_text(&path).await.is_err());
        Ok(())
    }
}
