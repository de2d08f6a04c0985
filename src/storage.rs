use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{de::DeserializeOwned, Serialize};
use std::{io::ErrorKind, marker::PhantomData, path::PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::{
    cache::{CacheRecord, CacheStore},
    error::CacheError,
};

/// Cache store that keeps one JSON file per key.
///
/// File names are the URL-safe base64 of the key, so any locator string
/// maps to a valid file name and back.
pub struct JsonCacheStore<V> {
    dir: PathBuf,
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonCacheStore<V> {
    pub async fn new(dir: PathBuf) -> Result<Self, CacheError> {
        fs::create_dir_all(&dir).await?;
        info!("📁 Cache storage at: {}", dir.display());

        Ok(Self {
            dir,
            _marker: PhantomData,
        })
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", URL_SAFE_NO_PAD.encode(key)))
    }

    fn key_from_file(path: &std::path::Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl<V> CacheStore<V> for JsonCacheStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load_all(&self) -> Result<Vec<(String, CacheRecord<V>)>, CacheError> {
        let mut files = fs::read_dir(&self.dir).await?;
        let mut records = Vec::new();

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let Some(key) = Self::key_from_file(&path) else {
                warn!("Skipping cache file with unexpected name: {}", path.display());
                continue;
            };

            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<CacheRecord<V>>(&content) {
                Ok(record) => records.push((key, record)),
                Err(e) => warn!("Skipping malformed cache record {}: {}", path.display(), e),
            }
        }

        Ok(records)
    }

    async fn put(&self, key: &str, record: &CacheRecord<V>) -> Result<(), CacheError> {
        let content = serde_json::to_string_pretty(record)?;
        fs::write(self.file_path(key), content).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
