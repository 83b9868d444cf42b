//! Process-wide download cache: URL → content-addressed blob.
//!
//! Blobs are named by the SHA-256 of their bytes; `url-map.json` maps source
//! URLs to blob filenames. Writes go through a temp file and an idempotent
//! rename, so concurrent activations fetching the same URL converge on the
//! same blob without coordination.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ImageError, Result};

const URL_MAP_FILE: &str = "url-map.json";

pub struct DownloadCache {
    dir: PathBuf,
    client: reqwest::Client,
    url_map: Mutex<HashMap<String, String>>,
}

impl DownloadCache {
    /// Open (or create) the cache directory and load the URL map.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let map_path = dir.join(URL_MAP_FILE);
        let url_map = if map_path.exists() {
            let raw = std::fs::read_to_string(&map_path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            dir,
            client: reqwest::Client::new(),
            url_map: Mutex::new(url_map),
        })
    }

    /// Return the cached bytes for `url`, downloading on first sight.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(name) = self.lookup(url) {
            let path = self.dir.join(&name);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    debug!(url, blob = %name, "image cache hit");
                    return Ok(bytes);
                }
                Err(e) => {
                    // Stale map entry; fall through and re-download.
                    warn!(url, blob = %name, error = %e, "cached blob missing");
                }
            }
        }

        let bytes = self.download(url).await?;
        let name = hex::encode(Sha256::digest(&bytes));
        self.store_blob(&name, &bytes).await?;
        self.record(url, &name)?;
        Ok(bytes)
    }

    fn lookup(&self, url: &str) -> Option<String> {
        self.url_map.lock().unwrap().get(url).cloned()
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ImageError::Download {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(ImageError::Download {
                url: url.to_string(),
                reason: format!("status {}", resp.status()),
            });
        }
        let bytes = resp.bytes().await.map_err(|e| ImageError::Download {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }

    /// Write a blob via temp-file + rename. A concurrent writer racing on the
    /// same content produces an identical file, so the rename is idempotent.
    async fn store_blob(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let final_path = self.dir.join(name);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            return Ok(());
        }
        let tmp_path = self.dir.join(format!("{name}.tmp"));
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    /// Record the URL → blob mapping and persist the map.
    fn record(&self, url: &str, name: &str) -> Result<()> {
        let snapshot = {
            let mut map = self.url_map.lock().unwrap();
            map.insert(url.to_string(), name.to_string());
            map.clone()
        };
        let raw = serde_json::to_string_pretty(&snapshot)?;
        let tmp_path = self.dir.join(format!("{URL_MAP_FILE}.tmp"));
        std::fs::write(&tmp_path, raw)?;
        std::fs::rename(tmp_path, self.dir.join(URL_MAP_FILE))?;
        Ok(())
    }

    #[cfg(test)]
    fn insert_for_test(&self, url: &str, name: &str, bytes: &[u8]) {
        std::fs::write(self.dir.join(name), bytes).unwrap();
        self.record(url, name).unwrap();
    }
}
