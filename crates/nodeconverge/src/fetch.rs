use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hash::{ContentHash, HashAlgorithm};

fn default_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Moves the bytes behind `url` into `dest`. No verification happens here.
pub trait Downloader: Send + Sync {
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

pub struct HttpDownloader {
    client: reqwest::blocking::Client,
    attempts: u32,
}

impl HttpDownloader {
    pub fn new(cfg: &FetchConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            attempts: cfg.attempts.max(1),
        })
    }

    fn download_once(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(local) = url.strip_prefix("file://") {
            fs::copy(local, dest)
                .map_err(|e| Error::msg(format!("failed to copy {local}: {e}")))?;
            return Ok(());
        }

        let mut res = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::msg(format!("HTTP download of {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "HTTP download of {url} failed with status {}",
                res.status()
            )));
        }
        let mut out = fs::File::create(dest)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
        res.copy_to(&mut out)
            .map_err(|e| Error::msg(format!("HTTP download of {url} failed: {e}")))?;
        Ok(())
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.download_once(url, dest) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.attempts => {
                    warn!(url, attempt, error = %e, "download failed, retrying");
                    std::thread::sleep(Duration::from_millis(500 * u64::from(attempt)));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Content-addressed download cache. Entries live at `<dir>/<algorithm>/<hex>`.
pub struct FetchCache {
    dir: PathBuf,
    downloader: Arc<dyn Downloader>,
    locks: Mutex<HashMap<ContentHash, Arc<Mutex<()>>>>,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub hash: ContentHash,
    pub valid: bool,
}

impl FetchCache {
    pub fn new(dir: impl Into<PathBuf>, downloader: Arc<dyn Downloader>) -> Self {
        Self {
            dir: dir.into(),
            downloader,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(hash.algorithm.name()).join(&hash.hex)
    }

    fn key_lock(&self, hash: &ContentHash) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(hash.clone()).or_default())
    }

    /// Drops the table entry for `hash` unless another fetch still holds it.
    fn release_key_lock(&self, hash: &ContentHash, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // One reference in the table, one in `lock`.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(hash);
        }
    }

    pub fn fetch(&self, url: &str, expected: &ContentHash) -> Result<PathBuf> {
        let lock = self.key_lock(expected);
        let res = {
            let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
            self.fetch_locked(url, expected)
        };
        self.release_key_lock(expected, lock);
        res
    }

    fn fetch_locked(&self, url: &str, expected: &ContentHash) -> Result<PathBuf> {
        let dest = self.entry_path(expected);
        if dest.exists() {
            if expected.matches_file(&dest)? {
                debug!(%expected, path = %dest.display(), "fetch cache hit");
                return Ok(dest);
            }
            warn!(%expected, path = %dest.display(), "cached file no longer matches its hash, evicting");
            fs::remove_file(&dest)
                .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dest.display())))?;
        }

        let parent = dest
            .parent()
            .ok_or_else(|| Error::msg(format!("invalid cache path {}", dest.display())))?;
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", parent.display())))?;

        // Dropping `tmp` on any early return deletes the partial download.
        let tmp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(parent)
            .map_err(|e| Error::msg(format!("failed to create temp file: {e}")))?;
        info!(url, %expected, "downloading");
        self.downloader.download(url, tmp.path())?;

        let actual = ContentHash::of_file(expected.algorithm, tmp.path())?;
        if actual != *expected {
            return Err(Error::Verification {
                url: url.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        tmp.persist(&dest).map_err(|e| {
            Error::msg(format!("failed to move download into {}: {}", dest.display(), e.error))
        })?;
        Ok(dest)
    }

    /// Re-hashes every entry. With `prune`, entries that no longer match are removed.
    pub fn verify(&self, prune: bool) -> Result<Vec<CacheEntry>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in walkdir::WalkDir::new(&self.dir).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let Some(alg) = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|s| s.to_str())
            else {
                continue;
            };
            let Ok(hash) = format!("{alg}:{name}").parse::<ContentHash>() else {
                continue;
            };
            let valid = hash.matches_file(entry.path())?;
            if !valid && prune {
                fs::remove_file(entry.path()).map_err(|e| {
                    Error::msg(format!("failed to remove {}: {e}", entry.path().display()))
                })?;
            }
            out.push(CacheEntry {
                path: entry.path().to_path_buf(),
                hash,
                valid,
            });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

/// The digest used when a task needs to fingerprint local content.
pub const DEFAULT_ALGORITHM: HashAlgorithm = HashAlgorithm::Sha256;

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Serves fixed bodies per URL and counts calls.
    #[derive(Default)]
    pub struct StaticDownloader {
        pub bodies: Mutex<BTreeMap<String, Vec<u8>>>,
        pub calls: AtomicUsize,
    }

    impl StaticDownloader {
        pub fn with(url: &str, body: &[u8]) -> Self {
            let d = Self::default();
            d.set(url, body);
            d
        }

        pub fn set(&self, url: &str, body: &[u8]) {
            self.bodies
                .lock()
                .expect("bodies")
                .insert(url.to_string(), body.to_vec());
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Downloader for StaticDownloader {
        fn download(&self, url: &str, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self
                .bodies
                .lock()
                .expect("bodies")
                .get(url)
                .cloned()
                .ok_or_else(|| Error::msg(format!("404 {url}")))?;
            fs::write(dest, body)?;
            Ok(())
        }
    }
}
