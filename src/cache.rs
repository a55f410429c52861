//! Content-addressed cache for parsed reference data.
//!
//! Each artifact is one bincode file under the cache directory, storing
//! the value together with the sha256 digest of the source it was built
//! from. A digest mismatch is the only invalidation signal; corrupt or
//! unreadable entries count as misses and trigger a rebuild.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::Result;

/// Streaming sha256 of a file, hex-encoded.
pub fn file_digest<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    log::debug!("Computing sha256 checksum for {}", path.display());

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut block = [0u8; 4096];
    loop {
        let n = file.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }

    let digest = hex::encode(hasher.finalize());
    log::debug!("Checksum: {digest}");
    Ok(digest)
}

#[derive(Serialize, Deserialize)]
struct CacheEntry<T> {
    checksum: String,
    value: T,
}

/// One durable key-value store per cached artifact.
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Opens a cache at `dir`, creating the directory if absent.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Default location under the user cache directory.
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("taxref-lookups")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.bin"))
    }

    /// Returns the cached value for `key` if its stored digest matches
    /// the current digest of `source`; otherwise builds, persists, and
    /// returns the fresh value. The bool is `true` when a rebuild
    /// happened.
    pub fn fetch_or_build<T, F>(&self, source: &Path, key: &str, build: F) -> Result<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let digest = file_digest(source)?;
        self.fetch_or_build_keyed(key, &digest, build)
    }

    /// Same contract as [`fetch_or_build`](Self::fetch_or_build) with a
    /// caller-supplied digest, for artifacts derived from more than one
    /// source file.
    pub fn fetch_or_build_keyed<T, F>(&self, key: &str, digest: &str, build: F) -> Result<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.lookup(key, digest) {
            log::info!("Reading {key} from cache {}", self.dir.display());
            return Ok((value, false));
        }
        self.rebuild_keyed(key, digest, build)
    }

    /// Unconditionally builds and persists, bypassing any cached entry.
    /// Used when an upstream artifact was itself rebuilt.
    pub fn rebuild_keyed<T, F>(&self, key: &str, digest: &str, build: F) -> Result<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let value = build()?;
        log::info!("Writing {key} to cache {}", self.dir.display());
        let entry = CacheEntry {
            checksum: digest.to_string(),
            value,
        };
        fs::write(self.entry_path(key), bincode::serialize(&entry)?)?;
        Ok((entry.value, true))
    }

    /// A missing, stale, or unreadable entry is a miss.
    fn lookup<T: DeserializeOwned>(&self, key: &str, digest: &str) -> Option<T> {
        let bytes = fs::read(self.entry_path(key)).ok()?;
        match bincode::deserialize::<CacheEntry<T>>(&bytes) {
            Ok(entry) if entry.checksum == digest => Some(entry.value),
            Ok(_) => None,
            Err(err) => {
                log::warn!("Discarding unreadable cache entry {key}: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rebuilds_only_on_digest_change() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        fs::write(&source, b"0\t|\t0\t|\n").unwrap();
        let cache = FileCache::open(dir.path().join("cache")).unwrap();

        let (value, rebuilt) = cache
            .fetch_or_build(&source, "counts", || Ok(vec![1u32, 2, 3]))
            .unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert!(rebuilt);

        // same bytes => cached value, no rebuild
        let (value, rebuilt) = cache
            .fetch_or_build(&source, "counts", || -> Result<Vec<u32>> {
                panic!("builder must not run on a cache hit")
            })
            .unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert!(!rebuilt);

        // one changed byte => rebuild
        fs::write(&source, b"1\t|\t0\t|\n").unwrap();
        let (value, rebuilt) = cache
            .fetch_or_build(&source, "counts", || Ok(vec![9u32]))
            .unwrap();
        assert_eq!(value, vec![9]);
        assert!(rebuilt);
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        fs::write(&source, b"data").unwrap();
        let cache = FileCache::open(dir.path().join("cache")).unwrap();

        cache
            .fetch_or_build(&source, "counts", || Ok(vec![7u32]))
            .unwrap();
        fs::write(cache.entry_path("counts"), b"\x00garbage").unwrap();

        let (value, rebuilt) = cache
            .fetch_or_build(&source, "counts", || Ok(vec![8u32]))
            .unwrap();
        assert_eq!(value, vec![8]);
        assert!(rebuilt);
    }

    #[test]
    fn keys_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        fs::write(&source, b"data").unwrap();
        let cache = FileCache::open(dir.path().join("cache")).unwrap();

        cache
            .fetch_or_build(&source, "first", || Ok(String::from("a")))
            .unwrap();
        let (value, rebuilt) = cache
            .fetch_or_build(&source, "second", || Ok(String::from("b")))
            .unwrap();
        assert_eq!(value, "b");
        assert!(rebuilt);
    }
}
