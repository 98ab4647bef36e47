//! Durable, sharded blob cache keyed by resource locator.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<h0>/<h0h1>/<hash>         cached body
//! <root>/<h0>/<h0h1>/<hash>.error   permanent failure marker (reason text)
//! ```
//!
//! Older crawls stored entries flat (`<root>/<hash>`) or one level deep
//! (`<root>/<h0>/<hash>`). Lookups move such entries into the current layout
//! before anything else happens.

use md5::{Digest, Md5};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{Span, debug, warn};

use crate::Result;

const SENTINEL_SUFFIX: &str = ".error";
const PARTIAL_PREFIX: &str = ".partial-";
const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Hex-encoded 128-bit digest of a resource locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_locator(locator: &str) -> Self {
        Self(hex::encode(Md5::digest(locator.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn sentinel_name(&self) -> String {
        format!("{}{SENTINEL_SUFFIX}", self.0)
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(Vec<u8>),
    NotFound,
    PermanentError(String),
}

pub struct ContentCache {
    root: PathBuf,
    span: Span,
}

impl ContentCache {
    /// Opens (and lays out) a cache rooted at `root`.
    ///
    /// Temporary files left by a killed writer are removed. Only one process
    /// may use a cache directory at a time.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let mut swept = 0;
        for first in HEX_DIGITS {
            for second in HEX_DIGITS {
                let first = char::from(*first);
                let second = char::from(*second);
                let shard = root.join(first.to_string()).join(format!("{first}{second}"));
                fs::create_dir_all(&shard)?;
                swept += sweep_partials(&shard)?;
            }
        }

        let cache = Self {
            root,
            span: Span::current(),
        };
        if swept > 0 {
            debug!(parent: &cache.span, swept, "removed interrupted writes");
        }
        Ok(cache)
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_dir(&self, key: &CacheKey) -> PathBuf {
        let hash = key.as_str();
        self.root.join(&hash[..1]).join(&hash[..2])
    }

    pub fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.shard_dir(key).join(key.as_str())
    }

    pub fn sentinel_path(&self, key: &CacheKey) -> PathBuf {
        self.shard_dir(key).join(key.sentinel_name())
    }

    /// Directories used by earlier layouts, most recent first.
    fn legacy_dirs(&self, key: &CacheKey) -> [PathBuf; 2] {
        [self.root.join(&key.as_str()[..1]), self.root.clone()]
    }

    /// Moves blob and sentinel from any legacy location into the shard
    /// directory. An entry already at the current path wins over legacy copies.
    fn migrate(&self, key: &CacheKey) -> Result<()> {
        let shard = self.shard_dir(key);
        for name in [key.as_str().to_string(), key.sentinel_name()] {
            let current = shard.join(&name);
            for dir in self.legacy_dirs(key) {
                let legacy = dir.join(&name);
                if !legacy.is_file() {
                    continue;
                }
                if current.exists() {
                    debug!(parent: &self.span, path = %legacy.display(), "dropping stale legacy cache entry");
                    fs::remove_file(&legacy)?;
                } else {
                    debug!(parent: &self.span, from = %legacy.display(), to = %current.display(), "migrating cache entry");
                    fs::rename(&legacy, &current)?;
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, locator: &str) -> Result<CacheLookup> {
        let key = CacheKey::for_locator(locator);
        self.migrate(&key)?;

        let sentinel = self.sentinel_path(&key);
        if sentinel.is_file() {
            let reason = fs::read_to_string(&sentinel)?;
            return Ok(CacheLookup::PermanentError(reason.trim().to_string()));
        }

        match fs::read(self.data_path(&key)) {
            Ok(bytes) if !bytes.is_empty() => Ok(CacheLookup::Hit(bytes)),
            Ok(_) => Ok(CacheLookup::NotFound),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CacheLookup::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Stores `bytes` for `locator`. Readers see either the previous blob or
    /// the complete new one.
    pub fn put(&self, locator: &str, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer(locator)?;
        writer.write_chunk(bytes)?;
        writer.commit()?;
        Ok(())
    }

    /// Starts a streamed write. Nothing becomes visible until
    /// [`CacheWriter::commit`]; dropping the writer discards the data.
    pub fn writer(&self, locator: &str) -> Result<CacheWriter> {
        let key = CacheKey::for_locator(locator);
        let shard = self.shard_dir(&key);
        fs::create_dir_all(&shard)?;
        let file = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(&shard)?;

        Ok(CacheWriter {
            file,
            dest: self.data_path(&key),
            written: 0,
        })
    }

    pub fn mark_permanent_error(&self, locator: &str, reason: &str) -> Result<()> {
        let key = CacheKey::for_locator(locator);
        let shard = self.shard_dir(&key);
        fs::create_dir_all(&shard)?;

        let mut file = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(&shard)?;
        file.write_all(reason.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(self.sentinel_path(&key))
            .map_err(|e| e.error)?;

        warn!(parent: &self.span, url = locator, reason, "marked permanent error");
        Ok(())
    }

    pub fn clear_permanent_error(&self, locator: &str) -> Result<()> {
        let key = CacheKey::for_locator(locator);
        self.migrate(&key)?;
        remove_if_exists(&self.sentinel_path(&key))
    }

    /// Removes blob and sentinel, wherever they live.
    pub fn invalidate(&self, locator: &str) -> Result<()> {
        let key = CacheKey::for_locator(locator);
        self.migrate(&key)?;
        remove_if_exists(&self.data_path(&key))?;
        remove_if_exists(&self.sentinel_path(&key))?;
        debug!(parent: &self.span, url = locator, "invalidated cache entry");
        Ok(())
    }
}

fn sweep_partials(shard: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(shard)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
            remove_if_exists(&entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// In-progress blob written to a temporary file in the shard directory.
pub struct CacheWriter {
    file: NamedTempFile,
    dest: PathBuf,
    written: u64,
}

impl CacheWriter {
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes and renames the blob into place, returning its size. An empty
    /// body is discarded rather than stored.
    pub fn commit(mut self) -> Result<u64> {
        if self.written == 0 {
            return Ok(0);
        }
        self.file.flush()?;
        self.file.as_file().sync_all()?;
        self.file.persist(&self.dest).map_err(|e| e.error)?;
        Ok(self.written)
    }
}
