//! File-backed key/value store with compare-and-swap.
//!
//! Driver metadata (network configs, endpoints) persists through this
//! store. Every write bumps a store-wide monotonic index; the index a
//! reader observed is its CAS token for [`FileStore::atomic_put`] and
//! [`FileStore::atomic_delete`]. Values are stored prefixed by 8 bytes of
//! little-endian index, so the token survives a round-trip through the
//! backing file unchanged.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use keel_common::{KeelError, KeelResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A key/value pair together with the index observed when it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    /// The key.
    pub key: String,
    /// The stored value (without the index prefix).
    pub value: Vec<u8>,
    /// Store index at the time this pair was written.
    pub last_index: u64,
}

/// On-disk image of the store. Entries hold the index-prefixed value,
/// base64-encoded so the file stays a valid JSON document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DiskImage {
    index: u64,
    entries: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    /// Key -> index-prefixed value bytes.
    entries: BTreeMap<String, Vec<u8>>,
    index: u64,
    open: bool,
}

/// Transactional local durable map backing driver metadata.
///
/// A single in-process mutex guards all operations; `atomic_*` observe the
/// current index snapshot under that mutex, so for any pair of concurrent
/// CAS writes against the same token exactly one succeeds.
#[derive(Debug)]
pub struct FileStore {
    inner: Mutex<Inner>,
}

impl FileStore {
    /// Open (or create) a store backed by `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file exists but cannot be read or
    /// parsed.
    pub fn open(path: impl AsRef<Path>) -> KeelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let image = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_json::from_str::<DiskImage>(&data)?
        } else {
            DiskImage::default()
        };

        let mut entries = BTreeMap::new();
        for (key, blob) in image.entries {
            let bytes = BASE64
                .decode(blob.as_bytes())
                .map_err(|e| KeelError::Serialization(format!("corrupt entry {key}: {e}")))?;
            if bytes.len() < 8 {
                return Err(KeelError::Serialization(format!(
                    "corrupt entry {key}: shorter than index prefix"
                )));
            }
            entries.insert(key, bytes);
        }

        tracing::debug!(path = %path.display(), entries = entries.len(), "Opened store");

        Ok(Self {
            inner: Mutex::new(Inner {
                path,
                entries,
                index: image.index,
                open: true,
            }),
        })
    }

    /// Write `value` under `key`, returning the new store index.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or persisting fails.
    pub fn put(&self, key: &str, value: &[u8]) -> KeelResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let index = inner.next_index();
        inner.entries.insert(key.to_string(), encode(index, value));
        inner.persist()?;
        Ok(index)
    }

    /// Whether `key` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed.
    pub fn exists(&self, key: &str) -> KeelResult<bool> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.entries.contains_key(key))
    }

    /// Read the pair stored under `key`.
    ///
    /// # Errors
    ///
    /// [`KeelError::KeyNotFound`] if the key is absent.
    pub fn get(&self, key: &str) -> KeelResult<KvPair> {
        let inner = self.inner.lock();
        inner.check_open()?;
        inner
            .entries
            .get(key)
            .map(|blob| decode(key, blob))
            .ok_or_else(|| KeelError::KeyNotFound {
                key: key.to_string(),
            })
    }

    /// All pairs whose key starts with `prefix`, in lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed.
    pub fn list(&self, prefix: &str) -> KeelResult<Vec<KvPair>> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, blob)| decode(k, blob))
            .collect())
    }

    /// Compare-and-swap write.
    ///
    /// With `previous == None` the key must not exist; otherwise the stored
    /// index must equal `previous.last_index`.
    ///
    /// # Errors
    ///
    /// [`KeelError::KeyExists`] when `previous` is `None` but the key is
    /// present; [`KeelError::KeyModified`] when the index does not match.
    pub fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
    ) -> KeelResult<KvPair> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        match (previous, inner.entries.get(key)) {
            (None, Some(_)) => {
                return Err(KeelError::KeyExists {
                    key: key.to_string(),
                });
            }
            (Some(prev), Some(blob)) => {
                if stored_index(blob) != prev.last_index {
                    return Err(KeelError::KeyModified {
                        key: key.to_string(),
                    });
                }
            }
            (Some(_), None) => {
                return Err(KeelError::KeyModified {
                    key: key.to_string(),
                });
            }
            (None, None) => {}
        }

        let index = inner.next_index();
        inner.entries.insert(key.to_string(), encode(index, value));
        inner.persist()?;

        Ok(KvPair {
            key: key.to_string(),
            value: value.to_vec(),
            last_index: index,
        })
    }

    /// Compare-and-swap delete.
    ///
    /// # Errors
    ///
    /// [`KeelError::KeyNotFound`] if the key is absent,
    /// [`KeelError::KeyModified`] if the stored index differs from
    /// `previous.last_index`.
    pub fn atomic_delete(&self, key: &str, previous: &KvPair) -> KeelResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        match inner.entries.get(key) {
            None => {
                return Err(KeelError::KeyNotFound {
                    key: key.to_string(),
                });
            }
            Some(blob) if stored_index(blob) != previous.last_index => {
                return Err(KeelError::KeyModified {
                    key: key.to_string(),
                });
            }
            Some(_) => {}
        }

        inner.entries.remove(key);
        inner.persist()
    }

    /// Unconditional delete. Removing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or persisting fails.
    pub fn delete(&self, key: &str) -> KeelResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if inner.entries.remove(key).is_some() {
            inner.persist()?;
        }
        Ok(())
    }

    /// Release the backing handle. The store may be reopened with
    /// [`FileStore::open`]; operations on a closed store fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.open = false;
        tracing::debug!(path = %inner.path.display(), "Closed store");
    }
}

impl Inner {
    fn check_open(&self) -> KeelResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(KeelError::internal("store is closed"))
        }
    }

    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// Rewrite the backing file atomically: serialize to a temp file in the
    /// same directory, then rename over the target.
    fn persist(&self) -> KeelResult<()> {
        let image = DiskImage {
            index: self.index,
            entries: self
                .entries
                .iter()
                .map(|(k, blob)| (k.clone(), BASE64.encode(blob)))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&image)?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.path)
            .map_err(|e| KeelError::internal(format!("persist store: {e}")))?;
        Ok(())
    }
}

fn encode(index: u64, value: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(8 + value.len());
    blob.extend_from_slice(&index.to_le_bytes());
    blob.extend_from_slice(value);
    blob
}

fn stored_index(blob: &[u8]) -> u64 {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&blob[..8]);
    u64::from_le_bytes(prefix)
}

fn decode(key: &str, blob: &[u8]) -> KvPair {
    KvPair {
        key: key.to_string(),
        value: blob[8..].to_vec(),
        last_index: stored_index(blob),
    }
}
