//! Key/value blob storage for publishing finished transcripts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::atomic_write_bytes;
use crate::checkpoint::plan::sha256_hex;
use crate::error::{Result, ScribeError};

const META_SUFFIX: &str = ".meta.json";

/// One stored object as reported by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobObject {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub etag: String,
}

pub trait BlobStore {
    /// Objects whose key starts with `prefix`, sorted by key.
    fn list(&self, prefix: &str) -> Result<Vec<BlobObject>>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    /// Store `bytes` under `key`, replacing any existing object. Returns the key.
    fn put(&self, key: &str, bytes: &[u8], metadata: &BTreeMap<String, String>)
        -> Result<String>;
    fn exists(&self, key: &str) -> Result<bool>;
    fn metadata(&self, key: &str) -> Result<BTreeMap<String, String>>;
    /// Server-side copy, metadata included.
    fn copy(&self, from: &str, to: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Put `bytes` at a staging key, then promote it to `key`.
///
/// Readers of `key` see either the previous object or the complete new one.
pub fn publish_atomic(
    store: &dyn BlobStore,
    key: &str,
    bytes: &[u8],
    metadata: &BTreeMap<String, String>,
) -> Result<String> {
    let staging = format!(
        "{key}.staging-{}",
        Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
    );
    store.put(&staging, bytes, metadata)?;
    store.copy(&staging, key)?;
    store.delete(&staging)?;
    info!("Published {}", key);
    Ok(key.to_string())
}

/// Publish a finished transcript under `<stem>.txt`, tagged with its hash.
pub fn publish_transcript(
    store: &dyn BlobStore,
    transcript: &Path,
    sha256: &str,
    source_uri: &str,
) -> Result<String> {
    let key = transcript
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ScribeError::Config(format!("Invalid transcript path {}", transcript.display()))
        })?;
    let bytes = fs::read(transcript)?;

    let mut metadata = BTreeMap::new();
    metadata.insert("sha256".to_string(), sha256.to_string());
    metadata.insert("source".to_string(), source_uri.to_string());
    publish_atomic(store, &key, &bytes, &metadata)
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    etag: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

/// [`BlobStore`] over a local directory; metadata lives in a JSON sidecar per object.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with(META_SUFFIX)
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ScribeError::Config(format!("Invalid blob key: {key}")));
        }
        Ok(self.root.join(relative))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }

    fn read_sidecar(path: &Path) -> Result<Option<Sidecar>> {
        match fs::read_to_string(Self::sidecar_path(path)) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn collect(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.collect(&path, out)?;
            } else if !path.to_string_lossy().ends_with(META_SUFFIX) {
                out.push(path);
            }
        }
        Ok(())
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

impl BlobStore for LocalBlobStore {
    fn list(&self, prefix: &str) -> Result<Vec<BlobObject>> {
        let mut paths = Vec::new();
        self.collect(&self.root, &mut paths)?;

        let mut objects = Vec::new();
        for path in paths {
            let Some(key) = self.key_for(&path) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let meta = fs::metadata(&path)?;
            let etag = match Self::read_sidecar(&path)? {
                Some(sidecar) => sidecar.etag,
                None => sha256_hex(&fs::read(&path)?),
            };
            objects.push(BlobObject {
                key,
                size: meta.len(),
                modified: DateTime::<Utc>::from(meta.modified()?),
                etag,
            });
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ScribeError::FileNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let sidecar = Sidecar {
            etag: sha256_hex(bytes),
            metadata: metadata.clone(),
        };
        atomic_write_bytes(&path, bytes)?;
        atomic_write_bytes(
            &Self::sidecar_path(&path),
            serde_json::to_string_pretty(&sidecar)?.as_bytes(),
        )?;
        debug!("Stored blob {} ({} bytes)", key, bytes.len());
        Ok(key.to_string())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key)?.is_file())
    }

    fn metadata(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let path = self.object_path(key)?;
        if !path.is_file() {
            return Err(ScribeError::FileNotFound(key.to_string()));
        }
        Ok(Self::read_sidecar(&path)?
            .map(|s| s.metadata)
            .unwrap_or_default())
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let bytes = self.get(from)?;
        let metadata = self.metadata(from)?;
        self.put(to, &bytes, &metadata)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        for target in [Self::sidecar_path(&path), path] {
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_put_get_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();

        assert!(!store.exists("talks/a.txt").unwrap());
        store
            .put("talks/a.txt", b"hello", &tags(&[("lang", "en")]))
            .unwrap();

        assert!(store.exists("talks/a.txt").unwrap());
        assert_eq!(store.get("talks/a.txt").unwrap(), b"hello");
        assert_eq!(store.metadata("talks/a.txt").unwrap(), tags(&[("lang", "en")]));
        assert!(matches!(
            store.get("talks/missing.txt"),
            Err(ScribeError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        store.put("talks/b.txt", b"bb", &BTreeMap::new()).unwrap();
        store.put("talks/a.txt", b"a", &BTreeMap::new()).unwrap();
        store.put("other/c.txt", b"c", &BTreeMap::new()).unwrap();

        let listed = store.list("talks/").unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["talks/a.txt", "talks/b.txt"]);
        assert_eq!(listed[1].size, 2);
        assert_eq!(listed[0].etag, sha256_hex(b"a"));
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        assert!(store.put("../evil.txt", b"x", &BTreeMap::new()).is_err());
        assert!(store.put("/etc/evil.txt", b"x", &BTreeMap::new()).is_err());
        assert!(store.exists("").is_err());
    }

    #[test]
    fn test_publish_leaves_no_staging_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("published")).unwrap();
        let transcript = dir.path().join("talk.txt");
        fs::write(&transcript, "a\nb").unwrap();

        let key = publish_transcript(&store, &transcript, "abc", "/media/talk.mp4").unwrap();

        assert_eq!(key, "talk.txt");
        assert_eq!(store.get("talk.txt").unwrap(), b"a\nb");
        assert_eq!(store.metadata("talk.txt").unwrap()["sha256"], "abc");
        let keys: Vec<_> = store.list("").unwrap().into_iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!["talk.txt"]);
    }
}
