use anyhow::{Context, Result};
use bytes::Bytes;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::ObjectStore;

/// A directory on the local filesystem used as a bucket.
///
/// Keys map to paths relative to the root; `/` is the separator on every platform.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Creates the store, creating the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key below the root. `.` and `..` segments are rejected so a key
    /// can never address anything outside the root.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in key.split('/').filter(|part| !part.is_empty()) {
            if part == "." || part == ".." {
                anyhow::bail!("key `{key}` contains a `{part}` segment");
            }
            path.push(part);
        }
        Ok(path)
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(key);
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl ObjectStore for LocalStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Only walk the deepest directory fully named by the prefix.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = self.path_for(dir_part)?;
        if !tokio::fs::metadata(&start).await.is_ok_and(|m| m.is_dir()) {
            return Ok(Vec::new());
        }

        let root = self.root.clone();
        let mut keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            walk(&root, &start, &mut keys)
                .with_context(|| format!("failed to list {}", start.display()))?;
            Ok::<_, anyhow::Error>(keys)
        })
        .await??;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(Bytes::from(body))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &body).await.with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_root(name: &str) -> PathBuf {
        let root = env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&root); // clean up any prior run
        root
    }

    #[tokio::test]
    async fn test_put_then_list_and_get() {
        let root = temp_root("telemetry_lake_local_store");
        let store = LocalStore::new(&root).unwrap();

        store
            .put("0BFD7754/00000001/00000001.MF4", Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .put("0BFD7754/00000002/00000001.MF4", Bytes::from_static(b"b"))
            .await
            .unwrap();

        let keys = store.list("0BFD7754/00000001/").await.unwrap();
        assert_eq!(keys, vec!["0BFD7754/00000001/00000001.MF4"]);

        let all = store.list("0BFD").await.unwrap();
        assert_eq!(all.len(), 2);

        let body = store.get("0BFD7754/00000002/00000001.MF4").await.unwrap();
        assert_eq!(body.unwrap(), "b");

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let root = temp_root("telemetry_lake_local_store_escape");
        let store = LocalStore::new(root.join("lake")).unwrap();
        fs::write(root.join("secret.MF4"), "outside").unwrap();

        assert!(store.get("../secret.MF4").await.is_err());
        assert!(store.get("a/./b.MF4").await.is_err());
        assert!(store.put("../x/y/z.MF4", Bytes::from_static(b"x")).await.is_err());
        assert!(store.list("../").await.is_err());
        assert!(!root.join("x").exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_missing_prefix_and_key() {
        let root = temp_root("telemetry_lake_local_store_missing");
        let store = LocalStore::new(&root).unwrap();

        assert!(store.list("nothing/here/").await.unwrap().is_empty());
        assert!(store.get("backlog.json").await.unwrap().is_none());

        fs::remove_dir_all(&root).unwrap();
    }
}
