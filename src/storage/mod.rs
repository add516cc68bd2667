//! Object storage adapters.
//!
//! The engines only ever see an [`ObjectStore`]: a flat key space with
//! `/`-separated keys. [`LocalStore`] maps keys onto a directory tree,
//! [`S3Store`] onto an S3 bucket and [`MemoryStore`] keeps everything in a map.

mod local;
mod memory;
mod s3;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

use anyhow::Result;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Minimal list/get/put surface over a bucket-like store.
///
/// Calls are never retried here; a failure is surfaced to the caller.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns every key that starts with `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Fetches an object body, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Writes (or overwrites) an object.
    async fn put(&self, key: &str, body: Bytes) -> Result<()>;

    /// Immediate child "directories" of `prefix`, sorted and without the
    /// trailing `/`. `prefix` is empty or ends with `/`.
    async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>> {
        let mut dirs = BTreeSet::new();
        for key in self.list(prefix).await? {
            if let Some((dir, _)) = key.strip_prefix(prefix).and_then(|rest| rest.split_once('/')) {
                dirs.insert(dir.to_string());
            }
        }
        Ok(dirs.into_iter().collect())
    }
}

/// Opens a store from a location string.
///
/// `s3://bucket` selects S3 using the ambient AWS configuration; anything else
/// is treated as a local directory.
pub async fn open(location: &str) -> Result<Arc<dyn ObjectStore>> {
    if let Some(bucket) = location.strip_prefix("s3://") {
        let bucket = bucket.trim_end_matches('/');
        if bucket.is_empty() {
            anyhow::bail!("S3 location `{location}` has no bucket name");
        }
        let config = aws_config::load_from_env().await;
        Ok(Arc::new(S3Store::new(aws_sdk_s3::Client::new(&config), bucket)))
    } else {
        Ok(Arc::new(LocalStore::new(location)?))
    }
}

/// Derives the default output location for decoded files: `<input>-parquet`.
pub fn output_location(input: &str) -> String {
    format!("{}-parquet", input.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_location_appends_suffix() {
        assert_eq!(output_location("s3://fleet/"), "s3://fleet-parquet");
        assert_eq!(output_location("data/input"), "data/input-parquet");
    }

    #[tokio::test]
    async fn test_list_dirs_from_flat_keys() {
        let store = MemoryStore::with_objects([
            ("AAAAAAAA/Gnss/2024/01/02/a.csv", "x"),
            ("AAAAAAAA/Odo/2024/01/02/a.csv", "x"),
            ("BBBBBBBB/Gnss/2024/01/02/a.csv", "x"),
            ("aggregations.json", "{}"),
        ]);

        assert_eq!(store.list_dirs("").await.unwrap(), vec!["AAAAAAAA", "BBBBBBBB"]);
        assert_eq!(store.list_dirs("AAAAAAAA/").await.unwrap(), vec!["Gnss", "Odo"]);
    }

    #[tokio::test]
    async fn test_open_rejects_empty_bucket() {
        assert!(open("s3://").await.is_err());
    }
}
