use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use super::ObjectStore;

/// An S3 bucket accessed through the AWS SDK.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| {
                format!("ListObjectsV2 failed for s3://{}/{}", self.bucket, prefix)
            })?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );
        }

        keys.sort();
        Ok(keys)
    }

    async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .delimiter("/")
            .into_paginator()
            .send();

        let mut dirs = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| {
                format!("ListObjectsV2 failed for s3://{}/{}", self.bucket, prefix)
            })?;
            dirs.extend(page.common_prefixes().iter().filter_map(|cp| {
                cp.prefix()
                    .and_then(|p| p.strip_prefix(prefix))
                    .map(|p| p.trim_end_matches('/').to_string())
            }));
        }

        dirs.sort();
        Ok(dirs)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(None);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("GetObject failed for s3://{}/{}", self.bucket, key));
            }
        };

        let body = resp
            .body
            .collect()
            .await
            .with_context(|| format!("failed reading body of s3://{}/{}", self.bucket, key))?;
        Ok(Some(body.into_bytes()))
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<()> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body));

        if key.ends_with(".json") {
            req = req.content_type("application/json");
        } else if key.ends_with(".csv") {
            req = req.content_type("text/csv");
        }

        req.send()
            .await
            .with_context(|| format!("PutObject failed for s3://{}/{}", self.bucket, key))?;
        Ok(())
    }
}
