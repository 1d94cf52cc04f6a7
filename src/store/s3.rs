//! S3-based storage backend.
//!
//! Lets several machines share one plan store: a plan generated on a laptop
//! can be applied from CI. Write-once semantics rely on S3 conditional
//! writes (`If-None-Match: *`).

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::Client;
use tracing::debug;

use crate::error::{Result, StoreError};

use super::backend::StorageBackend;

/// Error codes S3 returns when a conditional write loses.
const CONDITIONAL_WRITE_CODES: [&str; 2] = ["PreconditionFailed", "ConditionalRequestConflict"];

/// S3-based storage backend.
#[derive(Debug, Clone)]
pub struct S3Backend {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix (empty or ending in '/').
    prefix: String,
}

impl S3Backend {
    /// Creates a new S3 backend using the AWS default credential chain.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 backend with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a store key.
    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Puts an object, optionally only if the key is free.
    async fn put(&self, key: &str, content: &[u8], if_absent: bool) -> Result<()> {
        let full_key = self.key(key);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(content.to_vec().into())
            .content_type("application/json");
        if if_absent {
            request = request.if_none_match("*");
        }

        match request.send().await {
            Ok(_) => {
                debug!("Wrote s3://{}/{full_key}", self.bucket);
                Ok(())
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if if_absent
                    && service_err
                        .code()
                        .is_some_and(|code| CONDITIONAL_WRITE_CODES.contains(&code))
                {
                    Err(StoreError::AlreadyExists {
                        identifier: key.to_string(),
                    }
                    .into())
                } else {
                    Err(StoreError::s3(format!("S3 put error on {full_key}: {service_err}")).into())
                }
            }
        }
    }
}

/// Normalizes a key prefix to be empty or end with exactly one '/'.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full_key = self.key(key);
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StoreError::s3(format!("Failed to read s3://{}/{full_key}: {e}", self.bucket))
                })?;
                Ok(Some(bytes.to_vec()))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    debug!("No object at s3://{}/{full_key}", self.bucket);
                    Ok(None)
                } else {
                    Err(StoreError::s3(format!("S3 get error on {full_key}: {service_err}")).into())
                }
            }
        }
    }

    async fn create(&self, key: &str, content: &[u8]) -> Result<()> {
        self.put(key, content, true).await
    }

    async fn replace(&self, key: &str, content: &[u8]) -> Result<()> {
        self.put(key, content, false).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| StoreError::s3(format!("S3 delete error on {full_key}: {e}")))?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.key(key);
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StoreError::s3(format!("S3 head error on {full_key}: {service_err}")).into())
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.key(prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StoreError::s3(format!("S3 list error on {full_prefix}: {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter_map(|key| key.strip_prefix(&self.prefix))
                    .map(ToString::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        Client::from_conf(config)
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("team/iac")), "team/iac/");
        assert_eq!(normalize_prefix(Some("/team/iac/")), "team/iac/");
    }

    #[test]
    fn test_keys_and_location() {
        let backend = S3Backend::with_client(test_client(), "plans-bucket", Some("prod"));
        assert_eq!(backend.key("plans/web.json"), "prod/plans/web.json");
        assert_eq!(backend.location(), "s3://plans-bucket/prod/");
        assert_eq!(backend.backend_type(), "s3");
    }
}
