//! S3-compatible backend. Endpoint defaults to AWS for the configured
//! region; custom endpoints use path-style addressing and an `http://`
//! prefix disables TLS. Dumps stream in as multipart uploads because the
//! total length is unknown while `pg_dump` is still running.

use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_smithy_types::byte_stream::ByteStream;
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use super::{StorageError, StorageReader};

/// Parts must be at least 5 MiB everywhere but the tail; 8 MiB keeps the
/// buffer bounded while staying well clear of the 10 000-part limit.
const PART_SIZE: usize = 8 * 1024 * 1024;

const BUCKET_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct S3Storage {
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: Option<String>,
}

impl S3Storage {
    /// Endpoint URL and whether path-style addressing applies. An empty
    /// endpoint means AWS itself (vhost style); anything custom is
    /// addressed path-style, with TLS unless the scheme says `http://`.
    pub fn resolve_endpoint(&self) -> (String, bool) {
        let raw = self.endpoint.as_deref().unwrap_or("").trim();
        if raw.is_empty() {
            return (format!("https://s3.{}.amazonaws.com", self.region), false);
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            (raw.to_string(), true)
        } else {
            (format!("https://{raw}"), true)
        }
    }

    fn client(&self) -> Client {
        let (endpoint_url, path_style) = self.resolve_endpoint();
        let credentials = Credentials::new(
            self.access_key.clone(),
            self.secret_key.clone(),
            None,
            None,
            "steward",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .endpoint_url(endpoint_url)
            .force_path_style(path_style)
            .credentials_provider(credentials)
            .build();
        Client::from_conf(config)
    }

    pub async fn put<R>(&self, id: Uuid, mut reader: R) -> Result<(), StorageError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let client = self.client();
        let key = id.to_string();

        let first = read_chunk(&mut reader, PART_SIZE).await?;
        if first.len() < PART_SIZE {
            // Whole object fit in one buffer; a plain put overwrites natively.
            client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(StorageError::transport)?;
            return Ok(());
        }

        let created = client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(StorageError::transport)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::transport("S3 returned no multipart upload id"))?
            .to_string();

        match self
            .upload_parts(&client, &key, &upload_id, first, reader)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(abort_err) = client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("Failed to abort S3 multipart upload {}: {}", key, abort_err);
                }
                Err(e)
            }
        }
    }

    async fn upload_parts<R>(
        &self,
        client: &Client,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        mut reader: R,
    ) -> Result<(), StorageError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;
        let mut chunk = first;

        loop {
            let etag = client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(StorageError::transport)?
                .e_tag()
                .unwrap_or_default()
                .to_string();

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build(),
            );

            chunk = read_chunk(&mut reader, PART_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            part_number += 1;
        }

        client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(StorageError::transport)?;

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<StorageReader, StorageError> {
        let client = self.client();
        let resp = client
            .get_object()
            .bucket(&self.bucket)
            .key(id.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_no_such_key()) == Some(true) {
                    StorageError::NotFound(id)
                } else {
                    StorageError::transport(e)
                }
            })?;

        Ok(Box::new(resp.body.into_async_read()))
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        let client = self.client();
        // DeleteObject succeeds for absent keys, which is exactly the
        // idempotency the retention loop needs.
        client
            .delete_object()
            .bucket(&self.bucket)
            .key(id.to_string())
            .send()
            .await
            .map_err(StorageError::transport)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.bucket.is_empty() {
            return Err(StorageError::validation("S3 bucket is required"));
        }
        if self.region.is_empty() {
            return Err(StorageError::validation("S3 region is required"));
        }
        if self.access_key.is_empty() {
            return Err(StorageError::validation("S3 access key is required"));
        }
        if self.secret_key.is_empty() {
            return Err(StorageError::validation("S3 secret key is required"));
        }
        Ok(())
    }

    /// Connection test: the bucket must answer within ten seconds.
    pub async fn probe(&self) -> Result<(), StorageError> {
        let client = self.client();
        let head = client.head_bucket().bucket(&self.bucket).send();

        match tokio::time::timeout(BUCKET_PROBE_TIMEOUT, head).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(StorageError::transport(format!(
                "bucket '{}' is not accessible: {}",
                self.bucket, e
            ))),
            Err(_) => Err(StorageError::transport(
                "failed to connect to the bucket within 10 seconds, check the endpoint and region",
            )),
        }
    }
}

/// Reads up to `limit` bytes, short only at end of stream.
async fn read_chunk<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, StorageError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = Vec::with_capacity(limit.min(64 * 1024));
    let mut buf = vec![0u8; 32 * 1024];
    while chunk.len() < limit {
        let want = buf.len().min(limit - chunk.len());
        let read = reader.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        chunk.extend_from_slice(&buf[..read]);
    }
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(endpoint: Option<&str>) -> S3Storage {
        S3Storage {
            bucket: "backups".to_string(),
            region: "eu-central-1".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            endpoint: endpoint.map(str::to_string),
        }
    }

    #[test]
    fn empty_endpoint_defaults_to_aws_vhost_style() {
        let (url, path_style) = storage(None).resolve_endpoint();
        assert_eq!(url, "https://s3.eu-central-1.amazonaws.com");
        assert!(!path_style);

        let (url, _) = storage(Some("")).resolve_endpoint();
        assert_eq!(url, "https://s3.eu-central-1.amazonaws.com");
    }

    #[test]
    fn http_prefix_disables_tls_and_forces_path_style() {
        let (url, path_style) = storage(Some("http://minio.internal:9000")).resolve_endpoint();
        assert_eq!(url, "http://minio.internal:9000");
        assert!(path_style);
    }

    #[test]
    fn bare_host_gets_https_scheme() {
        let (url, path_style) = storage(Some("storage.example.com")).resolve_endpoint();
        assert_eq!(url, "https://storage.example.com");
        assert!(path_style);
    }

    #[test]
    fn validate_requires_all_credentials() {
        assert!(storage(None).validate().is_ok());

        let mut missing = storage(None);
        missing.secret_key.clear();
        assert!(missing.validate().is_err());

        let mut missing = storage(None);
        missing.bucket.clear();
        assert!(missing.validate().is_err());
    }

    #[tokio::test]
    async fn read_chunk_stops_at_limit_and_eof() {
        let data = vec![1u8; 100_000];
        let mut cursor = std::io::Cursor::new(data);

        let chunk = read_chunk(&mut cursor, 64 * 1024).await.unwrap();
        assert_eq!(chunk.len(), 64 * 1024);

        let rest = read_chunk(&mut cursor, 64 * 1024).await.unwrap();
        assert_eq!(rest.len(), 100_000 - 64 * 1024);

        let empty = read_chunk(&mut cursor, 64 * 1024).await.unwrap();
        assert!(empty.is_empty());
    }
}
