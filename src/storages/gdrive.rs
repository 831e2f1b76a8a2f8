//! Google Drive backend over the Drive v3 REST API. Authentication is the
//! OAuth2 refresh-token flow with the `drive.file` scope; objects are
//! looked up by name and duplicates are removed before every upload.

use std::io;
use std::pin::Pin;

use futures::{Stream, TryStreamExt};
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use super::{StorageError, StorageReader};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";

#[derive(Clone)]
pub struct GoogleDriveStorage {
    pub client_id: String,
    pub client_secret: String,
    /// OAuth2 token JSON as issued during account linking; must contain a
    /// refresh token, access tokens in it are treated as expired.
    pub token_json: String,
}

#[derive(Deserialize)]
struct StoredToken {
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
}

impl GoogleDriveStorage {
    fn refresh_token(&self) -> Result<String, StorageError> {
        let token: StoredToken = serde_json::from_str(&self.token_json)
            .map_err(|e| StorageError::validation(format!("token JSON is not valid: {e}")))?;
        token
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                StorageError::validation(
                    "token JSON contains no refresh token; re-authenticate the Google account",
                )
            })
    }

    async fn fetch_access_token(&self, http: &reqwest::Client) -> Result<String, StorageError> {
        let resp = http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", &self.refresh_token()?),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::transport(format!(
                "Google token refresh failed, re-authenticate the account: {body}"
            )));
        }

        let token: TokenResponse = resp.json().await?;
        Ok(token.access_token)
    }

    /// Lists file ids carrying the given name. Retries once with a freshly
    /// refreshed token when Drive answers 401.
    async fn list_ids_by_name(
        &self,
        http: &reqwest::Client,
        token: &mut String,
        name: &str,
    ) -> Result<Vec<String>, StorageError> {
        let query = format!("name = '{name}' and trashed = false");

        for attempt in 0..2 {
            let resp = http
                .get(FILES_URL)
                .query(&[("q", query.as_str()), ("fields", "files(id)")])
                .bearer_auth(&*token)
                .send()
                .await?;

            if resp.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                *token = self.fetch_access_token(http).await?;
                continue;
            }
            if !resp.status().is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(StorageError::transport(format!(
                    "Google Drive file lookup failed: {body}"
                )));
            }

            let list: FileList = resp.json().await?;
            return Ok(list.files.into_iter().map(|f| f.id).collect());
        }
        unreachable!("lookup loop always returns within two attempts")
    }

    async fn delete_ids(
        &self,
        http: &reqwest::Client,
        token: &mut String,
        ids: Vec<String>,
    ) -> Result<(), StorageError> {
        for file_id in ids {
            for attempt in 0..2 {
                let resp = http
                    .delete(format!("{FILES_URL}/{file_id}"))
                    .bearer_auth(&*token)
                    .send()
                    .await?;

                if resp.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                    *token = self.fetch_access_token(http).await?;
                    continue;
                }
                // 404 means someone else already removed it
                if !resp.status().is_success()
                    && resp.status() != reqwest::StatusCode::NOT_FOUND
                {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(StorageError::transport(format!(
                        "Google Drive delete failed: {body}"
                    )));
                }
                break;
            }
        }
        Ok(())
    }

    pub async fn put<R>(&self, id: Uuid, reader: R) -> Result<(), StorageError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let http = reqwest::Client::new();
        let mut token = self.fetch_access_token(&http).await?;
        let name = id.to_string();

        // Keep at most one object per logical file
        let stale = self.list_ids_by_name(&http, &mut token, &name).await?;
        self.delete_ids(&http, &mut token, stale).await?;

        // Resumable upload: session first, then the streamed media body
        let session = http
            .post(UPLOAD_URL)
            .query(&[("uploadType", "resumable")])
            .bearer_auth(&token)
            .header("X-Upload-Content-Type", "application/octet-stream")
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;

        if !session.status().is_success() {
            let body = session.text().await.unwrap_or_default();
            return Err(StorageError::transport(format!(
                "Google Drive upload session failed: {body}"
            )));
        }

        let upload_url = session
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                StorageError::transport("Google Drive returned no upload session location")
            })?
            .to_string();

        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        let resp = http
            .put(upload_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::transport(format!(
                "failed to upload file to Google Drive: {body}"
            )));
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<StorageReader, StorageError> {
        let http = reqwest::Client::new();
        let mut token = self.fetch_access_token(&http).await?;

        let ids = self
            .list_ids_by_name(&http, &mut token, &id.to_string())
            .await?;
        let file_id = ids.into_iter().next().ok_or(StorageError::NotFound(id))?;

        let resp = http
            .get(format!("{FILES_URL}/{file_id}"))
            .query(&[("alt", "media")])
            .bearer_auth(&token)
            .send()
            .await?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::transport(format!(
                "failed to download file from Google Drive: {body}"
            )));
        }

        let stream: Pin<Box<dyn Stream<Item = io::Result<bytes::Bytes>> + Send>> = Box::pin(
            resp.bytes_stream()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        );
        Ok(Box::new(StreamReader::new(stream)))
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        let http = reqwest::Client::new();
        let mut token = self.fetch_access_token(&http).await?;

        let ids = self
            .list_ids_by_name(&http, &mut token, &id.to_string())
            .await?;
        self.delete_ids(&http, &mut token, ids).await
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.client_id.is_empty() {
            return Err(StorageError::validation("client ID is required"));
        }
        if self.client_secret.is_empty() {
            return Err(StorageError::validation("client secret is required"));
        }
        if self.token_json.is_empty() {
            return Err(StorageError::validation("token JSON is required"));
        }
        // Tokens without a refresh token would strand us at the first expiry
        self.refresh_token()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(token_json: &str) -> GoogleDriveStorage {
        GoogleDriveStorage {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            token_json: token_json.to_string(),
        }
    }

    #[test]
    fn validate_requires_refresh_token() {
        let ok = storage(r#"{"access_token":"a","refresh_token":"r"}"#);
        assert!(ok.validate().is_ok());

        let missing = storage(r#"{"access_token":"a"}"#);
        assert!(missing.validate().is_err());

        let empty = storage(r#"{"access_token":"a","refresh_token":""}"#);
        assert!(empty.validate().is_err());

        let garbage = storage("not-json");
        assert!(garbage.validate().is_err());
    }

    #[test]
    fn validate_requires_client_credentials() {
        let mut s = storage(r#"{"refresh_token":"r"}"#);
        s.client_id.clear();
        assert!(s.validate().is_err());

        let mut s = storage(r#"{"refresh_token":"r"}"#);
        s.client_secret.clear();
        assert!(s.validate().is_err());
    }
}
