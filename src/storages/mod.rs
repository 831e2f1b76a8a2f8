//! Storage backends: a uniform put/get/delete/probe contract over local
//! disk, S3-compatible object stores, Google Drive and SMB shares. Every
//! artefact is an opaque byte stream keyed by its backup UUID.

pub mod gdrive;
pub mod local;
pub mod nas;
pub mod s3;

use std::fmt;
use std::path::PathBuf;

use log::info;
use sqlx::PgPool;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::errors::StewardError;
use gdrive::GoogleDriveStorage;
use local::LocalStorage;
use nas::NasStorage;
use s3::S3Storage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(Uuid),

    #[error("invalid storage configuration: {0}")]
    Validation(String),

    #[error("storage transport error: {0}")]
    Transport(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn transport(msg: impl fmt::Display) -> Self {
        StorageError::Transport(msg.to_string())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        StorageError::Validation(msg.into())
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Transport(e.to_string())
    }
}

/// Directories the filesystem-backed storages operate under. Shared by all
/// tasks; callers isolate themselves with per-task file names.
#[derive(Clone, Debug)]
pub struct StorageDirs {
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub nas_mount_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    S3,
    GoogleDrive,
    Nas,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageKind::Local => "LOCAL",
            StorageKind::S3 => "S3",
            StorageKind::GoogleDrive => "GOOGLE_DRIVE",
            StorageKind::Nas => "NAS",
        };
        f.write_str(s)
    }
}

impl TryFrom<String> for StorageKind {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "LOCAL" => Ok(StorageKind::Local),
            "S3" => Ok(StorageKind::S3),
            "GOOGLE_DRIVE" => Ok(StorageKind::GoogleDrive),
            "NAS" => Ok(StorageKind::Nas),
            other => Err(StewardError::validation(format!(
                "unknown storage kind: {other}"
            ))),
        }
    }
}

/// One variant per backend kind, all exposing the same capability set.
#[derive(Clone)]
pub enum StorageBackend {
    Local(LocalStorage),
    S3(S3Storage),
    GoogleDrive(GoogleDriveStorage),
    Nas(NasStorage),
}

/// Streaming reader handed back by `get`; concrete type depends on the
/// backend but always releases its transport resources on drop.
pub type StorageReader = Box<dyn AsyncRead + Send + Unpin>;

impl StorageBackend {
    pub fn kind(&self) -> StorageKind {
        match self {
            StorageBackend::Local(_) => StorageKind::Local,
            StorageBackend::S3(_) => StorageKind::S3,
            StorageBackend::GoogleDrive(_) => StorageKind::GoogleDrive,
            StorageBackend::Nas(_) => StorageKind::Nas,
        }
    }

    /// Consumes the entire reader and persists it keyed by `id`,
    /// overwriting any prior object with the same key.
    pub async fn put<R>(&self, id: Uuid, reader: R) -> Result<(), StorageError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        match self {
            StorageBackend::Local(b) => b.put(id, reader).await,
            StorageBackend::S3(b) => b.put(id, reader).await,
            StorageBackend::GoogleDrive(b) => b.put(id, reader).await,
            StorageBackend::Nas(b) => b.put(id, reader).await,
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<StorageReader, StorageError> {
        match self {
            StorageBackend::Local(b) => b.get(id).await,
            StorageBackend::S3(b) => b.get(id).await,
            StorageBackend::GoogleDrive(b) => b.get(id).await,
            StorageBackend::Nas(b) => b.get(id).await,
        }
    }

    /// Idempotent: deleting an absent object is a success.
    pub async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        match self {
            StorageBackend::Local(b) => b.delete(id).await,
            StorageBackend::S3(b) => b.delete(id).await,
            StorageBackend::GoogleDrive(b) => b.delete(id).await,
            StorageBackend::Nas(b) => b.delete(id).await,
        }
    }

    /// Structural completeness of the persisted configuration.
    pub fn validate(&self) -> Result<(), StorageError> {
        match self {
            StorageBackend::Local(b) => b.validate(),
            StorageBackend::S3(b) => b.validate(),
            StorageBackend::GoogleDrive(b) => b.validate(),
            StorageBackend::Nas(b) => b.validate(),
        }
    }

    /// Backs the "test connection" operation. S3 checks bucket existence
    /// within a 10-second deadline; the other backends write a tiny object
    /// under a fresh random key, read it back, compare and delete it.
    pub async fn probe(&self) -> Result<(), StorageError> {
        match self {
            StorageBackend::S3(b) => b.probe().await,
            StorageBackend::Nas(b) => {
                b.probe_reachability().await?;
                self.probe_roundtrip().await
            }
            _ => self.probe_roundtrip().await,
        }
    }

    async fn probe_roundtrip(&self) -> Result<(), StorageError> {
        let key = Uuid::new_v4();
        let payload: &[u8] = b"steward-connection-probe";

        self.put(key, payload).await?;

        let mut reader = self.get(key).await?;
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).await?;
        drop(reader);

        self.delete(key).await?;

        if read_back != payload {
            return Err(StorageError::transport(
                "probe object read back with different contents",
            ));
        }
        Ok(())
    }
}

/// A configured storage destination owned by a user. The backend variant
/// is loaded from the kind-specific table keyed by the storage id.
#[derive(Clone)]
pub struct Storage {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub backend: StorageBackend,
    pub last_save_error: Option<String>,
}

impl Storage {
    pub fn kind(&self) -> StorageKind {
        self.backend.kind()
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.name.is_empty() {
            return Err(StorageError::validation("storage name is required"));
        }
        self.backend.validate()
    }
}

#[derive(sqlx::FromRow)]
struct StorageRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    kind: String,
    last_save_error: Option<String>,
}

#[derive(sqlx::FromRow)]
struct S3Row {
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    endpoint: Option<String>,
}

#[derive(sqlx::FromRow)]
struct GoogleDriveRow {
    client_id: String,
    client_secret: String,
    token_json: String,
}

#[derive(sqlx::FromRow)]
struct NasRow {
    host: String,
    port: i32,
    share: String,
    username: String,
    password: String,
    use_ssl: bool,
    domain: Option<String>,
    sub_path: Option<String>,
}

#[derive(Clone)]
pub struct StorageRepository {
    pool: PgPool,
    dirs: StorageDirs,
}

impl StorageRepository {
    pub fn new(pool: PgPool, dirs: StorageDirs) -> Self {
        StorageRepository { pool, dirs }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Storage, StewardError> {
        let row: Option<StorageRow> = sqlx::query_as(
            "SELECT id, owner_id, name, kind, last_save_error FROM storages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(StewardError::NotFound {
            entity: "storage",
            id,
        })?;
        self.hydrate(row).await
    }

    pub async fn find_all_by_owner(&self, owner_id: Uuid) -> Result<Vec<Storage>, StewardError> {
        let rows: Vec<StorageRow> = sqlx::query_as(
            "SELECT id, owner_id, name, kind, last_save_error
             FROM storages WHERE owner_id = $1 ORDER BY name",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut storages = Vec::with_capacity(rows.len());
        for row in rows {
            storages.push(self.hydrate(row).await?);
        }
        Ok(storages)
    }

    async fn hydrate(&self, row: StorageRow) -> Result<Storage, StewardError> {
        let kind = StorageKind::try_from(row.kind)?;
        let backend = match kind {
            StorageKind::Local => {
                StorageBackend::Local(LocalStorage::new(self.dirs.clone()))
            }
            StorageKind::S3 => {
                let s3: S3Row = sqlx::query_as(
                    "SELECT bucket, region, access_key, secret_key, endpoint
                     FROM s3_storages WHERE storage_id = $1",
                )
                .bind(row.id)
                .fetch_one(&self.pool)
                .await?;
                StorageBackend::S3(S3Storage {
                    bucket: s3.bucket,
                    region: s3.region,
                    access_key: s3.access_key,
                    secret_key: s3.secret_key,
                    endpoint: s3.endpoint,
                })
            }
            StorageKind::GoogleDrive => {
                let gd: GoogleDriveRow = sqlx::query_as(
                    "SELECT client_id, client_secret, token_json
                     FROM google_drive_storages WHERE storage_id = $1",
                )
                .bind(row.id)
                .fetch_one(&self.pool)
                .await?;
                StorageBackend::GoogleDrive(GoogleDriveStorage {
                    client_id: gd.client_id,
                    client_secret: gd.client_secret,
                    token_json: gd.token_json,
                })
            }
            StorageKind::Nas => {
                let nas: NasRow = sqlx::query_as(
                    "SELECT host, port, share, username, password, use_ssl, domain, sub_path
                     FROM nas_storages WHERE storage_id = $1",
                )
                .bind(row.id)
                .fetch_one(&self.pool)
                .await?;
                StorageBackend::Nas(NasStorage {
                    mount_root: self.dirs.nas_mount_dir.clone(),
                    host: nas.host,
                    port: nas.port as u16,
                    share: nas.share,
                    username: nas.username,
                    password: nas.password,
                    use_ssl: nas.use_ssl,
                    domain: nas.domain,
                    sub_path: nas.sub_path,
                })
            }
        };

        Ok(Storage {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            backend,
            last_save_error: row.last_save_error,
        })
    }

    /// Saves the storage and its kind-specific row in one transaction;
    /// saving twice with the same id leaves the same row state.
    pub async fn save(&self, storage: &Storage) -> Result<(), StewardError> {
        storage.validate().map_err(StewardError::Storage)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO storages (id, owner_id, name, kind, last_save_error)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE
             SET name = EXCLUDED.name, kind = EXCLUDED.kind,
                 last_save_error = EXCLUDED.last_save_error",
        )
        .bind(storage.id)
        .bind(storage.owner_id)
        .bind(&storage.name)
        .bind(storage.kind().to_string())
        .bind(&storage.last_save_error)
        .execute(&mut *tx)
        .await?;

        match &storage.backend {
            StorageBackend::Local(_) => {
                sqlx::query(
                    "INSERT INTO local_storages (storage_id) VALUES ($1)
                     ON CONFLICT (storage_id) DO NOTHING",
                )
                .bind(storage.id)
                .execute(&mut *tx)
                .await?;
            }
            StorageBackend::S3(s3) => {
                sqlx::query(
                    "INSERT INTO s3_storages
                       (storage_id, bucket, region, access_key, secret_key, endpoint)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (storage_id) DO UPDATE
                     SET bucket = EXCLUDED.bucket, region = EXCLUDED.region,
                         access_key = EXCLUDED.access_key,
                         secret_key = EXCLUDED.secret_key,
                         endpoint = EXCLUDED.endpoint",
                )
                .bind(storage.id)
                .bind(&s3.bucket)
                .bind(&s3.region)
                .bind(&s3.access_key)
                .bind(&s3.secret_key)
                .bind(&s3.endpoint)
                .execute(&mut *tx)
                .await?;
            }
            StorageBackend::GoogleDrive(gd) => {
                sqlx::query(
                    "INSERT INTO google_drive_storages
                       (storage_id, client_id, client_secret, token_json)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (storage_id) DO UPDATE
                     SET client_id = EXCLUDED.client_id,
                         client_secret = EXCLUDED.client_secret,
                         token_json = EXCLUDED.token_json",
                )
                .bind(storage.id)
                .bind(&gd.client_id)
                .bind(&gd.client_secret)
                .bind(&gd.token_json)
                .execute(&mut *tx)
                .await?;
            }
            StorageBackend::Nas(nas) => {
                sqlx::query(
                    "INSERT INTO nas_storages
                       (storage_id, host, port, share, username, password,
                        use_ssl, domain, sub_path)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                     ON CONFLICT (storage_id) DO UPDATE
                     SET host = EXCLUDED.host, port = EXCLUDED.port,
                         share = EXCLUDED.share, username = EXCLUDED.username,
                         password = EXCLUDED.password, use_ssl = EXCLUDED.use_ssl,
                         domain = EXCLUDED.domain, sub_path = EXCLUDED.sub_path",
                )
                .bind(storage.id)
                .bind(&nas.host)
                .bind(nas.port as i32)
                .bind(&nas.share)
                .bind(&nas.username)
                .bind(&nas.password)
                .bind(nas.use_ssl)
                .bind(&nas.domain)
                .bind(&nas.sub_path)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StewardError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "local_storages",
            "s3_storages",
            "google_drive_storages",
            "nas_storages",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE storage_id = $1"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM storages WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_last_save_error(
        &self,
        id: Uuid,
        error: Option<&str>,
    ) -> Result<(), StewardError> {
        sqlx::query("UPDATE storages SET last_save_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Service-level operations; every user-facing call enforces ownership.
#[derive(Clone)]
pub struct StorageService {
    repository: StorageRepository,
}

impl StorageService {
    pub fn new(repository: StorageRepository) -> Self {
        StorageService { repository }
    }

    pub async fn get_storage_by_id(&self, id: Uuid) -> Result<Storage, StewardError> {
        self.repository.find_by_id(id).await
    }

    pub async fn get_storage_with_auth(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Storage, StewardError> {
        let storage = self.repository.find_by_id(id).await?;
        if storage.owner_id != user_id {
            return Err(StewardError::AccessDenied);
        }
        Ok(storage)
    }

    pub async fn list_storages(&self, user_id: Uuid) -> Result<Vec<Storage>, StewardError> {
        self.repository.find_all_by_owner(user_id).await
    }

    pub async fn save_storage(&self, user_id: Uuid, storage: &Storage) -> Result<(), StewardError> {
        if storage.owner_id != user_id {
            return Err(StewardError::AccessDenied);
        }
        self.repository.save(storage).await
    }

    pub async fn delete_storage(&self, user_id: Uuid, id: Uuid) -> Result<(), StewardError> {
        let storage = self.get_storage_with_auth(user_id, id).await?;
        self.repository.delete(storage.id).await
    }

    /// Runs the backend probe and records the outcome on the storage row.
    pub async fn test_storage(&self, user_id: Uuid, id: Uuid) -> Result<(), StewardError> {
        let storage = self.get_storage_with_auth(user_id, id).await?;

        match storage.backend.probe().await {
            Ok(()) => {
                self.repository.set_last_save_error(id, None).await?;
                info!("Storage {} probe succeeded", id);
                Ok(())
            }
            Err(e) => {
                self.repository
                    .set_last_save_error(id, Some(&e.to_string()))
                    .await?;
                Err(StewardError::Storage(e))
            }
        }
    }

    /// Records a save failure (or clears it) after a backup attempt.
    pub async fn record_save_result(
        &self,
        id: Uuid,
        error: Option<&str>,
    ) -> Result<(), StewardError> {
        self.repository.set_last_save_error(id, error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_kind_round_trips_through_text() {
        for kind in [
            StorageKind::Local,
            StorageKind::S3,
            StorageKind::GoogleDrive,
            StorageKind::Nas,
        ] {
            let parsed = StorageKind::try_from(kind.to_string()).unwrap();
            assert_eq!(parsed, kind);
        }
        assert!(StorageKind::try_from("FTP".to_string()).is_err());
    }

    #[test]
    fn storage_requires_name() {
        let storage = Storage {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: String::new(),
            backend: StorageBackend::Local(LocalStorage::new(StorageDirs {
                data_dir: "/tmp/data".into(),
                temp_dir: "/tmp/tmp".into(),
                nas_mount_dir: "/mnt/nas".into(),
            })),
            last_save_error: None,
        };
        assert!(storage.validate().is_err());
    }
}
