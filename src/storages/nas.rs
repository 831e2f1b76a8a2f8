//! NAS backend for SMB/CIFS shares. The share itself is mounted by the
//! host (mount.cifs carries the SMB2 session); steward addresses it as
//! `<mount-root>/<host>/<share>[/<sub-path>]` and keeps the connection
//! parameters for validation and reachability probing.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncRead;
use uuid::Uuid;

use super::{StorageError, StorageReader};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SMB_PORT: u16 = 445;

#[derive(Clone)]
pub struct NasStorage {
    pub mount_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub share: String,
    pub username: String,
    pub password: String,
    pub use_ssl: bool,
    pub domain: Option<String>,
    pub sub_path: Option<String>,
}

impl NasStorage {
    /// Directory artefacts live in on the mounted share.
    pub fn base_dir(&self) -> PathBuf {
        let mut dir = self.mount_root.join(&self.host).join(&self.share);
        if let Some(sub) = self.sub_path.as_deref().filter(|s| !s.is_empty()) {
            // Stored as a share-relative path, possibly several levels deep
            for part in sub.split('/').filter(|p| !p.is_empty()) {
                dir.push(part);
            }
        }
        dir
    }

    fn file_path(&self, id: Uuid) -> PathBuf {
        self.base_dir().join(id.to_string())
    }

    pub async fn put<R>(&self, id: Uuid, mut reader: R) -> Result<(), StorageError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let dir = self.base_dir();
        fs::create_dir_all(&dir).await?;

        let path = self.file_path(id);
        let mut file = fs::File::create(&path).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<StorageReader, StorageError> {
        match fs::File::open(self.file_path(id)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        match fs::remove_file(self.file_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.host.is_empty() {
            return Err(StorageError::validation("NAS host is required"));
        }
        if self.port == 0 {
            return Err(StorageError::validation("NAS port is required"));
        }
        if self.share.is_empty() {
            return Err(StorageError::validation("NAS share is required"));
        }
        if self.username.is_empty() {
            return Err(StorageError::validation("NAS username is required"));
        }
        if self.password.is_empty() {
            return Err(StorageError::validation("NAS password is required"));
        }
        Ok(())
    }

    /// Dials the SMB endpoint with a 10-second deadline; catches dead or
    /// misaddressed filers even when the kernel mount is cached.
    pub async fn probe_reachability(&self) -> Result<(), StorageError> {
        let addr = format!("{}:{}", self.host, self.port);
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| StorageError::transport(format!("cannot resolve {addr}: {e}")))?
            .next()
            .ok_or_else(|| StorageError::transport(format!("no address for {addr}")))?;

        match tokio::time::timeout(DIAL_TIMEOUT, tokio::net::TcpStream::connect(resolved)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(StorageError::transport(format!(
                "NAS {addr} is not reachable: {e}"
            ))),
            Err(_) => Err(StorageError::transport(format!(
                "NAS {addr} did not answer within 10 seconds"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn storage(root: &std::path::Path, sub_path: Option<&str>) -> NasStorage {
        NasStorage {
            mount_root: root.to_path_buf(),
            host: "filer.lan".to_string(),
            port: DEFAULT_SMB_PORT,
            share: "backups".to_string(),
            username: "svc".to_string(),
            password: "pw".to_string(),
            use_ssl: false,
            domain: None,
            sub_path: sub_path.map(str::to_string),
        }
    }

    #[test]
    fn base_dir_includes_host_share_and_sub_path() {
        let s = storage(std::path::Path::new("/mnt/nas"), Some("pg/daily"));
        assert_eq!(
            s.base_dir(),
            PathBuf::from("/mnt/nas/filer.lan/backups/pg/daily")
        );

        let flat = storage(std::path::Path::new("/mnt/nas"), None);
        assert_eq!(flat.base_dir(), PathBuf::from("/mnt/nas/filer.lan/backups"));
    }

    #[test]
    fn validate_requires_connection_fields() {
        let root = std::path::Path::new("/mnt/nas");
        assert!(storage(root, None).validate().is_ok());

        let mut s = storage(root, None);
        s.share.clear();
        assert!(s.validate().is_err());

        let mut s = storage(root, None);
        s.port = 0;
        assert!(s.validate().is_err());
    }

    #[tokio::test]
    async fn put_creates_parent_directories_and_round_trips() {
        let root = tempfile::tempdir().unwrap();
        let s = storage(root.path(), Some("nested/dir"));
        let id = Uuid::new_v4();

        s.put(id, &b"artefact"[..]).await.unwrap();

        let mut reader = s.get(id).await.unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, b"artefact");

        s.delete(id).await.unwrap();
        assert!(matches!(s.get(id).await, Err(StorageError::NotFound(_))));
        // Second delete is still a success
        s.delete(id).await.unwrap();
    }
}
