//! Local-disk backend: artefacts live in the data directory, writes go
//! through the temp directory and an atomic rename.

use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

use super::{StorageDirs, StorageError, StorageReader};

#[derive(Clone)]
pub struct LocalStorage {
    dirs: StorageDirs,
}

impl LocalStorage {
    pub fn new(dirs: StorageDirs) -> Self {
        LocalStorage { dirs }
    }

    pub async fn put<R>(&self, id: Uuid, mut reader: R) -> Result<(), StorageError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let temp_path = self.dirs.temp_dir.join(id.to_string());
        let final_path = self.dirs.data_dir.join(id.to_string());

        let mut temp_file = fs::File::create(&temp_path).await?;
        tokio::io::copy(&mut reader, &mut temp_file).await?;
        temp_file.flush().await?;
        temp_file.sync_all().await?;
        drop(temp_file);

        // Rename is atomic within the volume; readers never observe a
        // partially written artefact.
        fs::rename(&temp_path, &final_path).await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<StorageReader, StorageError> {
        let path = self.dirs.data_dir.join(id.to_string());
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        let path = self.dirs.data_dir.join(id.to_string());
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        // Directories are precreated at startup; nothing stored per row.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storages::StorageBackend;
    use tokio::io::AsyncReadExt;

    fn backend_in(root: &std::path::Path) -> (StorageBackend, StorageDirs) {
        let dirs = StorageDirs {
            data_dir: root.join("data"),
            temp_dir: root.join("temp"),
            nas_mount_dir: root.join("nas"),
        };
        std::fs::create_dir_all(&dirs.data_dir).unwrap();
        std::fs::create_dir_all(&dirs.temp_dir).unwrap();
        (
            StorageBackend::Local(LocalStorage::new(dirs.clone())),
            dirs,
        )
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let (backend, dirs) = backend_in(root.path());
        let id = Uuid::new_v4();
        let payload = b"dump bytes".to_vec();

        backend
            .put(id, std::io::Cursor::new(payload.clone()))
            .await
            .unwrap();

        // Nothing lingers in the temp dir after the rename
        assert!(!dirs.temp_dir.join(id.to_string()).exists());
        assert!(dirs.data_dir.join(id.to_string()).exists());

        let mut reader = backend.get(id).await.unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, payload);

        backend.delete(id).await.unwrap();
        assert!(matches!(
            backend.get(id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_of_absent_object_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let (backend, _) = backend_in(root.path());
        backend.delete(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn put_overwrites_existing_artefact() {
        let root = tempfile::tempdir().unwrap();
        let (backend, _) = backend_in(root.path());
        let id = Uuid::new_v4();

        backend.put(id, &b"first"[..]).await.unwrap();
        backend.put(id, &b"second"[..]).await.unwrap();

        let mut reader = backend.get(id).await.unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, b"second");
    }

    #[tokio::test]
    async fn probe_round_trips_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let (backend, dirs) = backend_in(root.path());

        backend.probe().await.unwrap();

        let leftover = std::fs::read_dir(&dirs.data_dir).unwrap().count();
        assert_eq!(leftover, 0);
    }
}
