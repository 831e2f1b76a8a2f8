//! Backups: the artefact-owning entity, its repository, and the service
//! orchestrating dump runs, notifications and artefact lifecycle.

pub mod config;
pub mod interval;
pub mod pipeline;
pub mod scheduler;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};
use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::databases::DatabaseService;
use crate::errors::StewardError;
use crate::notifiers::NotificationService;
use crate::shutdown::Shutdown;
use crate::storages::StorageService;
use config::{BackupConfig, BackupConfigService, NotificationTrigger};

pub const RESTART_FAIL_MESSAGE: &str = "Backup failed due to application restart";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::InProgress => "IN_PROGRESS",
            BackupStatus::Completed => "COMPLETED",
            BackupStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl TryFrom<String> for BackupStatus {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "IN_PROGRESS" => Ok(BackupStatus::InProgress),
            "COMPLETED" => Ok(BackupStatus::Completed),
            "FAILED" => Ok(BackupStatus::Failed),
            other => Err(StewardError::validation(format!(
                "unknown backup status: {other}"
            ))),
        }
    }
}

/// One backup run. The row id doubles as the artefact key in storage.
#[derive(Clone, sqlx::FromRow)]
pub struct Backup {
    pub id: Uuid,
    pub database_id: Uuid,
    pub storage_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: BackupStatus,
    pub fail_message: Option<String>,
    pub size_mb: f64,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

const BACKUP_COLUMNS: &str =
    "id, database_id, storage_id, status, fail_message, size_mb, duration_ms, created_at";

#[derive(Clone)]
pub struct BackupRepository {
    pool: PgPool,
}

impl BackupRepository {
    pub fn new(pool: PgPool) -> Self {
        BackupRepository { pool }
    }

    pub async fn save(&self, backup: &Backup) -> Result<(), StewardError> {
        sqlx::query(
            "INSERT INTO backups
               (id, database_id, storage_id, status, fail_message, size_mb,
                duration_ms, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE
             SET status = EXCLUDED.status, fail_message = EXCLUDED.fail_message,
                 size_mb = EXCLUDED.size_mb, duration_ms = EXCLUDED.duration_ms",
        )
        .bind(backup.id)
        .bind(backup.database_id)
        .bind(backup.storage_id)
        .bind(backup.status.to_string())
        .bind(&backup.fail_message)
        .bind(backup.size_mb)
        .bind(backup.duration_ms)
        .bind(backup.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_progress(
        &self,
        id: Uuid,
        size_mb: f64,
        duration_ms: i64,
    ) -> Result<(), StewardError> {
        sqlx::query("UPDATE backups SET size_mb = $2, duration_ms = $3 WHERE id = $1")
            .bind(id)
            .bind(size_mb)
            .bind(duration_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Backup, StewardError> {
        let backup: Option<Backup> = sqlx::query_as(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        backup.ok_or(StewardError::NotFound {
            entity: "backup",
            id,
        })
    }

    pub async fn find_last_by_database_id(
        &self,
        database_id: Uuid,
    ) -> Result<Option<Backup>, StewardError> {
        let backup: Option<Backup> = sqlx::query_as(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups
             WHERE database_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(database_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(backup)
    }

    pub async fn find_by_database_id(
        &self,
        database_id: Uuid,
    ) -> Result<Vec<Backup>, StewardError> {
        Ok(sqlx::query_as(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups
             WHERE database_id = $1 ORDER BY created_at DESC"
        ))
        .bind(database_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Most recent first, capped at `limit`; feeds retry accounting.
    pub async fn find_recent_by_database_id(
        &self,
        database_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Backup>, StewardError> {
        Ok(sqlx::query_as(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups
             WHERE database_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(database_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn find_by_status(&self, status: BackupStatus) -> Result<Vec<Backup>, StewardError> {
        Ok(sqlx::query_as(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE status = $1"
        ))
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn find_by_database_id_and_status(
        &self,
        database_id: Uuid,
        status: BackupStatus,
    ) -> Result<Vec<Backup>, StewardError> {
        Ok(sqlx::query_as(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE database_id = $1 AND status = $2"
        ))
        .bind(database_id)
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn find_older_than(
        &self,
        database_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Backup>, StewardError> {
        Ok(sqlx::query_as(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups
             WHERE database_id = $1 AND created_at < $2"
        ))
        .bind(database_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn delete_by_id(&self, id: Uuid) -> Result<(), StewardError> {
        sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Body of the success notification: duration as minutes+seconds, size in
/// MB switching to GB at 1024.
pub fn format_success_body(size_mb: f64, duration_ms: i64) -> String {
    let size_str = if size_mb < 1024.0 {
        format!("{size_mb:.2} MB")
    } else {
        format!("{:.2} GB", size_mb / 1024.0)
    };

    let minutes = duration_ms / (1000 * 60);
    let seconds = (duration_ms % (1000 * 60)) / 1000;

    format!("Backup completed successfully in {minutes}m {seconds}s.\nCompressed backup size: {size_str}")
}

#[derive(Clone)]
pub struct BackupService {
    config: Arc<Config>,
    shutdown: Shutdown,
    repository: BackupRepository,
    database_service: DatabaseService,
    storage_service: StorageService,
    backup_config_service: BackupConfigService,
    notification_service: NotificationService,
}

impl BackupService {
    pub fn new(
        config: Arc<Config>,
        shutdown: Shutdown,
        repository: BackupRepository,
        database_service: DatabaseService,
        storage_service: StorageService,
        backup_config_service: BackupConfigService,
        notification_service: NotificationService,
    ) -> Self {
        BackupService {
            config,
            shutdown,
            repository,
            database_service,
            storage_service,
            backup_config_service,
            notification_service,
        }
    }

    pub fn repository(&self) -> &BackupRepository {
        &self.repository
    }

    /// Manual trigger from the API surface; the run itself is detached.
    pub async fn make_backup_with_auth(
        &self,
        user_id: Uuid,
        database_id: Uuid,
    ) -> Result<(), StewardError> {
        self.database_service
            .get_database_with_auth(user_id, database_id)
            .await?;

        let service = self.clone();
        tokio::spawn(async move {
            service.make_backup(database_id, true).await;
        });
        Ok(())
    }

    pub async fn get_backups(
        &self,
        user_id: Uuid,
        database_id: Uuid,
    ) -> Result<Vec<Backup>, StewardError> {
        self.database_service
            .get_database_with_auth(user_id, database_id)
            .await?;
        self.repository.find_by_database_id(database_id).await
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<Backup, StewardError> {
        self.repository.find_by_id(id).await
    }

    /// Runs one backup end to end. Refusals (disabled config, running
    /// backup, missing storage) and failures are logged and recorded, not
    /// returned; the scheduler fires this into a detached task.
    pub async fn make_backup(&self, database_id: Uuid, is_last_try: bool) {
        let database = match self.database_service.get_database_by_id(database_id).await {
            Ok(db) => db,
            Err(e) => {
                error!("Failed to load database for backup: {}", e);
                return;
            }
        };

        // At most one running backup per database
        match self.repository.find_last_by_database_id(database_id).await {
            Ok(Some(last)) if last.status == BackupStatus::InProgress => {
                error!(
                    "Backup for database {} is already in progress, skipping",
                    database_id
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to look up last backup: {}", e);
                return;
            }
        }

        let backup_config = match self
            .backup_config_service
            .get_config_by_database_id(database_id)
            .await
        {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load backup config: {}", e);
                return;
            }
        };

        if !backup_config.enabled {
            info!("Backups are not enabled for database {}", database_id);
            return;
        }

        let storage_id = match backup_config.storage_id {
            Some(id) => id,
            None => {
                error!("Backup config for {} has no storage", database_id);
                return;
            }
        };

        let storage = match self.storage_service.get_storage_by_id(storage_id).await {
            Ok(storage) => storage,
            Err(e) => {
                error!("Failed to load storage {}: {}", storage_id, e);
                return;
            }
        };

        let mut backup = Backup {
            id: Uuid::new_v4(),
            database_id,
            storage_id,
            status: BackupStatus::InProgress,
            fail_message: None,
            size_mb: 0.0,
            duration_ms: 0,
            created_at: Utc::now(),
        };

        // The row must be durable before the dump process starts
        if let Err(e) = self.repository.save(&backup).await {
            error!("Failed to persist backup row: {}", e);
            return;
        }

        let started = std::time::Instant::now();

        // Progress reports update size and duration while streaming
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<f64>();
        let progress_repo = self.repository.clone();
        let backup_id = backup.id;
        let progress_task = tokio::spawn(async move {
            while let Some(mb) = progress_rx.recv().await {
                if let Err(e) = progress_repo
                    .update_progress(backup_id, mb, started.elapsed().as_millis() as i64)
                    .await
                {
                    error!("Failed to update backup progress: {}", e);
                }
            }
        });

        let result = pipeline::create_backup(
            &self.config,
            &self.shutdown,
            backup.id,
            &backup_config,
            &database,
            &storage,
            progress_tx,
        )
        .await;

        let _ = progress_task.await;
        backup.duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(total_mb) => {
                backup.status = BackupStatus::Completed;
                backup.size_mb = total_mb;
                if let Err(e) = self.repository.save(&backup).await {
                    error!("Failed to save completed backup: {}", e);
                    return;
                }
                if let Err(e) = self
                    .storage_service
                    .record_save_result(storage.id, None)
                    .await
                {
                    error!("Failed to clear storage save error: {}", e);
                }
                if let Err(e) = self
                    .database_service
                    .set_last_backup_time(database_id, Utc::now())
                    .await
                {
                    error!("Failed to record last backup time: {}", e);
                }

                info!(
                    "Backup {} for database {} completed, {:.2} MB in {} ms",
                    backup.id, database_id, backup.size_mb, backup.duration_ms
                );

                // Intermediate retry passes stay quiet on success
                if is_last_try {
                    self.send_backup_notification(
                        &backup_config,
                        &backup,
                        NotificationTrigger::BackupSuccess,
                        None,
                    )
                    .await;
                }
            }
            Err(e) => {
                let message = e.to_string();
                backup.status = BackupStatus::Failed;
                backup.fail_message = Some(message.clone());
                backup.size_mb = 0.0;

                if let Err(save_err) = self.repository.save(&backup).await {
                    error!("Failed to save failed backup: {}", save_err);
                }
                if let Err(db_err) = self
                    .database_service
                    .set_backup_error(database_id, &message)
                    .await
                {
                    error!("Failed to record backup error on database: {}", db_err);
                }
                if matches!(e, StewardError::Storage(_)) {
                    if let Err(storage_err) = self
                        .storage_service
                        .record_save_result(storage.id, Some(&message))
                        .await
                    {
                        error!("Failed to record storage save error: {}", storage_err);
                    }
                }

                error!(
                    "Backup {} for database {} failed: {}",
                    backup.id, database_id, message
                );

                self.send_backup_notification(
                    &backup_config,
                    &backup,
                    NotificationTrigger::BackupFailed,
                    Some(&message),
                )
                .await;
            }
        }
    }

    pub async fn send_backup_notification(
        &self,
        backup_config: &BackupConfig,
        backup: &Backup,
        trigger: NotificationTrigger,
        error_message: Option<&str>,
    ) {
        if !backup_config.notifies_on(trigger) {
            return;
        }

        let database = match self
            .database_service
            .get_database_by_id(backup_config.database_id)
            .await
        {
            Ok(db) => db,
            Err(e) => {
                error!("Failed to load database for notification: {}", e);
                return;
            }
        };

        let title = match trigger {
            NotificationTrigger::BackupFailed => {
                format!("❌ Backup failed for database \"{}\"", database.name)
            }
            NotificationTrigger::BackupSuccess => {
                format!("✅ Backup completed for database \"{}\"", database.name)
            }
        };
        let body = match error_message {
            Some(message) => message.to_string(),
            None => format_success_body(backup.size_mb, backup.duration_ms),
        };

        let notifiers = match self
            .notification_service
            .repository()
            .find_by_ids(&database.notifier_ids)
            .await
        {
            Ok(notifiers) => notifiers,
            Err(e) => {
                error!("Failed to load notifiers: {}", e);
                return;
            }
        };

        for notifier in &notifiers {
            self.notification_service
                .send_notification(notifier, &title, &body)
                .await;
        }
    }

    /// Removes a single backup: the artefact first (best-effort on remote
    /// backends would still surface the error), then the row.
    pub async fn delete_backup(&self, user_id: Uuid, backup_id: Uuid) -> Result<(), StewardError> {
        let backup = self.repository.find_by_id(backup_id).await?;
        self.database_service
            .get_database_with_auth(user_id, backup.database_id)
            .await?;

        if backup.status == BackupStatus::InProgress {
            return Err(StewardError::BackupInProgress);
        }

        self.delete_backup_row_and_artefact(&backup).await
    }

    /// Cascade used by database removal and storage changes. Refused while
    /// any backup of the database is still running.
    pub async fn delete_database_backups(&self, database_id: Uuid) -> Result<(), StewardError> {
        let in_progress = self
            .repository
            .find_by_database_id_and_status(database_id, BackupStatus::InProgress)
            .await?;
        if !in_progress.is_empty() {
            return Err(StewardError::BackupInProgress);
        }

        for backup in self.repository.find_by_database_id(database_id).await? {
            self.delete_backup_row_and_artefact(&backup).await?;
        }
        Ok(())
    }

    async fn delete_backup_row_and_artefact(&self, backup: &Backup) -> Result<(), StewardError> {
        match self.storage_service.get_storage_by_id(backup.storage_id).await {
            Ok(storage) => {
                if let Err(e) = storage.backend.delete(backup.id).await {
                    // The remote object may already be gone
                    error!("Failed to delete artefact {}: {}", backup.id, e);
                }
            }
            Err(e) => {
                error!(
                    "Storage {} for backup {} is gone: {}",
                    backup.storage_id, backup.id, e
                );
            }
        }

        self.repository.delete_by_id(backup.id).await
    }

    /// Startup crash recovery: every backup left IN_PROGRESS by a previous
    /// process becomes FAILED with a fixed message, and subscribed
    /// notifiers hear about it. Any error here is fatal to startup.
    pub async fn fail_backups_in_progress(&self) -> Result<(), StewardError> {
        let orphans = self
            .repository
            .find_by_status(BackupStatus::InProgress)
            .await?;

        for mut backup in orphans {
            backup.status = BackupStatus::Failed;
            backup.fail_message = Some(RESTART_FAIL_MESSAGE.to_string());
            backup.size_mb = 0.0;

            self.repository.save(&backup).await?;
            info!(
                "Marked orphaned backup {} of database {} as failed",
                backup.id, backup.database_id
            );

            match self
                .backup_config_service
                .get_config_by_database_id(backup.database_id)
                .await
            {
                Ok(backup_config) => {
                    self.send_backup_notification(
                        &backup_config,
                        &backup,
                        NotificationTrigger::BackupFailed,
                        Some(RESTART_FAIL_MESSAGE),
                    )
                    .await;
                }
                Err(e) => {
                    error!(
                        "No backup config for orphaned backup {}: {}",
                        backup.id, e
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_status_round_trips_through_text() {
        for status in [
            BackupStatus::InProgress,
            BackupStatus::Completed,
            BackupStatus::Failed,
        ] {
            assert_eq!(BackupStatus::try_from(status.to_string()).unwrap(), status);
        }
        assert!(BackupStatus::try_from("DONE".to_string()).is_err());
    }

    #[test]
    fn success_body_formats_duration_and_size() {
        let body = format_success_body(12.345, 83_000);
        assert_eq!(
            body,
            "Backup completed successfully in 1m 23s.\nCompressed backup size: 12.35 MB"
        );
    }

    #[test]
    fn success_body_switches_to_gigabytes() {
        let body = format_success_body(2048.0, 60_000);
        assert!(body.contains("2.00 GB"));
        assert!(body.contains("1m 0s"));

        let just_below = format_success_body(1023.9, 1_000);
        assert!(just_below.contains("1023.90 MB"));
    }
}
