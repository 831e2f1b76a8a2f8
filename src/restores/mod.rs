//! Restores: fetch a completed artefact from storage into a scratch file
//! (pg_restore needs random access for parallel jobs) and feed it to the
//! version-matched `pg_restore` against a target connection.

use std::fmt;
use std::process::Stdio;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backups::config::BackupConfigService;
use crate::backups::{BackupService, BackupStatus};
use crate::config::Config;
use crate::databases::{DatabaseService, PostgresConnection};
use crate::errors::StewardError;
use crate::pgexec::{
    classify_pg_failure, pg_command, spawn_stderr_reader, stream_copy, wait_with_cancellation,
    StreamCopyError, PIPELINE_TIMEOUT,
};
use crate::pgtools::{executable_path, PgExecutable, PgPassFile, PostgresVersion};
use crate::shutdown::Shutdown;
use crate::storages::StorageService;

pub const RESTART_FAIL_MESSAGE: &str = "Restore failed due to application restart";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreStatus {
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestoreStatus::InProgress => "IN_PROGRESS",
            RestoreStatus::Completed => "COMPLETED",
            RestoreStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl TryFrom<String> for RestoreStatus {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "IN_PROGRESS" => Ok(RestoreStatus::InProgress),
            "COMPLETED" => Ok(RestoreStatus::Completed),
            "FAILED" => Ok(RestoreStatus::Failed),
            other => Err(StewardError::validation(format!(
                "unknown restore status: {other}"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct Restore {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub target: PostgresConnection,
    pub status: RestoreStatus,
    pub fail_message: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct RestoreRow {
    id: Uuid,
    backup_id: Uuid,
    #[sqlx(try_from = "String")]
    status: RestoreStatus,
    fail_message: Option<String>,
    duration_ms: i64,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    host: String,
    port: i32,
    username: String,
    password: String,
    database_name: String,
    require_ssl: bool,
    #[sqlx(try_from = "String")]
    version: PostgresVersion,
}

#[derive(Clone)]
pub struct RestoreRepository {
    pool: PgPool,
}

impl RestoreRepository {
    pub fn new(pool: PgPool) -> Self {
        RestoreRepository { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Restore, StewardError> {
        let row: Option<RestoreRow> = sqlx::query_as(
            "SELECT id, backup_id, status, fail_message, duration_ms, created_at
             FROM restores WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(StewardError::NotFound {
            entity: "restore",
            id,
        })?;
        self.hydrate(row).await
    }

    pub async fn find_in_progress(&self) -> Result<Vec<Restore>, StewardError> {
        let rows: Vec<RestoreRow> = sqlx::query_as(
            "SELECT id, backup_id, status, fail_message, duration_ms, created_at
             FROM restores WHERE status = $1",
        )
        .bind(RestoreStatus::InProgress.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut restores = Vec::with_capacity(rows.len());
        for row in rows {
            restores.push(self.hydrate(row).await?);
        }
        Ok(restores)
    }

    async fn hydrate(&self, row: RestoreRow) -> Result<Restore, StewardError> {
        let target: TargetRow = sqlx::query_as(
            "SELECT host, port, username, password, database_name, require_ssl, version
             FROM restore_connections WHERE restore_id = $1",
        )
        .bind(row.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Restore {
            id: row.id,
            backup_id: row.backup_id,
            target: PostgresConnection {
                host: target.host,
                port: target.port as u16,
                username: target.username,
                password: target.password,
                database: target.database_name,
                require_ssl: target.require_ssl,
                version: target.version,
            },
            status: row.status,
            fail_message: row.fail_message,
            duration_ms: row.duration_ms,
            created_at: row.created_at,
        })
    }

    /// Saves the restore and its target connection in one transaction.
    pub async fn save(&self, restore: &Restore) -> Result<(), StewardError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO restores
               (id, backup_id, status, fail_message, duration_ms, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE
             SET status = EXCLUDED.status, fail_message = EXCLUDED.fail_message,
                 duration_ms = EXCLUDED.duration_ms",
        )
        .bind(restore.id)
        .bind(restore.backup_id)
        .bind(restore.status.to_string())
        .bind(&restore.fail_message)
        .bind(restore.duration_ms)
        .bind(restore.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO restore_connections
               (restore_id, host, port, username, password, database_name,
                require_ssl, version)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (restore_id) DO UPDATE
             SET host = EXCLUDED.host, port = EXCLUDED.port,
                 username = EXCLUDED.username, password = EXCLUDED.password,
                 database_name = EXCLUDED.database_name,
                 require_ssl = EXCLUDED.require_ssl, version = EXCLUDED.version",
        )
        .bind(restore.id)
        .bind(&restore.target.host)
        .bind(restore.target.port as i32)
        .bind(&restore.target.username)
        .bind(&restore.target.password)
        .bind(&restore.target.database)
        .bind(restore.target.require_ssl)
        .bind(restore.target.version.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RestoreService {
    config: std::sync::Arc<Config>,
    shutdown: Shutdown,
    repository: RestoreRepository,
    backup_service: BackupService,
    backup_config_service: BackupConfigService,
    storage_service: StorageService,
    database_service: DatabaseService,
}

impl RestoreService {
    pub fn new(
        config: std::sync::Arc<Config>,
        shutdown: Shutdown,
        repository: RestoreRepository,
        backup_service: BackupService,
        backup_config_service: BackupConfigService,
        storage_service: StorageService,
        database_service: DatabaseService,
    ) -> Self {
        RestoreService {
            config,
            shutdown,
            repository,
            backup_service,
            backup_config_service,
            storage_service,
            database_service,
        }
    }

    pub async fn get_restore(&self, id: Uuid) -> Result<Restore, StewardError> {
        self.repository.find_by_id(id).await
    }

    /// Creates the restore row and runs it in a detached task. Only
    /// completed backups are restorable.
    pub async fn request_restore(
        &self,
        user_id: Uuid,
        backup_id: Uuid,
        target: PostgresConnection,
    ) -> Result<Uuid, StewardError> {
        target.validate()?;

        let backup = self.backup_service.get_backup(backup_id).await?;
        self.database_service
            .get_database_with_auth(user_id, backup.database_id)
            .await?;

        if backup.status != BackupStatus::Completed {
            return Err(StewardError::validation(
                "only completed backups can be restored",
            ));
        }

        let restore = Restore {
            id: Uuid::new_v4(),
            backup_id,
            target,
            status: RestoreStatus::InProgress,
            fail_message: None,
            duration_ms: 0,
            created_at: Utc::now(),
        };
        self.repository.save(&restore).await?;

        let service = self.clone();
        let restore_id = restore.id;
        tokio::spawn(async move {
            service.run_restore(restore).await;
        });
        Ok(restore_id)
    }

    async fn run_restore(&self, mut restore: Restore) {
        let started = Instant::now();

        let result = self.execute_restore(&restore).await;
        restore.duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(()) => {
                restore.status = RestoreStatus::Completed;
                info!(
                    "Restore {} of backup {} completed in {} ms",
                    restore.id, restore.backup_id, restore.duration_ms
                );
            }
            Err(e) => {
                restore.status = RestoreStatus::Failed;
                restore.fail_message = Some(e.to_string());
                error!(
                    "Restore {} of backup {} failed: {}",
                    restore.id, restore.backup_id, e
                );
            }
        }

        if let Err(e) = self.repository.save(&restore).await {
            error!("Failed to persist restore outcome: {}", e);
        }
    }

    async fn execute_restore(&self, restore: &Restore) -> Result<(), StewardError> {
        let backup = self.backup_service.get_backup(restore.backup_id).await?;
        if backup.status != BackupStatus::Completed {
            return Err(StewardError::validation(
                "only completed backups can be restored",
            ));
        }

        let storage = self
            .storage_service
            .get_storage_by_id(backup.storage_id)
            .await?;
        let backup_config = self
            .backup_config_service
            .get_config_by_database_id(backup.database_id)
            .await?;

        // pg_restore -Fc with -j needs a seekable file, so the artefact
        // lands in a scratch directory first
        let scratch_dir = self
            .config
            .temp_dir
            .join(format!("restore_{}", restore.id));
        tokio::fs::create_dir_all(&scratch_dir).await?;

        let result = self
            .download_and_run(restore, backup_config.cpu_count, &storage, &scratch_dir, backup.id)
            .await;

        // Scratch space goes away no matter how the run ended
        if let Err(e) = tokio::fs::remove_dir_all(&scratch_dir).await {
            warn!(
                "Failed to remove restore scratch dir {}: {}",
                scratch_dir.display(),
                e
            );
        }

        result
    }

    async fn download_and_run(
        &self,
        restore: &Restore,
        cpu_count: i32,
        storage: &crate::storages::Storage,
        scratch_dir: &std::path::Path,
        artefact_id: Uuid,
    ) -> Result<(), StewardError> {
        let deadline = Instant::now() + PIPELINE_TIMEOUT;
        let dump_path = scratch_dir.join("backup.dump");

        let mut artefact = storage
            .backend
            .get(artefact_id)
            .await
            .map_err(StewardError::Storage)?;
        let mut dump_file = tokio::fs::File::create(&dump_path).await?;

        stream_copy(&mut artefact, &mut dump_file, &self.shutdown, deadline, None)
            .await
            .map_err(|e| match e {
                StreamCopyError::Shutdown => StewardError::RestoreCancelled,
                StreamCopyError::DeadlineExceeded => {
                    StewardError::validation("restore exceeded the 60-minute deadline")
                }
                StreamCopyError::Io(io) => StewardError::Io(io),
            })?;
        dump_file.sync_all().await?;
        drop(dump_file);
        drop(artefact);

        let target = &restore.target;
        let parallel_jobs = cpu_count.clamp(1, 8);
        let args: Vec<String> = vec![
            "-Fc".into(),
            "-j".into(),
            parallel_jobs.to_string(),
            "--no-password".into(),
            "-h".into(),
            target.host.clone(),
            "-p".into(),
            target.port.to_string(),
            "-U".into(),
            target.username.clone(),
            "-d".into(),
            target.database.clone(),
            "--verbose".into(),
            "--clean".into(),
            "--if-exists".into(),
            "--no-owner".into(),
            dump_path.display().to_string(),
        ];

        let pg_restore = executable_path(
            target.version,
            PgExecutable::PgRestore,
            self.config.env_mode,
            &self.config.postgres_install_dir,
        );
        if !pg_restore.is_file() {
            return Err(StewardError::PgTool(format!(
                "PostgreSQL executable not found: {}",
                pg_restore.display()
            )));
        }

        let pgpass =
            PgPassFile::create(&target.host, target.port, &target.username, &target.password)?;

        info!(
            "Running pg_restore of backup {} into {} (PostgreSQL {}, {} jobs)",
            restore.backup_id, target.database, target.version, parallel_jobs
        );

        let mut cmd = pg_command(&pg_restore, &args, pgpass.path(), target.require_ssl);
        cmd.stdout(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| StewardError::PgTool(format!("failed to start pg_restore: {e}")))?;
        let stderr_task = spawn_stderr_reader(&mut child);

        let (exit_code, cancelled) =
            wait_with_cancellation(&mut child, &self.shutdown, deadline)
                .await
                .map_err(StewardError::Io)?;
        let stderr = stderr_task.await.unwrap_or_default();

        if cancelled || self.shutdown.is_triggered() {
            return Err(StewardError::RestoreCancelled);
        }

        if exit_code != Some(0) {
            let command_line = format!("{} {}", pg_restore.display(), args.join(" "));
            return Err(StewardError::PgTool(classify_pg_failure(
                "pg_restore",
                exit_code,
                &stderr,
                &command_line,
                true,
            )));
        }

        Ok(())
    }

    /// Startup sweeper. Unlike backups, orphaned restores fail silently;
    /// any error is fatal to startup.
    pub async fn fail_restores_in_progress(&self) -> Result<(), StewardError> {
        for mut restore in self.repository.find_in_progress().await? {
            restore.status = RestoreStatus::Failed;
            restore.fail_message = Some(RESTART_FAIL_MESSAGE.to_string());
            self.repository.save(&restore).await?;
            info!("Marked orphaned restore {} as failed", restore.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_status_round_trips_through_text() {
        for status in [
            RestoreStatus::InProgress,
            RestoreStatus::Completed,
            RestoreStatus::Failed,
        ] {
            assert_eq!(RestoreStatus::try_from(status.to_string()).unwrap(), status);
        }
        assert!(RestoreStatus::try_from("PENDING".to_string()).is_err());
    }

    #[test]
    fn parallel_jobs_clamp_to_eight() {
        assert_eq!(0_i32.clamp(1, 8), 1);
        assert_eq!(4_i32.clamp(1, 8), 4);
        assert_eq!(32_i32.clamp(1, 8), 8);
    }
}
