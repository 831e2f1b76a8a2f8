//! The streaming dump pipeline: `pg_dump -Fc` stdout flows through a
//! bounded in-memory pipe into the storage backend, 32 KiB at a time,
//! with progress reports at 1 MiB boundaries and cancellation checked on
//! every chunk.

use std::process::Stdio;

use log::info;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::config::BackupConfig;
use crate::config::Config;
use crate::databases::{Database, DatabaseType};
use crate::errors::StewardError;
use crate::pgexec::{
    classify_pg_failure, pg_command, spawn_stderr_reader, stream_copy, wait_with_cancellation,
    StreamCopyError, PIPELINE_TIMEOUT,
};
use crate::pgtools::{executable_path, PgExecutable, PgPassFile};
use crate::shutdown::Shutdown;
use crate::storages::Storage;

/// Capacity of the pipe between the dump process and the storage writer;
/// bounds memory no matter how fast pg_dump produces output.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Streams one `pg_dump` run into storage under the backup id. Returns the
/// total dump size in MiB; the progress sender sees intermediate totals
/// and the final one.
pub async fn create_backup(
    config: &Config,
    shutdown: &Shutdown,
    backup_id: Uuid,
    backup_config: &BackupConfig,
    database: &Database,
    storage: &Storage,
    progress: mpsc::UnboundedSender<f64>,
) -> Result<f64, StewardError> {
    if !backup_config.enabled {
        return Err(StewardError::validation(format!(
            "backups are not enabled for database \"{}\"",
            database.name
        )));
    }
    if backup_config.storage_id.is_none() {
        return Err(StewardError::validation(
            "backup config has no storage assigned",
        ));
    }
    if database.db_type != DatabaseType::Postgres {
        return Err(StewardError::validation(
            "only PostgreSQL databases can be dumped",
        ));
    }

    let conn = &database.connection;
    let args: Vec<String> = vec![
        "-Fc".into(),
        "-Z".into(),
        "6".into(),
        "--no-password".into(),
        "-h".into(),
        conn.host.clone(),
        "-p".into(),
        conn.port.to_string(),
        "-U".into(),
        conn.username.clone(),
        "-d".into(),
        conn.database.clone(),
        "--verbose".into(),
    ];

    let pg_dump = executable_path(
        conn.version,
        PgExecutable::PgDump,
        config.env_mode,
        &config.postgres_install_dir,
    );
    if !pg_dump.is_file() {
        return Err(StewardError::PgTool(format!(
            "PostgreSQL executable not found: {}",
            pg_dump.display()
        )));
    }

    let pgpass = PgPassFile::create(&conn.host, conn.port, &conn.username, &conn.password)?;

    info!(
        "Streaming pg_dump of database {} (PostgreSQL {}) to storage {}",
        database.id, conn.version, storage.id
    );

    let mut cmd = pg_command(&pg_dump, &args, pgpass.path(), conn.require_ssl);
    cmd.stdout(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        StewardError::PgTool(format!("failed to start pg_dump: {e}"))
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| StewardError::PgTool("pg_dump stdout was not captured".into()))?;
    let stderr_task = spawn_stderr_reader(&mut child);

    // Bounded pipe: the read end feeds the storage backend in its own task
    let (mut pipe_writer, pipe_reader) = tokio::io::duplex(PIPE_CAPACITY);
    let backend = storage.backend.clone();
    let put_task =
        tokio::spawn(async move { backend.put(backup_id, pipe_reader).await });

    let deadline = Instant::now() + PIPELINE_TIMEOUT;
    let copy_result = stream_copy(
        &mut stdout,
        &mut pipe_writer,
        shutdown,
        deadline,
        Some(&progress),
    )
    .await;

    // EOF for the storage writer regardless of how the copy ended
    drop(pipe_writer);
    drop(stdout);

    let (exit_code, cancelled) = wait_with_cancellation(&mut child, shutdown, deadline)
        .await
        .map_err(StewardError::Io)?;
    let stderr = stderr_task.await.unwrap_or_default();
    let save_result = put_task
        .await
        .map_err(|e| StewardError::PgTool(format!("storage writer task failed: {e}")))?;

    if cancelled || shutdown.is_triggered() {
        return Err(StewardError::BackupCancelled);
    }

    let total_bytes = match copy_result {
        Ok(bytes) => bytes,
        Err(StreamCopyError::Shutdown) => return Err(StewardError::BackupCancelled),
        Err(StreamCopyError::DeadlineExceeded) => {
            return Err(StewardError::PgTool(
                "backup exceeded the 60-minute deadline".into(),
            ))
        }
        Err(StreamCopyError::Io(e)) => {
            // Prefer the process error when the dump itself died, then the
            // storage error that broke the pipe
            if exit_code != Some(0) {
                let command_line = format!("{} {}", pg_dump.display(), args.join(" "));
                return Err(StewardError::PgTool(classify_pg_failure(
                    "pg_dump",
                    exit_code,
                    &stderr,
                    &command_line,
                    false,
                )));
            }
            if let Err(save_err) = save_result {
                return Err(StewardError::Storage(save_err));
            }
            return Err(StewardError::Io(e));
        }
    };

    if exit_code != Some(0) {
        let command_line = format!("{} {}", pg_dump.display(), args.join(" "));
        return Err(StewardError::PgTool(classify_pg_failure(
            "pg_dump",
            exit_code,
            &stderr,
            &command_line,
            false,
        )));
    }

    save_result.map_err(StewardError::Storage)?;

    let total_mb = total_bytes as f64 / (1024.0 * 1024.0);
    let _ = progress.send(total_mb);

    info!(
        "pg_dump of database {} finished, {:.2} MiB streamed",
        database.id, total_mb
    );
    Ok(total_mb)
}
