//! External-process plumbing shared by the backup and restore pipelines:
//! spawning `pg_dump`/`pg_restore` with the right environment overlay,
//! draining stderr, cancellation-aware waiting and the 32 KiB copy loop.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::warn;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::shutdown::Shutdown;

/// Hard deadline for one backup or restore run.
pub const PIPELINE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const COPY_BUF_SIZE: usize = 32 * 1024;
const PROGRESS_STEP_MB: f64 = 1.0;

/// Builds a `pg_dump`/`pg_restore` invocation with the credential file and
/// encoding/SSL environment the PostgreSQL client tools expect.
pub fn pg_command(bin: &Path, args: &[String], pgpass: &Path, require_ssl: bool) -> Command {
    let mut cmd = Command::new(bin);
    cmd.args(args)
        .env("PGPASSFILE", pgpass)
        .env("PGCLIENTENCODING", "UTF8")
        .env("PGCONNECT_TIMEOUT", "30")
        .env("LC_ALL", "C.UTF-8")
        .env("LANG", "C.UTF-8")
        .env("PGOPTIONS", "--client-encoding=UTF8")
        .env("PGSSLMODE", if require_ssl { "require" } else { "prefer" })
        // No client certificates; stale values would break the handshake
        .env("PGSSLCERT", "")
        .env("PGSSLKEY", "")
        .env("PGSSLROOTCERT", "")
        .env("PGSSLCRL", "")
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Reads the child's stderr to completion in its own task so the pipe never
/// backs up while stdout is being streamed.
pub fn spawn_stderr_reader(
    child: &mut Child,
) -> tokio::task::JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Waits for the child, sampling the shutdown flag and the deadline every
/// second. A triggered shutdown or an expired deadline kills the process.
/// Returns the exit code (None when killed by a signal) and whether the
/// wait ended because of a shutdown request.
pub async fn wait_with_cancellation(
    child: &mut Child,
    shutdown: &Shutdown,
    deadline: Instant,
) -> std::io::Result<(Option<i32>, bool)> {
    let status = loop {
        if shutdown.is_triggered() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill child process on shutdown: {}", e);
            }
            return Ok((child.wait().await?.code(), true));
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill child process on timeout: {}", e);
            }
            break child.wait().await?;
        }

        match child.try_wait()? {
            Some(status) => break status,
            None => tokio::time::sleep(Duration::from_secs(1)).await,
        }
    };

    Ok((status.code(), false))
}

#[derive(Error, Debug)]
pub enum StreamCopyError {
    #[error("copy cancelled due to shutdown")]
    Shutdown,
    #[error("copy deadline exceeded")]
    DeadlineExceeded,
    #[error("copy failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Copies `reader` into `writer` in 32 KiB blocks, checking the shutdown
/// flag and the deadline on every iteration. When a progress sender is
/// given, the running total is reported each time it crosses another
/// megabyte boundary, in MiB.
pub async fn stream_copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    shutdown: &Shutdown,
    deadline: Instant,
    progress: Option<&mpsc::UnboundedSender<f64>>,
) -> Result<u64, StreamCopyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total_bytes: u64 = 0;
    let mut last_reported_mb = 0.0_f64;

    loop {
        if shutdown.is_triggered() {
            return Err(StreamCopyError::Shutdown);
        }
        if Instant::now() >= deadline {
            return Err(StreamCopyError::DeadlineExceeded);
        }

        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }

        writer.write_all(&buf[..read]).await?;
        total_bytes += read as u64;

        if let Some(progress) = progress {
            let current_mb = total_bytes as f64 / (1024.0 * 1024.0);
            if current_mb >= last_reported_mb + PROGRESS_STEP_MB {
                let _ = progress.send(current_mb);
                last_reported_mb = current_mb;
            }
        }
    }

    writer.flush().await?;
    Ok(total_bytes)
}

// Windows access violation; pg_dump dies with this on broken installations.
const ACCESS_VIOLATION_EXIT: i32 = -1073741819; // 0xC0000005

/// Turns an exit code and captured stderr into an operator-readable message.
/// `pg_restore` runs additionally map a missing target database onto a
/// "create it first" hint.
pub fn classify_pg_failure(
    tool: &str,
    exit_code: Option<i32>,
    stderr: &str,
    command_line: &str,
    is_restore: bool,
) -> String {
    let stderr_trimmed = stderr.trim();

    if exit_code == Some(1) && stderr_trimmed.is_empty() {
        let mut causes = String::from(
            "1) Connection timeout or refused connection, \
             2) Authentication failure with incorrect credentials, \
             3) Database does not exist, \
             4) Network connectivity issues, \
             5) PostgreSQL server not running",
        );
        if is_restore {
            causes.push_str(", 6) Backup file is corrupted or incompatible");
        }
        return format!(
            "{tool} failed with exit status 1 but provided no error details. \
             This often indicates: {causes}. Command executed: {command_line}"
        );
    }

    if exit_code == Some(ACCESS_VIOLATION_EXIT) {
        return format!(
            "{tool} crashed with access violation (0xC0000005). This may indicate \
             incompatible PostgreSQL version, corrupted installation, or connection \
             issues. stderr: {stderr}"
        );
    }

    if exit_code == Some(1) || exit_code == Some(2) {
        if contains_ignore_case(stderr, "pg_hba.conf") {
            return format!(
                "PostgreSQL connection rejected by server configuration (pg_hba.conf). \
                 The server may not allow connections from your address or may require \
                 different authentication settings. stderr: {stderr}"
            );
        }
        if contains_ignore_case(stderr, "no password supplied")
            || contains_ignore_case(stderr, "fe_sendauth")
        {
            return format!(
                "PostgreSQL authentication failed - no password supplied. \
                 Check the stored credentials for this database. stderr: {stderr}"
            );
        }
        if contains_ignore_case(stderr, "ssl") && contains_ignore_case(stderr, "connection") {
            return format!(
                "PostgreSQL SSL connection failed. The server may require SSL \
                 encryption or have SSL configuration issues. stderr: {stderr}"
            );
        }
        if contains_ignore_case(stderr, "connection") && contains_ignore_case(stderr, "refused") {
            return format!(
                "PostgreSQL connection refused. Check if the server is running and \
                 accessible from your network. stderr: {stderr}"
            );
        }
        if contains_ignore_case(stderr, "authentication")
            || contains_ignore_case(stderr, "password")
        {
            return format!(
                "PostgreSQL authentication failed. Check username and password. \
                 stderr: {stderr}"
            );
        }
        if contains_ignore_case(stderr, "timeout") {
            return format!(
                "PostgreSQL connection timeout. The server may be unreachable or \
                 overloaded. stderr: {stderr}"
            );
        }
        if is_restore
            && contains_ignore_case(stderr, "database")
            && contains_ignore_case(stderr, "does not exist")
        {
            return format!(
                "Target database does not exist. Create the database before \
                 restoring. stderr: {stderr}"
            );
        }
    }

    match exit_code {
        Some(code) => format!("{tool} failed with exit status {code} - stderr: {stderr}"),
        None => format!("{tool} was terminated by a signal - stderr: {stderr}"),
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stderr_on_exit_one_lists_likely_causes() {
        let msg = classify_pg_failure("pg_dump", Some(1), "  \n", "pg_dump -Fc", false);
        assert!(msg.contains("no error details"));
        assert!(msg.contains("5) PostgreSQL server not running"));
        assert!(!msg.contains("corrupted or incompatible"));

        let restore_msg = classify_pg_failure("pg_restore", Some(1), "", "pg_restore", true);
        assert!(restore_msg.contains("6) Backup file is corrupted or incompatible"));
    }

    #[test]
    fn access_violation_is_reported_explicitly() {
        let msg = classify_pg_failure("pg_dump", Some(-1073741819), "boom", "pg_dump", false);
        assert!(msg.contains("access violation (0xC0000005)"));
    }

    #[test]
    fn stderr_substrings_map_to_specific_messages() {
        let cases = [
            ("FATAL: no pg_hba.conf entry for host", "pg_hba.conf"),
            ("fe_sendauth: no password supplied", "no password supplied"),
            ("SSL connection has been closed unexpectedly", "SSL connection failed"),
            ("could not connect: Connection refused", "connection refused"),
            ("password authentication failed for user", "Check username and password"),
            ("timeout expired while connecting", "connection timeout"),
        ];

        for (stderr, expected) in cases {
            let msg = classify_pg_failure("pg_dump", Some(1), stderr, "pg_dump", false);
            assert!(
                contains_ignore_case(&msg, expected),
                "stderr {stderr:?} produced {msg:?}, expected fragment {expected:?}"
            );
        }
    }

    #[test]
    fn restore_maps_missing_target_database() {
        let msg = classify_pg_failure(
            "pg_restore",
            Some(1),
            "pg_restore: error: connection to server failed: database \"target\" does not exist",
            "pg_restore",
            true,
        );
        assert!(msg.contains("Create the database before restoring"));
    }

    #[test]
    fn unmatched_stderr_falls_back_to_raw_report() {
        let msg = classify_pg_failure("pg_dump", Some(3), "disk quota exceeded", "pg_dump", false);
        assert!(msg.contains("exit status 3"));
        assert!(msg.contains("disk quota exceeded"));
    }

    #[tokio::test]
    async fn stream_copy_reports_monotone_progress_in_mib_steps() {
        let data = vec![7u8; 3 * 1024 * 1024 + 512];
        let mut reader = std::io::Cursor::new(data.clone());
        let mut sink = std::io::Cursor::new(Vec::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let shutdown = Shutdown::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        let total = stream_copy(&mut reader, &mut sink, &shutdown, deadline, Some(&tx))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(total, data.len() as u64);
        assert_eq!(sink.into_inner(), data);

        let mut reported = Vec::new();
        while let Some(mb) = rx.recv().await {
            reported.push(mb);
        }
        assert_eq!(reported.len(), 3);
        for pair in reported.windows(2) {
            assert!(pair[1] >= pair[0] + 1.0, "progress not 1 MiB apart: {reported:?}");
        }
    }

    #[tokio::test]
    async fn stream_copy_stops_on_shutdown() {
        let data = vec![0u8; 1024 * 1024];
        let mut reader = std::io::Cursor::new(data);
        let mut sink = std::io::Cursor::new(Vec::new());

        let shutdown = Shutdown::new();
        shutdown.trigger();
        let deadline = Instant::now() + Duration::from_secs(10);

        let err = stream_copy(&mut reader, &mut sink, &shutdown, deadline, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamCopyError::Shutdown));
    }
}
