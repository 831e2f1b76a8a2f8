//! The periodic backup loop: every minute it prunes expired backups, then
//! dispatches any database whose interval slot has arrived or whose retry
//! budget still has tries left.

use std::time::Duration;

use chrono::Utc;
use log::{error, info};

use super::config::{BackupConfig, BackupConfigService};
use super::{Backup, BackupService, BackupStatus};
use crate::errors::StewardError;
use crate::heartbeat::HeartbeatUpdater;
use crate::shutdown::Shutdown;
use crate::storages::StorageService;

const TICK: Duration = Duration::from_secs(60);

/// How many tries are left after the most recent failure. Zero when the
/// last backup exists and did not fail, when retries are off, or when the
/// last `max_failed_tries` runs all failed.
pub fn remaining_retries(config: &BackupConfig, recent_backups: &[Backup]) -> i32 {
    let last = match recent_backups.first() {
        Some(last) => last,
        None => return 0,
    };
    if last.status != BackupStatus::Failed {
        return 0;
    }
    if !config.retry_if_failed {
        return 0;
    }

    let failed_count = recent_backups
        .iter()
        .take(config.max_failed_tries as usize)
        .filter(|b| b.status == BackupStatus::Failed)
        .count() as i32;

    config.max_failed_tries - failed_count
}

pub struct BackupScheduler {
    backup_service: BackupService,
    backup_config_service: BackupConfigService,
    storage_service: StorageService,
    heartbeat: HeartbeatUpdater,
    shutdown: Shutdown,
}

impl BackupScheduler {
    pub fn new(
        backup_service: BackupService,
        backup_config_service: BackupConfigService,
        storage_service: StorageService,
        heartbeat: HeartbeatUpdater,
        shutdown: Shutdown,
    ) -> Self {
        BackupScheduler {
            backup_service,
            backup_config_service,
            storage_service,
            heartbeat,
            shutdown,
        }
    }

    /// Periodic phase. The startup sweeper must have completed before this
    /// is entered.
    pub async fn run(&self) {
        loop {
            if self.shutdown.is_triggered() {
                info!("Backup scheduler stopping");
                return;
            }

            if let Err(e) = self.clean_old_backups().await {
                error!("Failed to clean old backups: {}", e);
            }

            if let Err(e) = self.run_pending_backups().await {
                error!("Failed to run pending backups: {}", e);
            }

            self.heartbeat.update_heartbeat();

            if self.shutdown.sleep_interruptible(TICK).await {
                info!("Backup scheduler stopping");
                return;
            }
        }
    }

    /// Retention pass: for every enabled config with a finite store
    /// period, delete artefacts and rows older than the cutoff. Storage
    /// errors are logged and the row removed anyway; the remote object may
    /// already be gone. No notifications here.
    async fn clean_old_backups(&self) -> Result<(), StewardError> {
        let configs = self.backup_config_service.get_enabled_configs().await?;

        for config in configs {
            let retention = match config.store_period.duration() {
                Some(retention) => retention,
                None => continue,
            };
            let cutoff = Utc::now() - retention;

            let expired = match self
                .backup_service
                .repository()
                .find_older_than(config.database_id, cutoff)
                .await
            {
                Ok(expired) => expired,
                Err(e) => {
                    error!(
                        "Failed to find expired backups for database {}: {}",
                        config.database_id, e
                    );
                    continue;
                }
            };

            for backup in expired {
                match self.storage_service.get_storage_by_id(backup.storage_id).await {
                    Ok(storage) => {
                        if let Err(e) = storage.backend.delete(backup.id).await {
                            error!("Failed to delete expired artefact {}: {}", backup.id, e);
                        }
                    }
                    Err(e) => {
                        error!(
                            "Storage {} for expired backup {} is gone: {}",
                            backup.storage_id, backup.id, e
                        );
                    }
                }

                if let Err(e) = self
                    .backup_service
                    .repository()
                    .delete_by_id(backup.id)
                    .await
                {
                    error!("Failed to delete expired backup row {}: {}", backup.id, e);
                    continue;
                }

                info!(
                    "Deleted expired backup {} of database {}",
                    backup.id, config.database_id
                );
            }
        }

        Ok(())
    }

    async fn run_pending_backups(&self) -> Result<(), StewardError> {
        let configs = self.backup_config_service.get_enabled_configs().await?;
        let now = Utc::now();

        for config in configs {
            let recent = match self
                .backup_service
                .repository()
                .find_recent_by_database_id(config.database_id, config.max_failed_tries.max(1) as i64)
                .await
            {
                Ok(recent) => recent,
                Err(e) => {
                    error!(
                        "Failed to load recent backups for database {}: {}",
                        config.database_id, e
                    );
                    continue;
                }
            };

            let last_backup_time = recent.first().map(|b| b.created_at);
            let should_trigger = config.interval.should_trigger_backup(now, last_backup_time);
            let retries_left = remaining_retries(&config, &recent);

            if !should_trigger && retries_left <= 0 {
                continue;
            }

            info!(
                "Dispatching backup for database {} ({}, {} retries left)",
                config.database_id, config.interval.kind, retries_left
            );

            // A run outside a retry sequence, or the final retry, reports
            // success; intermediate retries stay quiet
            let is_last_try = retries_left <= 1;
            let service = self.backup_service.clone();
            let database_id = config.database_id;
            tokio::spawn(async move {
                service.make_backup(database_id, is_last_try).await;
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn backup(status: BackupStatus, minutes_ago: i64) -> Backup {
        Backup {
            id: Uuid::new_v4(),
            database_id: Uuid::new_v4(),
            storage_id: Uuid::new_v4(),
            status,
            fail_message: None,
            size_mb: 0.0,
            duration_ms: 0,
            created_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
        }
    }

    fn config_with_retries(max: i32) -> BackupConfig {
        let mut config = BackupConfig::default_for(Uuid::new_v4());
        config.retry_if_failed = true;
        config.max_failed_tries = max;
        config
    }

    #[test]
    fn no_backups_leave_no_retry_budget() {
        let config = config_with_retries(3);
        assert_eq!(remaining_retries(&config, &[]), 0);
    }

    #[test]
    fn successful_last_backup_means_no_retries() {
        let config = config_with_retries(3);
        let recent = vec![
            backup(BackupStatus::Completed, 10),
            backup(BackupStatus::Failed, 70),
        ];
        assert_eq!(remaining_retries(&config, &recent), 0);
    }

    #[test]
    fn first_failure_leaves_budget_minus_one() {
        let config = config_with_retries(3);
        let recent = vec![
            backup(BackupStatus::Failed, 5),
            backup(BackupStatus::Completed, 65),
            backup(BackupStatus::Completed, 125),
        ];
        assert_eq!(remaining_retries(&config, &recent), 2);
    }

    #[test]
    fn exhausted_budget_stops_dispatch() {
        // Scenario: three consecutive failures with max=3
        let config = config_with_retries(3);
        let recent = vec![
            backup(BackupStatus::Failed, 5),
            backup(BackupStatus::Failed, 25),
            backup(BackupStatus::Failed, 45),
        ];
        assert_eq!(remaining_retries(&config, &recent), 0);
    }

    #[test]
    fn retries_disabled_means_no_budget() {
        let mut config = config_with_retries(3);
        config.retry_if_failed = false;
        let recent = vec![backup(BackupStatus::Failed, 5)];
        assert_eq!(remaining_retries(&config, &recent), 0);
    }

    #[test]
    fn only_the_window_of_max_tries_counts() {
        let config = config_with_retries(2);
        // Three failures exist but only the two most recent are in scope
        let recent = vec![
            backup(BackupStatus::Failed, 5),
            backup(BackupStatus::Failed, 25),
            backup(BackupStatus::Failed, 45),
        ];
        assert_eq!(remaining_retries(&config, &recent), 0);

        let one_failed = vec![
            backup(BackupStatus::Failed, 5),
            backup(BackupStatus::Completed, 25),
        ];
        assert_eq!(remaining_retries(&config, &one_failed), 1);
    }
}
