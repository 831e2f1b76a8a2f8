//! Per-database backup configuration: the calendar interval, retention
//! period, target storage, notification triggers and retry budget.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use futures::future::BoxFuture;
use sqlx::PgPool;
use uuid::Uuid;

use super::interval::{Interval, IntervalKind};
use crate::errors::StewardError;

/// Retention horizon for completed backups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorePeriod {
    Day,
    Week,
    Month,
    ThreeMonths,
    SixMonths,
    Year,
    TwoYears,
    ThreeYears,
    FourYears,
    FiveYears,
    Forever,
}

impl StorePeriod {
    /// None means backups are kept forever.
    pub fn duration(&self) -> Option<Duration> {
        let days = match self {
            StorePeriod::Day => 1,
            StorePeriod::Week => 7,
            StorePeriod::Month => 30,
            StorePeriod::ThreeMonths => 90,
            StorePeriod::SixMonths => 180,
            StorePeriod::Year => 365,
            StorePeriod::TwoYears => 730,
            StorePeriod::ThreeYears => 1095,
            StorePeriod::FourYears => 1460,
            StorePeriod::FiveYears => 1825,
            StorePeriod::Forever => return None,
        };
        Some(Duration::days(days))
    }
}

impl fmt::Display for StorePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorePeriod::Day => "DAY",
            StorePeriod::Week => "WEEK",
            StorePeriod::Month => "MONTH",
            StorePeriod::ThreeMonths => "3_MONTH",
            StorePeriod::SixMonths => "6_MONTH",
            StorePeriod::Year => "YEAR",
            StorePeriod::TwoYears => "2_YEARS",
            StorePeriod::ThreeYears => "3_YEARS",
            StorePeriod::FourYears => "4_YEARS",
            StorePeriod::FiveYears => "5_YEARS",
            StorePeriod::Forever => "FOREVER",
        };
        f.write_str(s)
    }
}

impl TryFrom<String> for StorePeriod {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "DAY" => Ok(StorePeriod::Day),
            "WEEK" => Ok(StorePeriod::Week),
            "MONTH" => Ok(StorePeriod::Month),
            "3_MONTH" => Ok(StorePeriod::ThreeMonths),
            "6_MONTH" => Ok(StorePeriod::SixMonths),
            "YEAR" => Ok(StorePeriod::Year),
            "2_YEARS" => Ok(StorePeriod::TwoYears),
            "3_YEARS" => Ok(StorePeriod::ThreeYears),
            "4_YEARS" => Ok(StorePeriod::FourYears),
            "5_YEARS" => Ok(StorePeriod::FiveYears),
            "FOREVER" => Ok(StorePeriod::Forever),
            other => Err(StewardError::validation(format!(
                "unknown store period: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationTrigger {
    BackupFailed,
    BackupSuccess,
}

impl fmt::Display for NotificationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationTrigger::BackupFailed => "BACKUP_FAILED",
            NotificationTrigger::BackupSuccess => "BACKUP_SUCCESS",
        };
        f.write_str(s)
    }
}

impl TryFrom<String> for NotificationTrigger {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "BACKUP_FAILED" => Ok(NotificationTrigger::BackupFailed),
            "BACKUP_SUCCESS" => Ok(NotificationTrigger::BackupSuccess),
            other => Err(StewardError::validation(format!(
                "unknown notification trigger: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackupConfig {
    pub database_id: Uuid,
    pub enabled: bool,
    pub store_period: StorePeriod,
    pub interval: Interval,
    pub storage_id: Option<Uuid>,
    pub notify_on: Vec<NotificationTrigger>,
    pub retry_if_failed: bool,
    pub max_failed_tries: i32,
    /// Parallel jobs handed to pg_restore, clamped to 1..=8 at use
    pub cpu_count: i32,
}

impl BackupConfig {
    /// State a database starts with before anyone touches the config.
    pub fn default_for(database_id: Uuid) -> BackupConfig {
        BackupConfig {
            database_id,
            enabled: false,
            store_period: StorePeriod::Week,
            interval: Interval::daily_at("04:00"),
            storage_id: None,
            notify_on: vec![
                NotificationTrigger::BackupFailed,
                NotificationTrigger::BackupSuccess,
            ],
            retry_if_failed: true,
            max_failed_tries: 3,
            cpu_count: 1,
        }
    }

    pub fn notifies_on(&self, trigger: NotificationTrigger) -> bool {
        self.notify_on.contains(&trigger)
    }

    pub fn validate(&self) -> Result<(), StewardError> {
        if self.enabled && self.storage_id.is_none() {
            return Err(StewardError::validation(
                "a storage is required when backups are enabled",
            ));
        }
        if self.retry_if_failed && self.max_failed_tries < 1 {
            return Err(StewardError::validation(
                "max failed tries must be at least 1 when retries are enabled",
            ));
        }
        if self.cpu_count < 1 {
            return Err(StewardError::validation("cpu count must be at least 1"));
        }
        self.interval.validate()
    }
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    database_id: Uuid,
    enabled: bool,
    store_period: String,
    storage_id: Option<Uuid>,
    notify_on: Vec<String>,
    retry_if_failed: bool,
    max_failed_tries: i32,
    cpu_count: i32,
}

#[derive(sqlx::FromRow)]
struct IntervalRow {
    kind: String,
    time_of_day: Option<String>,
    weekday: Option<i32>,
    day_of_month: Option<i32>,
}

#[derive(Clone)]
pub struct BackupConfigRepository {
    pool: PgPool,
}

impl BackupConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        BackupConfigRepository { pool }
    }

    pub async fn find_by_database_id(
        &self,
        database_id: Uuid,
    ) -> Result<Option<BackupConfig>, StewardError> {
        let row: Option<ConfigRow> = sqlx::query_as(
            "SELECT database_id, enabled, store_period, storage_id, notify_on,
                    retry_if_failed, max_failed_tries, cpu_count
             FROM backup_configs WHERE database_id = $1",
        )
        .bind(database_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let interval: IntervalRow = sqlx::query_as(
            "SELECT kind, time_of_day, weekday, day_of_month
             FROM intervals WHERE database_id = $1",
        )
        .bind(database_id)
        .fetch_one(&self.pool)
        .await?;

        let mut notify_on = Vec::with_capacity(row.notify_on.len());
        for trigger in row.notify_on {
            notify_on.push(NotificationTrigger::try_from(trigger)?);
        }

        Ok(Some(BackupConfig {
            database_id: row.database_id,
            enabled: row.enabled,
            store_period: StorePeriod::try_from(row.store_period)?,
            interval: Interval {
                kind: IntervalKind::try_from(interval.kind)?,
                time_of_day: interval.time_of_day,
                weekday: interval.weekday.map(|w| w as u8),
                day_of_month: interval.day_of_month.map(|d| d as u8),
            },
            storage_id: row.storage_id,
            notify_on,
            retry_if_failed: row.retry_if_failed,
            max_failed_tries: row.max_failed_tries,
            cpu_count: row.cpu_count,
        }))
    }

    pub async fn find_enabled(&self) -> Result<Vec<BackupConfig>, StewardError> {
        let ids: Vec<(Uuid,)> =
            sqlx::query_as("SELECT database_id FROM backup_configs WHERE enabled")
                .fetch_all(&self.pool)
                .await?;

        let mut configs = Vec::with_capacity(ids.len());
        for (database_id,) in ids {
            if let Some(config) = self.find_by_database_id(database_id).await? {
                configs.push(config);
            }
        }
        Ok(configs)
    }

    /// Upserts the config and its interval in one transaction.
    pub async fn save(&self, config: &BackupConfig) -> Result<(), StewardError> {
        config.validate()?;

        let notify_on: Vec<String> = config.notify_on.iter().map(|t| t.to_string()).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO backup_configs
               (database_id, enabled, store_period, storage_id, notify_on,
                retry_if_failed, max_failed_tries, cpu_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (database_id) DO UPDATE
             SET enabled = EXCLUDED.enabled, store_period = EXCLUDED.store_period,
                 storage_id = EXCLUDED.storage_id, notify_on = EXCLUDED.notify_on,
                 retry_if_failed = EXCLUDED.retry_if_failed,
                 max_failed_tries = EXCLUDED.max_failed_tries,
                 cpu_count = EXCLUDED.cpu_count",
        )
        .bind(config.database_id)
        .bind(config.enabled)
        .bind(config.store_period.to_string())
        .bind(config.storage_id)
        .bind(&notify_on)
        .bind(config.retry_if_failed)
        .bind(config.max_failed_tries)
        .bind(config.cpu_count)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO intervals (database_id, kind, time_of_day, weekday, day_of_month)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (database_id) DO UPDATE
             SET kind = EXCLUDED.kind, time_of_day = EXCLUDED.time_of_day,
                 weekday = EXCLUDED.weekday, day_of_month = EXCLUDED.day_of_month",
        )
        .bind(config.database_id)
        .bind(config.interval.kind.to_string())
        .bind(&config.interval.time_of_day)
        .bind(config.interval.weekday.map(i32::from))
        .bind(config.interval.day_of_month.map(i32::from))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, database_id: Uuid) -> Result<(), StewardError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM intervals WHERE database_id = $1")
            .bind(database_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM backup_configs WHERE database_id = $1")
            .bind(database_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Invoked before a config's storage changes; the backup service refuses
/// the change while a backup is running and clears out old artefacts.
pub type StorageChangeHook =
    Arc<dyn Fn(Uuid) -> BoxFuture<'static, Result<(), StewardError>> + Send + Sync>;

#[derive(Clone)]
pub struct BackupConfigService {
    repository: BackupConfigRepository,
    storage_change_hooks: Arc<Mutex<Vec<StorageChangeHook>>>,
}

impl BackupConfigService {
    pub fn new(repository: BackupConfigRepository) -> Self {
        BackupConfigService {
            repository,
            storage_change_hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_storage_change_hook(&self, hook: StorageChangeHook) {
        self.storage_change_hooks
            .lock()
            .expect("storage change hook registry poisoned")
            .push(hook);
    }

    /// The config is materialized with defaults the first time anything
    /// asks for it.
    pub async fn get_config_by_database_id(
        &self,
        database_id: Uuid,
    ) -> Result<BackupConfig, StewardError> {
        if let Some(config) = self.repository.find_by_database_id(database_id).await? {
            return Ok(config);
        }

        let config = BackupConfig::default_for(database_id);
        self.repository.save(&config).await?;
        Ok(config)
    }

    pub async fn get_enabled_configs(&self) -> Result<Vec<BackupConfig>, StewardError> {
        self.repository.find_enabled().await
    }

    pub async fn save_config(&self, config: &BackupConfig) -> Result<(), StewardError> {
        let mut config = config.clone();
        // Disabling releases the storage reference
        if !config.enabled {
            config.storage_id = None;
        }
        config.validate()?;

        let existing = self.repository.find_by_database_id(config.database_id).await?;
        let storage_changing = match &existing {
            Some(existing) => {
                existing.storage_id.is_some() && existing.storage_id != config.storage_id
            }
            None => false,
        };

        if storage_changing {
            let hooks: Vec<StorageChangeHook> = self
                .storage_change_hooks
                .lock()
                .expect("storage change hook registry poisoned")
                .clone();
            for hook in hooks {
                hook(config.database_id).await?;
            }
        }

        self.repository.save(&config).await
    }

    pub async fn delete_config(&self, database_id: Uuid) -> Result<(), StewardError> {
        self.repository.delete(database_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_period_durations_match_the_retention_table() {
        let days = |p: StorePeriod| p.duration().map(|d| d.num_days());
        assert_eq!(days(StorePeriod::Day), Some(1));
        assert_eq!(days(StorePeriod::Week), Some(7));
        assert_eq!(days(StorePeriod::Month), Some(30));
        assert_eq!(days(StorePeriod::ThreeMonths), Some(90));
        assert_eq!(days(StorePeriod::SixMonths), Some(180));
        assert_eq!(days(StorePeriod::Year), Some(365));
        assert_eq!(days(StorePeriod::TwoYears), Some(730));
        assert_eq!(days(StorePeriod::ThreeYears), Some(1095));
        assert_eq!(days(StorePeriod::FourYears), Some(1460));
        assert_eq!(days(StorePeriod::FiveYears), Some(1825));
        assert_eq!(days(StorePeriod::Forever), None);
    }

    #[test]
    fn store_period_round_trips_through_text() {
        for period in [
            StorePeriod::Day,
            StorePeriod::Week,
            StorePeriod::Month,
            StorePeriod::ThreeMonths,
            StorePeriod::SixMonths,
            StorePeriod::Year,
            StorePeriod::TwoYears,
            StorePeriod::ThreeYears,
            StorePeriod::FourYears,
            StorePeriod::FiveYears,
            StorePeriod::Forever,
        ] {
            assert_eq!(StorePeriod::try_from(period.to_string()).unwrap(), period);
        }
        assert!(StorePeriod::try_from("DECADE".to_string()).is_err());
    }

    #[test]
    fn default_config_matches_first_access_contract() {
        let database_id = Uuid::new_v4();
        let config = BackupConfig::default_for(database_id);

        assert!(!config.enabled);
        assert_eq!(config.store_period, StorePeriod::Week);
        assert_eq!(config.interval.kind, IntervalKind::Daily);
        assert_eq!(config.interval.time_of_day.as_deref(), Some("04:00"));
        assert!(config.notifies_on(NotificationTrigger::BackupFailed));
        assert!(config.notifies_on(NotificationTrigger::BackupSuccess));
        assert!(config.retry_if_failed);
        assert_eq!(config.max_failed_tries, 3);
        assert_eq!(config.cpu_count, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_config_requires_storage() {
        let mut config = BackupConfig::default_for(Uuid::new_v4());
        config.enabled = true;
        assert!(config.validate().is_err());

        config.storage_id = Some(Uuid::new_v4());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn retry_budget_must_be_positive_when_retries_are_on() {
        let mut config = BackupConfig::default_for(Uuid::new_v4());
        config.max_failed_tries = 0;
        assert!(config.validate().is_err());

        config.retry_if_failed = false;
        config.max_failed_tries = 0;
        assert!(config.validate().is_ok());
    }
}
