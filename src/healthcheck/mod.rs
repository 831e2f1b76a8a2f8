//! Availability probing: a per-database state machine with N-attempts
//! debouncing before a database is declared down, immediate recovery on
//! the first successful probe, and change-edge-only notifications.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info};
use sqlx::PgPool;
use uuid::Uuid;

use crate::databases::{Database, DatabaseService, DatabaseType, HealthStatus};
use crate::errors::StewardError;
use crate::notifiers::NotificationService;
use crate::shutdown::Shutdown;

const TICK: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct HealthcheckConfig {
    pub database_id: Uuid,
    pub enabled: bool,
    pub notify_when_unavailable: bool,
    pub interval_minutes: i32,
    pub attempts_before_down: i32,
    pub store_attempts_days: i32,
}

impl HealthcheckConfig {
    pub fn default_for(database_id: Uuid) -> HealthcheckConfig {
        HealthcheckConfig {
            database_id,
            enabled: true,
            notify_when_unavailable: true,
            interval_minutes: 1,
            attempts_before_down: 3,
            store_attempts_days: 7,
        }
    }

    pub fn validate(&self) -> Result<(), StewardError> {
        if self.interval_minutes < 1 {
            return Err(StewardError::validation(
                "healthcheck interval must be at least one minute",
            ));
        }
        if self.attempts_before_down < 1 {
            return Err(StewardError::validation(
                "attempts before down must be at least 1",
            ));
        }
        if self.store_attempts_days < 1 {
            return Err(StewardError::validation(
                "attempt retention must be at least one day",
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct HealthcheckAttempt {
    pub id: Uuid,
    pub database_id: Uuid,
    pub status: HealthStatus,
    pub created_at: DateTime<Utc>,
}

/// Whether a new probe is due. The one-second grace keeps a tick that
/// lands just short of the interval boundary from skipping a whole cycle.
pub fn is_probe_due(
    now: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    interval_minutes: i32,
) -> bool {
    let last = match last_attempt_at {
        Some(last) => last,
        None => return true,
    };
    let next_due = last + chrono::Duration::minutes(i64::from(interval_minutes));
    now > next_due - chrono::Duration::seconds(1)
}

/// Debounce rule for the AVAILABLE → UNAVAILABLE edge: with a window of N,
/// the transition happens only when N attempts exist and every one of
/// them is UNAVAILABLE. `recent` is most recent first.
pub fn should_mark_down(recent: &[HealthStatus], attempts_before_down: i32) -> bool {
    if attempts_before_down <= 1 {
        return true;
    }
    let window = attempts_before_down as usize;
    if recent.len() < window {
        return false;
    }
    recent
        .iter()
        .take(window)
        .all(|status| *status == HealthStatus::Unavailable)
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    database_id: Uuid,
    enabled: bool,
    notify_when_unavailable: bool,
    interval_minutes: i32,
    attempts_before_down: i32,
    store_attempts_days: i32,
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    database_id: Uuid,
    #[sqlx(try_from = "String")]
    status: HealthStatus,
    created_at: DateTime<Utc>,
}

impl From<AttemptRow> for HealthcheckAttempt {
    fn from(row: AttemptRow) -> Self {
        HealthcheckAttempt {
            id: row.id,
            database_id: row.database_id,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct HealthcheckRepository {
    pool: PgPool,
}

impl HealthcheckRepository {
    pub fn new(pool: PgPool) -> Self {
        HealthcheckRepository { pool }
    }

    pub async fn find_config(
        &self,
        database_id: Uuid,
    ) -> Result<Option<HealthcheckConfig>, StewardError> {
        let row: Option<ConfigRow> = sqlx::query_as(
            "SELECT database_id, enabled, notify_when_unavailable, interval_minutes,
                    attempts_before_down, store_attempts_days
             FROM healthcheck_configs WHERE database_id = $1",
        )
        .bind(database_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| HealthcheckConfig {
            database_id: row.database_id,
            enabled: row.enabled,
            notify_when_unavailable: row.notify_when_unavailable,
            interval_minutes: row.interval_minutes,
            attempts_before_down: row.attempts_before_down,
            store_attempts_days: row.store_attempts_days,
        }))
    }

    pub async fn find_enabled_configs(&self) -> Result<Vec<HealthcheckConfig>, StewardError> {
        let rows: Vec<ConfigRow> = sqlx::query_as(
            "SELECT database_id, enabled, notify_when_unavailable, interval_minutes,
                    attempts_before_down, store_attempts_days
             FROM healthcheck_configs WHERE enabled",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HealthcheckConfig {
                database_id: row.database_id,
                enabled: row.enabled,
                notify_when_unavailable: row.notify_when_unavailable,
                interval_minutes: row.interval_minutes,
                attempts_before_down: row.attempts_before_down,
                store_attempts_days: row.store_attempts_days,
            })
            .collect())
    }

    pub async fn save_config(&self, config: &HealthcheckConfig) -> Result<(), StewardError> {
        config.validate()?;
        sqlx::query(
            "INSERT INTO healthcheck_configs
               (database_id, enabled, notify_when_unavailable, interval_minutes,
                attempts_before_down, store_attempts_days)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (database_id) DO UPDATE
             SET enabled = EXCLUDED.enabled,
                 notify_when_unavailable = EXCLUDED.notify_when_unavailable,
                 interval_minutes = EXCLUDED.interval_minutes,
                 attempts_before_down = EXCLUDED.attempts_before_down,
                 store_attempts_days = EXCLUDED.store_attempts_days",
        )
        .bind(config.database_id)
        .bind(config.enabled)
        .bind(config.notify_when_unavailable)
        .bind(config.interval_minutes)
        .bind(config.attempts_before_down)
        .bind(config.store_attempts_days)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_attempt(&self, attempt: &HealthcheckAttempt) -> Result<(), StewardError> {
        sqlx::query(
            "INSERT INTO healthcheck_attempts (id, database_id, status, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(attempt.id)
        .bind(attempt.database_id)
        .bind(attempt.status.to_string())
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_last_attempt(
        &self,
        database_id: Uuid,
    ) -> Result<Option<HealthcheckAttempt>, StewardError> {
        let row: Option<AttemptRow> = sqlx::query_as(
            "SELECT id, database_id, status, created_at
             FROM healthcheck_attempts
             WHERE database_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(database_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(HealthcheckAttempt::from))
    }

    /// Most recent first, capped at `limit`.
    pub async fn find_recent_attempts(
        &self,
        database_id: Uuid,
        limit: i64,
    ) -> Result<Vec<HealthcheckAttempt>, StewardError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            "SELECT id, database_id, status, created_at
             FROM healthcheck_attempts
             WHERE database_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(database_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(HealthcheckAttempt::from).collect())
    }

    pub async fn delete_attempts_older_than(
        &self,
        database_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<(), StewardError> {
        sqlx::query(
            "DELETE FROM healthcheck_attempts WHERE database_id = $1 AND created_at < $2",
        )
        .bind(database_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cascade for database removal.
    pub async fn delete_for_database(&self, database_id: Uuid) -> Result<(), StewardError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM healthcheck_attempts WHERE database_id = $1")
            .bind(database_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM healthcheck_configs WHERE database_id = $1")
            .bind(database_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct HealthcheckService {
    repository: HealthcheckRepository,
    database_service: DatabaseService,
    notification_service: NotificationService,
}

impl HealthcheckService {
    pub fn new(
        repository: HealthcheckRepository,
        database_service: DatabaseService,
        notification_service: NotificationService,
    ) -> Self {
        HealthcheckService {
            repository,
            database_service,
            notification_service,
        }
    }

    pub fn repository(&self) -> &HealthcheckRepository {
        &self.repository
    }

    /// The config is materialized with defaults the first time anything
    /// asks for it.
    pub async fn get_config_by_database_id(
        &self,
        database_id: Uuid,
    ) -> Result<HealthcheckConfig, StewardError> {
        if let Some(config) = self.repository.find_config(database_id).await? {
            return Ok(config);
        }
        let config = HealthcheckConfig::default_for(database_id);
        self.repository.save_config(&config).await?;
        Ok(config)
    }

    pub async fn save_config(
        &self,
        user_id: Uuid,
        config: &HealthcheckConfig,
    ) -> Result<(), StewardError> {
        self.database_service
            .get_database_with_auth(user_id, config.database_id)
            .await?;
        self.repository.save_config(config).await
    }

    /// One probe cycle for one database, gated on the configured interval.
    pub async fn run_check(
        &self,
        now: DateTime<Utc>,
        config: &HealthcheckConfig,
    ) -> Result<(), StewardError> {
        let database = self
            .database_service
            .get_database_by_id(config.database_id)
            .await?;

        if database.db_type != DatabaseType::Postgres {
            return Err(StewardError::validation("database type is not postgres"));
        }

        let last_attempt = self.repository.find_last_attempt(database.id).await?;
        if !is_probe_due(now, last_attempt.map(|a| a.created_at), config.interval_minutes) {
            return Ok(());
        }

        let status = match self
            .database_service
            .test_database_connection_direct(&database)
            .await
        {
            Ok(()) => HealthStatus::Available,
            Err(e) => {
                error!("Database {} health probe failed: {}", database.id, e);
                HealthStatus::Unavailable
            }
        };

        let attempt = HealthcheckAttempt {
            id: Uuid::new_v4(),
            database_id: database.id,
            status,
            created_at: now,
        };
        self.repository.insert_attempt(&attempt).await?;

        self.apply_transition(&database, config, &attempt).await?;

        let cutoff = now - chrono::Duration::days(i64::from(config.store_attempts_days));
        self.repository
            .delete_attempts_older_than(database.id, cutoff)
            .await?;

        Ok(())
    }

    async fn apply_transition(
        &self,
        database: &Database,
        config: &HealthcheckConfig,
        attempt: &HealthcheckAttempt,
    ) -> Result<(), StewardError> {
        let prev = database.health_status;
        let cur = attempt.status;

        if prev == Some(cur) {
            return Ok(());
        }

        match cur {
            // Recovery is reported on the first good probe
            HealthStatus::Available => {
                self.database_service
                    .set_health_status(database.id, HealthStatus::Available)
                    .await?;
                info!("Database {} is back online", database.id);
                self.send_status_notification(config, database, HealthStatus::Available)
                    .await;
            }
            HealthStatus::Unavailable => {
                let recent: Vec<HealthStatus> = self
                    .repository
                    .find_recent_attempts(database.id, i64::from(config.attempts_before_down))
                    .await?
                    .into_iter()
                    .map(|a| a.status)
                    .collect();

                if !should_mark_down(&recent, config.attempts_before_down) {
                    return Ok(());
                }

                self.database_service
                    .set_health_status(database.id, HealthStatus::Unavailable)
                    .await?;
                info!("Database {} is considered unavailable", database.id);
                self.send_status_notification(config, database, HealthStatus::Unavailable)
                    .await;
            }
        }

        Ok(())
    }

    async fn send_status_notification(
        &self,
        config: &HealthcheckConfig,
        database: &Database,
        new_status: HealthStatus,
    ) {
        if !config.notify_when_unavailable {
            return;
        }

        let (title, body) = match new_status {
            HealthStatus::Available => (
                format!("✅ DB [{}] is back online", database.name),
                format!(
                    "✅ The [{}] database is back online after being unavailable",
                    database.name
                ),
            ),
            HealthStatus::Unavailable => (
                format!("❌ DB [{}] is unavailable", database.name),
                format!("❌ The [{}] database is currently unavailable", database.name),
            ),
        };

        let notifiers = match self
            .notification_service
            .repository()
            .find_by_ids(&database.notifier_ids)
            .await
        {
            Ok(notifiers) => notifiers,
            Err(e) => {
                error!("Failed to load notifiers for health notification: {}", e);
                return;
            }
        };

        for notifier in &notifiers {
            self.notification_service
                .send_notification(notifier, &title, &body)
                .await;
        }
    }
}

/// The background loop: one pass immediately at startup, then one per
/// minute. Failures on a single database never stall the others.
pub struct HealthcheckWorker {
    service: HealthcheckService,
    shutdown: Shutdown,
}

impl HealthcheckWorker {
    pub fn new(service: HealthcheckService, shutdown: Shutdown) -> Self {
        HealthcheckWorker { service, shutdown }
    }

    pub async fn run(&self) {
        loop {
            if self.shutdown.is_triggered() {
                info!("Healthcheck worker stopping");
                return;
            }

            self.run_pass().await;

            if self.shutdown.sleep_interruptible(TICK).await {
                info!("Healthcheck worker stopping");
                return;
            }
        }
    }

    async fn run_pass(&self) {
        let configs = match self.service.repository().find_enabled_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                error!("Failed to load healthcheck configs: {}", e);
                return;
            }
        };

        let now = Utc::now();
        for config in configs {
            if let Err(e) = self.service.run_check(now, &config).await {
                error!(
                    "Healthcheck for database {} failed: {}",
                    config.database_id, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn probe_is_due_without_history() {
        assert!(is_probe_due(at(12, 0, 0), None, 1));
    }

    #[test]
    fn probe_gate_honours_the_interval_with_one_second_grace() {
        let last = at(12, 0, 0);

        // Well inside the interval: skip
        assert!(!is_probe_due(at(12, 0, 30), Some(last), 1));
        // One second before the boundary: the grace lets it through
        assert!(is_probe_due(at(12, 1, 0), Some(last), 1));
        // Past the boundary
        assert!(is_probe_due(at(12, 1, 30), Some(last), 1));

        // Longer interval
        assert!(!is_probe_due(at(12, 4, 58), Some(last), 5));
        assert!(is_probe_due(at(12, 5, 0), Some(last), 5));
    }

    #[test]
    fn down_transition_needs_a_full_window_of_failures() {
        use HealthStatus::{Available, Unavailable};

        // Fewer attempts than the window: no transition
        assert!(!should_mark_down(&[Unavailable, Unavailable], 3));
        // A single good probe in the window blocks it
        assert!(!should_mark_down(&[Unavailable, Available, Unavailable], 3));
        // Full window of failures
        assert!(should_mark_down(
            &[Unavailable, Unavailable, Unavailable],
            3
        ));
        // Older history beyond the window is ignored
        assert!(should_mark_down(
            &[Unavailable, Unavailable, Unavailable, Available],
            3
        ));
    }

    #[test]
    fn single_attempt_window_transitions_immediately() {
        use HealthStatus::Unavailable;
        assert!(should_mark_down(&[], 1));
        assert!(should_mark_down(&[Unavailable], 0));
    }

    #[test]
    fn default_config_matches_first_access_contract() {
        let config = HealthcheckConfig::default_for(Uuid::new_v4());
        assert!(config.enabled);
        assert!(config.notify_when_unavailable);
        assert_eq!(config.interval_minutes, 1);
        assert_eq!(config.attempts_before_down, 3);
        assert_eq!(config.store_attempts_days, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_validation_rejects_non_positive_values() {
        let mut config = HealthcheckConfig::default_for(Uuid::new_v4());
        config.interval_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = HealthcheckConfig::default_for(Uuid::new_v4());
        config.attempts_before_down = 0;
        assert!(config.validate().is_err());

        let mut config = HealthcheckConfig::default_for(Uuid::new_v4());
        config.store_attempts_days = 0;
        assert!(config.validate().is_err());
    }
}
