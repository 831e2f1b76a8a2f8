//! Registered PostgreSQL instances: the entity, its embedded connection,
//! the availability status driven by the healthcheck loop and a direct
//! connection probe used both by "test connection" and the health prober.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::info;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{Connection, PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::errors::StewardError;
use crate::pgtools::PostgresVersion;

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseType {
    Postgres,
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("POSTGRES")
    }
}

impl TryFrom<String> for DatabaseType {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "POSTGRES" => Ok(DatabaseType::Postgres),
            other => Err(StewardError::validation(format!(
                "invalid database type: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Available,
    Unavailable,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Available => "AVAILABLE",
            HealthStatus::Unavailable => "UNAVAILABLE",
        };
        f.write_str(s)
    }
}

impl TryFrom<String> for HealthStatus {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "AVAILABLE" => Ok(HealthStatus::Available),
            "UNAVAILABLE" => Ok(HealthStatus::Unavailable),
            other => Err(StewardError::validation(format!(
                "invalid health status: {other}"
            ))),
        }
    }
}

/// Connection data for one PostgreSQL instance.
#[derive(Clone, Debug)]
pub struct PostgresConnection {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub require_ssl: bool,
    pub version: PostgresVersion,
}

impl PostgresConnection {
    pub fn validate(&self) -> Result<(), StewardError> {
        if self.host.is_empty() {
            return Err(StewardError::validation("host is required"));
        }
        if self.port == 0 {
            return Err(StewardError::validation("port is required"));
        }
        if self.username.is_empty() {
            return Err(StewardError::validation("username is required"));
        }
        if self.password.is_empty() {
            return Err(StewardError::validation("password is required"));
        }
        if self.database.is_empty() {
            return Err(StewardError::validation("database name is required"));
        }
        Ok(())
    }

    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(if self.require_ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            })
    }
}

#[derive(Clone)]
pub struct Database {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub db_type: DatabaseType,
    pub connection: PostgresConnection,
    pub notifier_ids: Vec<Uuid>,
    pub last_backup_time: Option<DateTime<Utc>>,
    pub last_backup_error: Option<String>,
    pub health_status: Option<HealthStatus>,
}

impl Database {
    pub fn validate(&self) -> Result<(), StewardError> {
        if self.name.is_empty() {
            return Err(StewardError::validation("name is required"));
        }
        self.connection.validate()
    }
}

/// A short-lived direct connection that verifies what the pipelines need:
/// CONNECT privilege on the configured database and a server major version
/// matching the one we will pick pg_dump/pg_restore binaries for.
pub async fn test_connection_direct(conn: &PostgresConnection) -> Result<(), StewardError> {
    conn.validate()?;

    let mut pg = tokio::time::timeout(
        CONNECT_PROBE_TIMEOUT,
        PgConnection::connect_with(&conn.connect_options()),
    )
    .await
    .map_err(|_| {
        StewardError::validation(format!(
            "failed to connect to database '{}' within {} seconds",
            conn.database,
            CONNECT_PROBE_TIMEOUT.as_secs()
        ))
    })?
    .map_err(|e| {
        StewardError::validation(format!(
            "failed to connect to database '{}': {e}",
            conn.database
        ))
    })?;

    let row = sqlx::query(
        "SELECT has_database_privilege(current_user, current_database(), 'CONNECT') AS can_connect,
                current_setting('server_version_num') AS version_num",
    )
    .fetch_one(&mut pg)
    .await?;

    let can_connect: bool = row.try_get("can_connect")?;
    let version_num: String = row.try_get("version_num")?;

    let _ = pg.close().await;

    if !can_connect {
        return Err(StewardError::validation(format!(
            "user does not have CONNECT privilege on database '{}'",
            conn.database
        )));
    }

    let server_major = version_num.parse::<u32>().unwrap_or(0) / 10_000;
    if server_major != conn.version.major() {
        return Err(StewardError::validation(format!(
            "server reports PostgreSQL {} but the database is registered as version {}",
            server_major, conn.version
        )));
    }

    Ok(())
}

#[derive(sqlx::FromRow)]
struct DatabaseRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    #[sqlx(rename = "type")]
    db_type: String,
    last_backup_time: Option<DateTime<Utc>>,
    last_backup_error: Option<String>,
    health_status: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
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
pub struct DatabaseRepository {
    pool: PgPool,
}

impl DatabaseRepository {
    pub fn new(pool: PgPool) -> Self {
        DatabaseRepository { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Database, StewardError> {
        let row: Option<DatabaseRow> = sqlx::query_as(
            "SELECT id, owner_id, name, type, last_backup_time, last_backup_error, health_status
             FROM databases WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(StewardError::NotFound {
            entity: "database",
            id,
        })?;
        self.hydrate(row).await
    }

    pub async fn find_all(&self) -> Result<Vec<Database>, StewardError> {
        let rows: Vec<DatabaseRow> = sqlx::query_as(
            "SELECT id, owner_id, name, type, last_backup_time, last_backup_error, health_status
             FROM databases ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut databases = Vec::with_capacity(rows.len());
        for row in rows {
            databases.push(self.hydrate(row).await?);
        }
        Ok(databases)
    }

    async fn hydrate(&self, row: DatabaseRow) -> Result<Database, StewardError> {
        let conn: ConnectionRow = sqlx::query_as(
            "SELECT host, port, username, password, database_name, require_ssl, version
             FROM postgres_connections WHERE database_id = $1",
        )
        .bind(row.id)
        .fetch_one(&self.pool)
        .await?;

        let notifier_ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT notifier_id FROM database_notifiers WHERE database_id = $1",
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?;

        let health_status = row
            .health_status
            .map(HealthStatus::try_from)
            .transpose()?;

        Ok(Database {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            db_type: DatabaseType::try_from(row.db_type)?,
            connection: PostgresConnection {
                host: conn.host,
                port: conn.port as u16,
                username: conn.username,
                password: conn.password,
                database: conn.database_name,
                require_ssl: conn.require_ssl,
                version: conn.version,
            },
            notifier_ids: notifier_ids.into_iter().map(|(id,)| id).collect(),
            last_backup_time: row.last_backup_time,
            last_backup_error: row.last_backup_error,
            health_status,
        })
    }

    /// Saves the database, its connection and its notifier links in one
    /// transaction.
    pub async fn save(&self, database: &Database) -> Result<(), StewardError> {
        database.validate()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO databases
               (id, owner_id, name, type, last_backup_time, last_backup_error, health_status)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE
             SET name = EXCLUDED.name,
                 last_backup_time = EXCLUDED.last_backup_time,
                 last_backup_error = EXCLUDED.last_backup_error,
                 health_status = EXCLUDED.health_status",
        )
        .bind(database.id)
        .bind(database.owner_id)
        .bind(&database.name)
        .bind(database.db_type.to_string())
        .bind(database.last_backup_time)
        .bind(&database.last_backup_error)
        .bind(database.health_status.map(|s| s.to_string()))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO postgres_connections
               (database_id, host, port, username, password, database_name,
                require_ssl, version)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (database_id) DO UPDATE
             SET host = EXCLUDED.host, port = EXCLUDED.port,
                 username = EXCLUDED.username, password = EXCLUDED.password,
                 database_name = EXCLUDED.database_name,
                 require_ssl = EXCLUDED.require_ssl, version = EXCLUDED.version",
        )
        .bind(database.id)
        .bind(&database.connection.host)
        .bind(database.connection.port as i32)
        .bind(&database.connection.username)
        .bind(&database.connection.password)
        .bind(&database.connection.database)
        .bind(database.connection.require_ssl)
        .bind(database.connection.version.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM database_notifiers WHERE database_id = $1")
            .bind(database.id)
            .execute(&mut *tx)
            .await?;
        for notifier_id in &database.notifier_ids {
            sqlx::query(
                "INSERT INTO database_notifiers (database_id, notifier_id) VALUES ($1, $2)",
            )
            .bind(database.id)
            .bind(notifier_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StewardError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM database_notifiers WHERE database_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM postgres_connections WHERE database_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM databases WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_backup_error(&self, id: Uuid, error: &str) -> Result<(), StewardError> {
        sqlx::query("UPDATE databases SET last_backup_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// A successful backup also clears any previous error.
    pub async fn set_last_backup_time(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StewardError> {
        sqlx::query(
            "UPDATE databases SET last_backup_time = $2, last_backup_error = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_health_status(
        &self,
        id: Uuid,
        status: HealthStatus,
    ) -> Result<(), StewardError> {
        sqlx::query("UPDATE databases SET health_status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Invoked before a database row is removed; registered by the backup and
/// healthcheck services at composition time so the modules stay acyclic.
pub type RemoveHook =
    Arc<dyn Fn(Uuid) -> BoxFuture<'static, Result<(), StewardError>> + Send + Sync>;

#[derive(Clone)]
pub struct DatabaseService {
    repository: DatabaseRepository,
    remove_hooks: Arc<Mutex<Vec<RemoveHook>>>,
}

impl DatabaseService {
    pub fn new(repository: DatabaseRepository) -> Self {
        DatabaseService {
            repository,
            remove_hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_remove_hook(&self, hook: RemoveHook) {
        self.remove_hooks
            .lock()
            .expect("remove hook registry poisoned")
            .push(hook);
    }

    pub async fn get_database_by_id(&self, id: Uuid) -> Result<Database, StewardError> {
        self.repository.find_by_id(id).await
    }

    pub async fn get_database_with_auth(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Database, StewardError> {
        let database = self.repository.find_by_id(id).await?;
        if database.owner_id != user_id {
            return Err(StewardError::AccessDenied);
        }
        Ok(database)
    }

    pub async fn get_all_databases(&self) -> Result<Vec<Database>, StewardError> {
        self.repository.find_all().await
    }

    pub async fn save_database(
        &self,
        user_id: Uuid,
        database: &Database,
    ) -> Result<(), StewardError> {
        if database.owner_id != user_id {
            return Err(StewardError::AccessDenied);
        }

        // Type is immutable once the row exists
        if let Ok(existing) = self.repository.find_by_id(database.id).await {
            if existing.db_type != database.db_type {
                return Err(StewardError::validation(
                    "database type is not allowed to change",
                ));
            }
        }

        self.repository.save(database).await
    }

    /// Runs every registered removal hook (backups refuse while one is in
    /// progress, then cascade artefacts and attempts), then the row itself.
    pub async fn delete_database(&self, user_id: Uuid, id: Uuid) -> Result<(), StewardError> {
        let database = self.get_database_with_auth(user_id, id).await?;

        let hooks: Vec<RemoveHook> = self
            .remove_hooks
            .lock()
            .expect("remove hook registry poisoned")
            .clone();
        for hook in hooks {
            hook(database.id).await?;
        }

        self.repository.delete(database.id).await?;
        info!("Deleted database {} ({})", database.name, database.id);
        Ok(())
    }

    pub async fn test_database_connection_direct(
        &self,
        database: &Database,
    ) -> Result<(), StewardError> {
        test_connection_direct(&database.connection).await
    }

    pub async fn set_backup_error(&self, id: Uuid, error: &str) -> Result<(), StewardError> {
        self.repository.set_backup_error(id, error).await
    }

    pub async fn set_last_backup_time(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StewardError> {
        self.repository.set_last_backup_time(id, at).await
    }

    pub async fn set_health_status(
        &self,
        id: Uuid,
        status: HealthStatus,
    ) -> Result<(), StewardError> {
        self.repository.set_health_status(id, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> PostgresConnection {
        PostgresConnection {
            host: "db.internal".to_string(),
            port: 5432,
            username: "app".to_string(),
            password: "pw".to_string(),
            database: "app_prod".to_string(),
            require_ssl: false,
            version: PostgresVersion::V16,
        }
    }

    #[test]
    fn connection_validation_requires_every_field() {
        assert!(connection().validate().is_ok());

        let mut c = connection();
        c.host.clear();
        assert!(c.validate().is_err());

        let mut c = connection();
        c.database.clear();
        assert!(c.validate().is_err());

        let mut c = connection();
        c.port = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn database_requires_name() {
        let database = Database {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: String::new(),
            db_type: DatabaseType::Postgres,
            connection: connection(),
            notifier_ids: vec![],
            last_backup_time: None,
            last_backup_error: None,
            health_status: None,
        };
        assert!(database.validate().is_err());
    }

    #[test]
    fn enums_round_trip_through_text() {
        assert_eq!(
            DatabaseType::try_from("POSTGRES".to_string()).unwrap(),
            DatabaseType::Postgres
        );
        assert!(DatabaseType::try_from("MYSQL".to_string()).is_err());

        for status in [HealthStatus::Available, HealthStatus::Unavailable] {
            assert_eq!(HealthStatus::try_from(status.to_string()).unwrap(), status);
        }
    }
}
