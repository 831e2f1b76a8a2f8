use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect to the metadata database.
pub async fn connect(dsn: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(dsn)
        .await
}
