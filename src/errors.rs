use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StewardError {
    #[error("database error {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("json parsing error {0}")]
    JsonParsingError(#[from] serde_json::Error),

    #[error("io error {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storages::StorageError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("access denied")]
    AccessDenied,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("backup is in progress")]
    BackupInProgress,

    #[error("backup cancelled due to shutdown")]
    BackupCancelled,

    #[error("restore cancelled due to shutdown")]
    RestoreCancelled,

    #[error("{0}")]
    PgTool(String),

    #[error("notifier send failed: {0}")]
    NotifierSend(String),
}

impl StewardError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StewardError::Validation(msg.into())
    }
}
