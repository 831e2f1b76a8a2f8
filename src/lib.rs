/// Expose all components used by the steward binary
pub mod backups;
pub mod config;
pub mod databases;
pub mod db;
pub mod errors;
pub mod healthcheck;
pub mod heartbeat;
pub mod notifiers;
pub mod pgexec;
pub mod pgtools;
pub mod restores;
pub mod routes;
pub mod shutdown;
pub mod storages;

pub use crate::errors::StewardError;
pub type Result<T, E = StewardError> = std::result::Result<T, E>;
