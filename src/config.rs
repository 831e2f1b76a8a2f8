use std::env;
use std::path::PathBuf;

use log::error;

/// Runtime environment, mirrors the ENV_MODE variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvMode {
    Development,
    Production,
}

impl EnvMode {
    fn parse(raw: &str) -> Option<EnvMode> {
        match raw {
            "development" => Some(EnvMode::Development),
            "production" => Some(EnvMode::Production),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_dsn: String,
    pub env_mode: EnvMode,
    /// Root holding postgresql-{13..17}/bin in development mode
    pub postgres_install_dir: PathBuf,
    /// Final resting place of LOCAL storage artefacts
    pub data_dir: PathBuf,
    /// Scratch space shared by all pipelines; every task makes its own subdir
    pub temp_dir: PathBuf,
    /// Root under which CIFS shares are mounted for NAS storages
    pub nas_mount_dir: PathBuf,
    pub server_port: u16,
}

impl Config {
    /// Reads the process environment once. Missing required variables are
    /// a startup failure, not something to limp along without.
    pub fn from_env() -> anyhow::Result<Config> {
        let database_dsn =
            env::var("DATABASE_DSN").map_err(|_| anyhow::anyhow!("DATABASE_DSN must be set"))?;

        let raw_mode = env::var("ENV_MODE").map_err(|_| anyhow::anyhow!("ENV_MODE must be set"))?;
        let env_mode = EnvMode::parse(&raw_mode)
            .ok_or_else(|| anyhow::anyhow!("ENV_MODE must be 'development' or 'production'"))?;

        let server_port = match from_env_default("PORT", "8080").parse::<u16>() {
            Ok(n) => n,
            Err(e) => {
                error!("Environment variable PORT must convert into u16: {}", e);
                8080
            }
        };

        Ok(Config {
            database_dsn,
            env_mode,
            postgres_install_dir: PathBuf::from(from_env_default(
                "POSTGRES_INSTALL_DIR",
                "./tools/postgresql",
            )),
            data_dir: PathBuf::from(from_env_default("STEWARD_DATA_DIR", "./steward_backups")),
            temp_dir: PathBuf::from(from_env_default("STEWARD_TEMP_DIR", "./steward_temp")),
            nas_mount_dir: PathBuf::from(from_env_default("NAS_MOUNT_DIR", "/mnt/steward-nas")),
            server_port,
        })
    }

    /// Data and temp directories must exist before any pipeline runs.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        create_dir_0755(&self.data_dir)?;
        create_dir_0755(&self.temp_dir)?;
        Ok(())
    }
}

fn create_dir_0755(path: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// source a variable from environment - use default if not exists
fn from_env_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_mode_parses_known_values_only() {
        assert_eq!(EnvMode::parse("development"), Some(EnvMode::Development));
        assert_eq!(EnvMode::parse("production"), Some(EnvMode::Production));
        assert_eq!(EnvMode::parse("staging"), None);
        assert_eq!(EnvMode::parse(""), None);
    }

    #[test]
    fn ensure_directories_precreates_both_dirs() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            database_dsn: "postgres://localhost".to_string(),
            env_mode: EnvMode::Development,
            postgres_install_dir: root.path().join("pg"),
            data_dir: root.path().join("data"),
            temp_dir: root.path().join("temp"),
            nas_mount_dir: root.path().join("nas"),
            server_port: 8080,
        };

        config.ensure_directories().unwrap();
        assert!(config.data_dir.is_dir());
        assert!(config.temp_dir.is_dir());
    }
}
