//! Version-specific PostgreSQL client tooling: binary resolution, startup
//! verification and pgpass credential files.

use std::fmt;
use std::path::{Path, PathBuf};

use log::{error, info};
use uuid::Uuid;

use crate::config::EnvMode;
use crate::errors::StewardError;

/// Supported PostgreSQL server major versions. The dump produced by a
/// version's pg_dump must be read back by the same version's pg_restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PostgresVersion {
    V13,
    V14,
    V15,
    V16,
    V17,
}

pub const ALL_VERSIONS: [PostgresVersion; 5] = [
    PostgresVersion::V13,
    PostgresVersion::V14,
    PostgresVersion::V15,
    PostgresVersion::V16,
    PostgresVersion::V17,
];

impl PostgresVersion {
    pub fn major(&self) -> u32 {
        match self {
            PostgresVersion::V13 => 13,
            PostgresVersion::V14 => 14,
            PostgresVersion::V15 => 15,
            PostgresVersion::V16 => 16,
            PostgresVersion::V17 => 17,
        }
    }

    pub fn from_major(major: u32) -> Option<PostgresVersion> {
        ALL_VERSIONS.iter().copied().find(|v| v.major() == major)
    }
}

impl fmt::Display for PostgresVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major())
    }
}

impl TryFrom<String> for PostgresVersion {
    type Error = StewardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse::<u32>()
            .ok()
            .and_then(PostgresVersion::from_major)
            .ok_or_else(|| {
                StewardError::validation(format!("unsupported PostgreSQL version: {value}"))
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgExecutable {
    PgDump,
    PgRestore,
    Psql,
}

impl PgExecutable {
    pub fn name(&self) -> &'static str {
        match self {
            PgExecutable::PgDump => "pg_dump",
            PgExecutable::PgRestore => "pg_restore",
            PgExecutable::Psql => "psql",
        }
    }
}

/// Full path to a specific PostgreSQL executable for the given version.
/// Development: `<install-root>/postgresql-V/bin/<exe>`; production:
/// `/usr/pgsql-V/bin/<exe>`. Windows gets the `.exe` suffix.
pub fn executable_path(
    version: PostgresVersion,
    executable: PgExecutable,
    env_mode: EnvMode,
    install_dir: &Path,
) -> PathBuf {
    let mut name = executable.name().to_string();
    if cfg!(windows) {
        name.push_str(".exe");
    }
    bin_dir(version, env_mode, install_dir).join(name)
}

fn bin_dir(version: PostgresVersion, env_mode: EnvMode, install_dir: &Path) -> PathBuf {
    match env_mode {
        EnvMode::Development => install_dir
            .join(format!("postgresql-{}", version.major()))
            .join("bin"),
        EnvMode::Production => PathBuf::from(format!("/usr/pgsql-{}/bin", version.major())),
    }
}

/// Verifies that client tools for every supported version are installed.
/// Missing tools are fatal: the scheduler would otherwise fail every
/// backup of that version at dispatch time.
pub fn verify_installations(env_mode: EnvMode, install_dir: &Path) -> anyhow::Result<()> {
    let required = [PgExecutable::PgDump, PgExecutable::Psql];

    for version in ALL_VERSIONS {
        let dir = bin_dir(version, env_mode, install_dir);
        if !dir.is_dir() {
            error!(
                "PostgreSQL {} bin directory not found at {}; install the client tools",
                version,
                dir.display()
            );
            anyhow::bail!("PostgreSQL {} client tools are not installed", version);
        }

        for executable in required {
            let path = executable_path(version, executable, env_mode, install_dir);
            if !path.is_file() {
                error!(
                    "PostgreSQL command {} not found at {}",
                    executable.name(),
                    path.display()
                );
                anyhow::bail!(
                    "PostgreSQL {} is missing the {} executable",
                    version,
                    executable.name()
                );
            }
        }

        info!("PostgreSQL {} client tools verified", version);
    }

    Ok(())
}

/// A pgpass credential file in its own freshly-created temp directory,
/// removed when the guard is dropped. Format: `host:port:*:user:password`,
/// mode 0600, referenced by the PGPASSFILE environment variable.
pub struct PgPassFile {
    dir: PathBuf,
    path: PathBuf,
}

impl PgPassFile {
    pub fn create(host: &str, port: u16, username: &str, password: &str) -> std::io::Result<Self> {
        let dir = std::env::temp_dir().join(format!("pgpass-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(".pgpass");
        let line = format!("{host}:{port}:*:{username}:{password}\n");
        std::fs::write(&path, line)?;

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, Permissions::from_mode(0o600))?;
        }

        Ok(PgPassFile { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PgPassFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_development_and_production_layout() {
        let install = Path::new("/opt/steward/tools/postgresql");

        let dev = executable_path(
            PostgresVersion::V16,
            PgExecutable::PgDump,
            EnvMode::Development,
            install,
        );
        assert_eq!(
            dev,
            PathBuf::from("/opt/steward/tools/postgresql/postgresql-16/bin/pg_dump")
        );

        let prod = executable_path(
            PostgresVersion::V13,
            PgExecutable::Psql,
            EnvMode::Production,
            install,
        );
        assert_eq!(prod, PathBuf::from("/usr/pgsql-13/bin/psql"));
    }

    #[test]
    fn version_round_trips_through_text() {
        for version in ALL_VERSIONS {
            let parsed = PostgresVersion::try_from(version.major().to_string()).unwrap();
            assert_eq!(parsed, version);
        }
        assert!(PostgresVersion::try_from("12".to_string()).is_err());
        assert!(PostgresVersion::try_from("latest".to_string()).is_err());
    }

    #[test]
    fn pgpass_file_has_expected_line_and_disappears_on_drop() {
        let guard = PgPassFile::create("db.internal", 5433, "steward", "s3cr3t").unwrap();
        let path = guard.path().to_path_buf();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "db.internal:5433:*:steward:s3cr3t\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(guard);
        assert!(!path.exists());
    }
}
