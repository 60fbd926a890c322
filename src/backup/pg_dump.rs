use super::schedule::SnapshotSchedule;
use super::{ScheduledBackup, SnapshotWriter};
use crate::core::{MigrationError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tokio_postgres::config::Host;

pub const DEFAULT_PG_DUMP_TIMEOUT: Duration = Duration::from_secs(3600);

pub type PgDumpBackup = ScheduledBackup<PgDumpWriter>;

impl PgDumpBackup {
    pub fn pg_dump(writer: PgDumpWriter, dir: impl Into<PathBuf>, prefix: &str, schedule: SnapshotSchedule) -> Self {
        ScheduledBackup::new(writer, dir, prefix, schedule)
    }
}

/// Connection parameters handed to `pg_dump`.
#[derive(Clone, PartialEq, Eq)]
pub struct PgDumpTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
}

impl std::fmt::Debug for PgDumpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDumpTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("dbname", &self.dbname)
            .finish()
    }
}

impl PgDumpTarget {
    /// Accepts both URL (`postgres://…`) and key/value connection strings.
    pub fn from_url(database_url: &str) -> Result<Self> {
        let config = tokio_postgres::Config::from_str(database_url)
            .map_err(|e| MigrationError::Config(format!("invalid database url: {}", e)))?;

        let host = match config.get_hosts().first() {
            Some(Host::Tcp(host)) => host.clone(),
            #[cfg(unix)]
            Some(Host::Unix(path)) => path.display().to_string(),
            None => "localhost".to_string(),
        };
        let user = config
            .get_user()
            .ok_or_else(|| MigrationError::Config("database url has no user".into()))?
            .to_string();
        let dbname = config.get_dbname().unwrap_or(user.as_str()).to_string();
        let password = config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).into_owned());

        Ok(Self {
            host,
            port: config.get_ports().first().copied().unwrap_or(5432),
            user,
            password,
            dbname,
        })
    }
}

/// Runs `pg_dump -F c` against one database.
#[derive(Debug, Clone)]
pub struct PgDumpWriter {
    program: PathBuf,
    target: PgDumpTarget,
    timeout: Duration,
}

impl PgDumpWriter {
    pub fn new(target: PgDumpTarget) -> Self {
        Self {
            program: PathBuf::from("pg_dump"),
            target,
            timeout: DEFAULT_PG_DUMP_TIMEOUT,
        }
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-h")
            .arg(&self.target.host)
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg("-U")
            .arg(&self.target.user)
            .arg("-d")
            .arg(&self.target.dbname)
            .arg("-F")
            .arg("c")
            .arg("-f")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &self.target.password {
            cmd.env("PGPASSWORD", password);
        }
        cmd
    }
}

#[async_trait]
impl SnapshotWriter for PgDumpWriter {
    fn extension(&self) -> &'static str {
        "sql"
    }

    async fn write(&self, path: &Path) -> Result<()> {
        let child = self.command(path).spawn().map_err(|e| {
            MigrationError::Backup(format!("cannot start {}: {}", self.program.display(), e))
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| MigrationError::Backup(format!("pg_dump timed out after {:?}", self.timeout)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MigrationError::Backup(format!(
                "pg_dump exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
