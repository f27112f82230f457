// PostgreSQL client programs: pg_dump, pg_restore and psql

use super::{run_command, DumpTool, RestoreTool};
use crate::ledger::ArtifactFormat;
use crate::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

/// Connection to the database being backed up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceDatabase {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Directory the server archives completed WAL segments into
    pub wal_directory: PathBuf,
}

impl Default for SourceDatabase {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            wal_directory: PathBuf::from("/var/lib/postgresql/wal_archive"),
        }
    }
}

/// Server that base artifacts are restored into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for RestoreTarget {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5433,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres_restore".to_string(),
        }
    }
}

fn client_command(program: &str, host: &str, port: u16, user: &str, database: &str, password: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-h")
        .arg(host)
        .arg("-p")
        .arg(port.to_string())
        .arg("-U")
        .arg(user)
        .arg("-d")
        .arg(database)
        .env("PGPASSWORD", password);
    cmd
}

/// `pg_dump` against a [`SourceDatabase`]
#[derive(Debug, Clone)]
pub struct PgDumpTool {
    source: SourceDatabase,
    format: ArtifactFormat,
}

impl PgDumpTool {
    /// Custom-archive dumps of `source`
    pub fn new(source: SourceDatabase) -> Self {
        Self {
            source,
            format: ArtifactFormat::CustomArchive,
        }
    }

    /// Switch to plain SQL output
    pub fn plain_sql(mut self) -> Self {
        self.format = ArtifactFormat::PlainSql;
        self
    }

    fn command(&self, program: &str) -> Command {
        let s = &self.source;
        client_command(program, &s.host, s.port, &s.user, &s.database, &s.password)
    }

    /// Arguments passed to `pg_dump` after the connection flags
    pub fn dump_args(&self, output: &Path) -> Vec<String> {
        let format = match self.format {
            ArtifactFormat::PlainSql => "--format=plain",
            _ => "--format=custom",
        };
        vec![
            "-f".to_string(),
            output.display().to_string(),
            "--no-password".to_string(),
            format.to_string(),
        ]
    }
}

#[async_trait]
impl DumpTool for PgDumpTool {
    fn format(&self) -> ArtifactFormat {
        self.format
    }

    async fn dump(&self, output: &Path) -> Result<()> {
        info!(
            host = %self.source.host,
            database = %self.source.database,
            output = %output.display(),
            "Running pg_dump"
        );
        let mut cmd = self.command("pg_dump");
        cmd.args(self.dump_args(output));
        run_command("pg_dump", cmd).await.map(|_| ())
    }

    async fn server_version(&self) -> Result<String> {
        let mut cmd = self.command("psql");
        cmd.args(["--no-password", "-t", "-c", "SELECT version();"]);
        let output = run_command("psql", cmd).await?;
        Ok(output.stdout.trim().to_string())
    }
}

/// `pg_restore` / `psql` against a [`RestoreTarget`]; WAL segments are staged on disk
#[derive(Debug, Clone, Default)]
pub struct PgRestoreTool {
    target: RestoreTarget,
}

impl PgRestoreTool {
    pub fn new(target: RestoreTarget) -> Self {
        Self { target }
    }

    /// Program and arguments for applying an artifact of `format`
    pub fn apply_args(&self, artifact: &Path, format: ArtifactFormat) -> Result<(&'static str, Vec<String>)> {
        let path = artifact.display().to_string();
        match format {
            ArtifactFormat::CustomArchive => Ok((
                "pg_restore",
                vec![
                    "--clean".to_string(),
                    "--if-exists".to_string(),
                    "--no-password".to_string(),
                    path,
                ],
            )),
            ArtifactFormat::PlainSql => Ok((
                "psql",
                vec![
                    "--no-password".to_string(),
                    "-v".to_string(),
                    "ON_ERROR_STOP=1".to_string(),
                    "-f".to_string(),
                    path,
                ],
            )),
            ArtifactFormat::WalArchive => Err(BackupError::ToolInvocationFailed {
                tool: "restore".to_string(),
                reason: "a WAL batch manifest is not a base artifact".to_string(),
            }),
        }
    }
}

#[async_trait]
impl RestoreTool for PgRestoreTool {
    // The logical restore lands in the target server; the destination only carries
    // the recovery files written afterwards
    async fn apply_base(&self, artifact: &Path, format: ArtifactFormat, destination: &Path) -> Result<()> {
        let (program, args) = self.apply_args(artifact, format)?;
        let t = &self.target;
        info!(
            program,
            host = %t.host,
            database = %t.database,
            artifact = %artifact.display(),
            destination = %destination.display(),
            "Applying base artifact"
        );

        let mut cmd = client_command(program, &t.host, t.port, &t.user, &t.database, &t.password);
        cmd.args(args);
        run_command(program, cmd).await.map(|_| ())
    }
}
