use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite database behind the preference store.
#[derive(Clone)]
pub struct Db {
  pool: SqlitePool,
  path: Option<PathBuf>
}

impl Db {
  pub async fn connect(path: &Path) -> anyhow::Result<Self> {
    let opts = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new().max_connections(4).connect_with(opts).await?;
    tracing::debug!(event = "db_connected", path = %path.display(), "database opened");
    Ok(Self { pool, path: Some(path.to_path_buf()) })
  }

  /// Private in-memory database. A single connection keeps every query on the same memory file.
  pub async fn in_memory() -> anyhow::Result<Self> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(opts).await?;
    Ok(Self { pool, path: None })
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  pub async fn migrate(&self) -> anyhow::Result<()> {
    MIGRATOR.run(&self.pool).await?;
    Ok(())
  }

  pub async fn close(&self) {
    self.pool.close().await;
  }
}
