use std::sync::Arc;

use crate::app::feed::FeedClient;
use crate::app::prefs::{PreferenceStore, SqlitePrefs};
use crate::db::Db;
use crate::media::DownloadCoordinator;
use crate::paths::Paths;
use crate::settings::Settings;
use crate::telegram::{make_remote_service, RemoteContentService};

/// Everything a running client shares: storage, the remote service and the download coordinator.
#[derive(Clone)]
pub struct AppState {
  paths: Paths,
  settings: Settings,
  db: Db,
  prefs: Arc<dyn PreferenceStore>,
  telegram: Arc<dyn RemoteContentService>,
  downloads: Arc<DownloadCoordinator>
}

impl AppState {
  pub async fn init(paths: Paths, mut settings: Settings) -> anyhow::Result<Self> {
    paths.ensure_dirs()?;
    tracing::info!(event = "init_paths", base_dir = %paths.base_dir.display(), "paths ready");

    let db = Db::connect(&paths.sqlite_path()).await?;
    db.migrate().await?;
    tracing::info!(event = "init_db", db_path = %paths.sqlite_path().display(), "database ready");

    let prefs: Arc<dyn PreferenceStore> = Arc::new(SqlitePrefs::new(db.pool().clone()));
    settings.apply_stored_overrides(prefs.as_ref()).await?;

    let telegram = make_remote_service(&paths, &settings)?;
    tracing::info!(event = "init_telegram_service", "remote content service ready");

    let downloads = Arc::new(DownloadCoordinator::new(telegram.clone(), settings.download_policy()));
    Ok(Self { paths, settings, db, prefs, telegram, downloads })
  }

  pub fn paths(&self) -> &Paths {
    &self.paths
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn prefs(&self) -> &dyn PreferenceStore {
    self.prefs.as_ref()
  }

  pub fn telegram(&self) -> Arc<dyn RemoteContentService> {
    self.telegram.clone()
  }

  pub fn downloads(&self) -> Arc<DownloadCoordinator> {
    self.downloads.clone()
  }

  pub fn feed_client(&self) -> FeedClient {
    FeedClient::new(self.settings.backend_url.clone())
  }

  pub async fn shutdown(&self) {
    self.db.close().await;
  }
}
