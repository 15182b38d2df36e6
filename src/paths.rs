use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct Paths {
  pub base_dir: PathBuf,
  pub data_dir: PathBuf,
  pub cache_dir: PathBuf,
  pub logs_dir: PathBuf
}

impl Paths {
  /// `CORNER_BASE_DIR` when set, otherwise the directory of the executable.
  pub fn detect() -> anyhow::Result<Self> {
    if let Ok(p) = std::env::var("CORNER_BASE_DIR") {
      if !p.trim().is_empty() {
        return Ok(Self::from_base(PathBuf::from(p)));
      }
    }
    let exe = std::env::current_exe()?;
    let base_dir = exe.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    Ok(Self::from_base(base_dir))
  }

  pub fn from_base(base_dir: PathBuf) -> Self {
    let data_dir = base_dir.join("data");
    let cache_dir = base_dir.join("cache");
    let logs_dir = base_dir.join("logs");
    Self { base_dir, data_dir, cache_dir, logs_dir }
  }

  pub fn ensure_dirs(&self) -> anyhow::Result<()> {
    for dir in [&self.data_dir, &self.cache_dir, &self.logs_dir, &self.tdlib_db_dir(), &self.tdlib_files_dir()] {
      std::fs::create_dir_all(dir)?;
    }
    Ok(())
  }

  pub fn sqlite_path(&self) -> PathBuf {
    self.data_dir.join("corner.sqlite")
  }

  pub fn tdlib_db_dir(&self) -> PathBuf {
    self.data_dir.join("tdlib")
  }

  /// Where TDLib stores downloaded media.
  pub fn tdlib_files_dir(&self) -> PathBuf {
    self.cache_dir.join("tdlib_files")
  }
}
