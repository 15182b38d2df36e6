use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::app::prefs::{PreferenceStore, KEY_TDLIB_PATH};
use crate::media::DownloadPolicy;

pub const DEFAULT_BACKEND_URL: &str = "https://cornerlive.ir:9000";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TgSettings {
  pub api_id: i32,
  pub api_hash: String
}

#[derive(Clone, Debug)]
pub struct Settings {
  pub tg: Option<TgSettings>,
  pub tdlib_path: Option<PathBuf>,
  pub backend_url: String,
  pub download_timeout: Duration,
  pub download_attempts: u32,
  pub download_backoff: Duration,
  pub mock_fixtures: Option<PathBuf>
}

impl Default for Settings {
  fn default() -> Self {
    let policy = DownloadPolicy::default();
    Self {
      tg: None,
      tdlib_path: None,
      backend_url: DEFAULT_BACKEND_URL.to_string(),
      download_timeout: policy.timeout,
      download_attempts: policy.max_attempts,
      download_backoff: policy.backoff,
      mock_fixtures: None
    }
  }
}

impl Settings {
  /// Reads `CORNER_*` variables. Call after `dotenvy::dotenv()` so `.env` values are visible.
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let parse = |key: &str| -> Option<u64> {
      let raw = get(key)?;
      match u64::from_str(&raw) {
        Ok(v) => Some(v),
        Err(_) => {
          tracing::warn!(event = "settings_invalid_value", key = key, value = %raw, "ignoring non-numeric setting");
          None
        }
      }
    };

    let api_id = get("CORNER_API_ID")
      .or_else(|| option_env!("CORNER_API_ID").map(str::to_string))
      .and_then(|v| v.parse::<i32>().ok())
      .filter(|id| *id > 0);
    let api_hash = get("CORNER_API_HASH").or_else(|| option_env!("CORNER_API_HASH").map(str::to_string));
    let tg = match (api_id, api_hash) {
      (Some(api_id), Some(api_hash)) => Some(TgSettings { api_id, api_hash }),
      _ => None
    };

    let defaults = Self::default();
    Self {
      tg,
      tdlib_path: get("CORNER_TDLIB_PATH").map(PathBuf::from),
      backend_url: get("CORNER_BACKEND_URL").unwrap_or(defaults.backend_url),
      download_timeout: parse("CORNER_DOWNLOAD_TIMEOUT_SECS")
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
        .unwrap_or(defaults.download_timeout),
      download_attempts: parse("CORNER_DOWNLOAD_ATTEMPTS")
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .unwrap_or(defaults.download_attempts),
      download_backoff: parse("CORNER_DOWNLOAD_BACKOFF_MS").map(Duration::from_millis).unwrap_or(defaults.download_backoff),
      mock_fixtures: get("CORNER_MOCK_FIXTURES").map(PathBuf::from)
    }
  }

  pub fn download_policy(&self) -> DownloadPolicy {
    DownloadPolicy { timeout: self.download_timeout, max_attempts: self.download_attempts, backoff: self.download_backoff }
  }

  /// A TDLib path saved in the preference store wins over the environment.
  pub async fn apply_stored_overrides(&mut self, store: &dyn PreferenceStore) -> anyhow::Result<()> {
    if let Some(p) = store.get_item(KEY_TDLIB_PATH).await? {
      if !p.trim().is_empty() {
        self.tdlib_path = Some(PathBuf::from(p.trim()));
      }
    }
    Ok(())
  }
}

/// Saves or clears the TDLib path override.
pub async fn set_tdlib_path(store: &dyn PreferenceStore, path: Option<&str>) -> anyhow::Result<()> {
  match path.map(str::trim) {
    Some(p) if !p.is_empty() => store.set_item(KEY_TDLIB_PATH, p).await,
    _ => store.remove_item(KEY_TDLIB_PATH).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  use crate::app::prefs::MemoryPrefs;

  fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key| map.get(key).cloned()
  }

  #[test]
  fn reads_download_policy_and_credentials() {
    let s = Settings::from_lookup(lookup(&[
      ("CORNER_API_ID", "12345"),
      ("CORNER_API_HASH", "abc"),
      ("CORNER_DOWNLOAD_TIMEOUT_SECS", "5"),
      ("CORNER_DOWNLOAD_ATTEMPTS", "2"),
      ("CORNER_DOWNLOAD_BACKOFF_MS", "nope")
    ]));
    assert_eq!(s.tg, Some(TgSettings { api_id: 12345, api_hash: "abc".into() }));
    let policy = s.download_policy();
    assert_eq!(policy.timeout, Duration::from_secs(5));
    assert_eq!(policy.max_attempts, 2);
    assert_eq!(policy.backoff, DownloadPolicy::default().backoff);
    assert_eq!(s.backend_url, DEFAULT_BACKEND_URL);
  }

  #[tokio::test]
  async fn stored_tdlib_path_overrides_env() -> anyhow::Result<()> {
    let store = MemoryPrefs::new();
    let mut s = Settings::from_lookup(lookup(&[("CORNER_TDLIB_PATH", "/env/libtdjson.so")]));
    set_tdlib_path(&store, Some(" /stored/libtdjson.so ")).await?;
    s.apply_stored_overrides(&store).await?;
    assert_eq!(s.tdlib_path, Some(PathBuf::from("/stored/libtdjson.so")));
    Ok(())
  }
}
