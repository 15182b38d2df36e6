use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

pub const KEY_AUTH_STATUS: &str = "auth-status";
pub const KEY_PHONE_NUMBER: &str = "phone-number";
pub const KEY_TEAMS: &str = "teams";
pub const KEY_BACKEND_USER: &str = "userId-corner";
pub const KEY_TDLIB_PATH: &str = "tdlib_path";

/// Opaque string key/value storage.
#[async_trait::async_trait]
pub trait PreferenceStore: Send + Sync {
  async fn get_item(&self, key: &str) -> anyhow::Result<Option<String>>;
  async fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()>;
  async fn remove_item(&self, key: &str) -> anyhow::Result<()>;
}

pub struct SqlitePrefs {
  pool: SqlitePool
}

impl SqlitePrefs {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }
}

#[async_trait::async_trait]
impl PreferenceStore for SqlitePrefs {
  async fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
    let row = sqlx::query("SELECT value FROM preferences WHERE key = ?")
      .bind(key)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(|r| r.get::<String, _>("value")))
  }

  async fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
    sqlx::query(
      "INSERT INTO preferences(key, value, updated_at) VALUES(?, ?, ?) \
       ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at"
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().timestamp())
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn remove_item(&self, key: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM preferences WHERE key = ?").bind(key).execute(&self.pool).await?;
    Ok(())
  }
}

#[derive(Default)]
pub struct MemoryPrefs {
  items: Mutex<HashMap<String, String>>
}

impl MemoryPrefs {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait::async_trait]
impl PreferenceStore for MemoryPrefs {
  async fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
    Ok(self.items.lock().get(key).cloned())
  }

  async fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
    self.items.lock().insert(key.to_string(), value.to_string());
    Ok(())
  }

  async fn remove_item(&self, key: &str) -> anyhow::Result<()> {
    self.items.lock().remove(key);
    Ok(())
  }
}

/// Reads a JSON value. A stored value that no longer parses is treated as absent.
pub async fn get_json<T: DeserializeOwned>(store: &dyn PreferenceStore, key: &str) -> anyhow::Result<Option<T>> {
  let Some(text) = store.get_item(key).await? else {
    return Ok(None);
  };
  match serde_json::from_str(&text) {
    Ok(v) => Ok(Some(v)),
    Err(e) => {
      tracing::warn!(event = "prefs_value_corrupt", key = key, error = %e, "stored value is not valid JSON");
      Ok(None)
    }
  }
}

pub async fn set_json<T: Serialize + Sync>(store: &dyn PreferenceStore, key: &str, value: &T) -> anyhow::Result<()> {
  let text = serde_json::to_string(value)?;
  store.set_item(key, &text).await
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumber {
  pub phone_number: String
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendUser {
  pub uuid: String
}

/// Selected teams in rank order. Blank names and duplicates are dropped.
pub async fn save_teams(store: &dyn PreferenceStore, teams: &[String]) -> anyhow::Result<Vec<String>> {
  let mut kept: Vec<String> = Vec::new();
  for team in teams.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
    if !kept.iter().any(|k| k == team) {
      kept.push(team.to_string());
    }
  }
  set_json(store, KEY_TEAMS, &kept).await?;
  tracing::info!(event = "prefs_teams_saved", count = kept.len(), "teams saved");
  Ok(kept)
}

pub async fn load_teams(store: &dyn PreferenceStore) -> anyhow::Result<Vec<String>> {
  Ok(get_json::<Vec<String>>(store, KEY_TEAMS).await?.unwrap_or_default())
}

pub async fn save_phone(store: &dyn PreferenceStore, phone: &str) -> anyhow::Result<()> {
  set_json(store, KEY_PHONE_NUMBER, &PhoneNumber { phone_number: phone.to_string() }).await
}

pub async fn load_phone(store: &dyn PreferenceStore) -> anyhow::Result<Option<String>> {
  Ok(get_json::<PhoneNumber>(store, KEY_PHONE_NUMBER).await?.map(|p| p.phone_number))
}

pub async fn backend_user(store: &dyn PreferenceStore) -> anyhow::Result<Option<String>> {
  Ok(get_json::<BackendUser>(store, KEY_BACKEND_USER).await?.map(|u| u.uuid))
}

pub async fn set_backend_user(store: &dyn PreferenceStore, uuid: &str) -> anyhow::Result<()> {
  set_json(store, KEY_BACKEND_USER, &BackendUser { uuid: uuid.to_string() }).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn teams_keep_order_and_drop_duplicates() -> anyhow::Result<()> {
    let store = MemoryPrefs::new();
    let saved = save_teams(&store, &["Esteghlal".into(), " ".into(), "Sepahan".into(), "Esteghlal".into()]).await?;
    assert_eq!(saved, vec!["Esteghlal".to_string(), "Sepahan".to_string()]);
    assert_eq!(load_teams(&store).await?, saved);
    assert_eq!(store.get_item(KEY_TEAMS).await?.as_deref(), Some(r#"["Esteghlal","Sepahan"]"#));
    Ok(())
  }

  #[tokio::test]
  async fn phone_and_user_shapes() -> anyhow::Result<()> {
    let store = MemoryPrefs::new();
    save_phone(&store, "+989121234567").await?;
    assert_eq!(store.get_item(KEY_PHONE_NUMBER).await?.as_deref(), Some(r#"{"phoneNumber":"+989121234567"}"#));
    assert_eq!(load_phone(&store).await?.as_deref(), Some("+989121234567"));

    set_backend_user(&store, "u-1").await?;
    assert_eq!(backend_user(&store).await?.as_deref(), Some("u-1"));
    Ok(())
  }

  #[tokio::test]
  async fn corrupt_value_reads_as_absent() -> anyhow::Result<()> {
    let store = MemoryPrefs::new();
    store.set_item(KEY_TEAMS, "not json").await?;
    assert!(load_teams(&store).await?.is_empty());
    store.remove_item(KEY_TEAMS).await?;
    assert_eq!(store.get_item(KEY_TEAMS).await?, None);
    Ok(())
  }

  #[tokio::test]
  async fn sqlite_store_upserts() -> anyhow::Result<()> {
    let db = crate::db::Db::in_memory().await?;
    db.migrate().await?;
    let store = SqlitePrefs::new(db.pool().clone());
    store.set_item("k", "1").await?;
    store.set_item("k", "2").await?;
    assert_eq!(store.get_item("k").await?.as_deref(), Some("2"));
    store.remove_item("k").await?;
    assert_eq!(store.get_item("k").await?, None);
    Ok(())
  }
}
