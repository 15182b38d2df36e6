use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::app::models::MessageRecord;
use crate::app::normalize::normalize_raw;
use crate::app::prefs::{backend_user, set_backend_user, PreferenceStore};
use crate::telegram::payload::{self, as_i64_loose, first_present};
use crate::telegram::{ChatId, MessageId, RemoteContentService};

/// Entries beyond this are left for a later page.
pub const FEED_BATCH: usize = 30;
const FETCH_CONCURRENCY: usize = 4;

/// One feed item as the backend lists it. Ids arrive as numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
  pub chat_id: Option<ChatId>,
  pub message_id: MessageId,
  pub channel: Option<String>
}

impl FeedEntry {
  pub fn from_value(v: &Value) -> Option<Self> {
    let message_id = first_present(v, &["messageId", "message_id", "id"]).and_then(as_i64_loose)?;
    let chat_id = first_present(v, &["chatId", "chat_id"]).and_then(as_i64_loose).filter(|id| *id != 0);
    let channel = first_present(v, &["channel", "username"])
      .and_then(|c| c.as_str())
      .map(|c| c.trim().trim_start_matches('@').to_string())
      .filter(|c| !c.is_empty());
    if chat_id.is_none() && channel.is_none() {
      return None;
    }
    Some(Self { chat_id, message_id, channel })
  }
}

/// Backend answers are either a bare array or an object holding one under `data`/`messages`.
pub fn parse_feed(v: &Value) -> Vec<FeedEntry> {
  let items = match v {
    Value::Array(items) => Some(items),
    other => first_present(other, &["data", "messages", "items"]).and_then(|d| d.as_array())
  };
  items.map(|items| items.iter().filter_map(FeedEntry::from_value).collect()).unwrap_or_default()
}

/// Blocking HTTP client for the feed backend, driven from `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct FeedClient {
  base_url: String,
  timeout: Duration,
  attempts: u32,
  backoff: Duration
}

impl FeedClient {
  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      base_url: base_url.into().trim_end_matches('/').to_string(),
      timeout: Duration::from_secs(8),
      attempts: 3,
      backoff: Duration::from_millis(400)
    }
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  pub async fn fetch_feed(&self, team: &str, uuid: &str) -> anyhow::Result<Vec<FeedEntry>> {
    let query = vec![
      ("team".to_string(), team.to_string()),
      ("uuid".to_string(), uuid.to_string()),
      ("activeTab".to_string(), team.to_string()),
      ("timestamp".to_string(), Utc::now().timestamp_millis().to_string())
    ];
    let body = self.get_json("feed-message", query).await?;
    let entries = parse_feed(&body);
    tracing::info!(event = "feed_fetched", team = team, count = entries.len(), "feed fetched");
    Ok(entries)
  }

  /// Registers this install with the backend and returns its user id.
  pub async fn save_user(&self) -> anyhow::Result<String> {
    let body = self.get_json("save-user", Vec::new()).await?;
    body
      .get("uuid")
      .and_then(|u| u.as_str())
      .map(str::to_string)
      .ok_or_else(|| anyhow::anyhow!("save-user answer has no uuid"))
  }

  async fn get_json(&self, endpoint: &str, query: Vec<(String, String)>) -> anyhow::Result<Value> {
    let url = format!("{}/{}", self.base_url, endpoint);
    let mut last_err = None;
    for attempt in 1..=self.attempts {
      let url = url.clone();
      let query = query.clone();
      let timeout = self.timeout;
      let fetched = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        let mut req = ureq::get(&url).config().timeout_global(Some(timeout)).build();
        for (key, value) in &query {
          req = req.query(key, value);
        }
        let resp = req.call()?;
        Ok(resp.into_body().read_to_vec()?)
      })
      .await?;

      match fetched {
        Ok(bytes) => return Ok(serde_json::from_slice(&bytes)?),
        Err(e) => {
          tracing::warn!(event = "feed_request_failed", endpoint = endpoint, attempt = attempt, error = %e, "backend request failed");
          last_err = Some(e);
          if attempt < self.attempts {
            tokio::time::sleep(self.backoff * 2u32.pow(attempt - 1)).await;
          }
        }
      }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
  }
}

/// Backend user id, registering once when none is stored yet.
pub async fn ensure_backend_user(client: &FeedClient, store: &dyn PreferenceStore) -> anyhow::Result<String> {
  if let Some(uuid) = backend_user(store).await? {
    return Ok(uuid);
  }
  let uuid = client.save_user().await?;
  set_backend_user(store, &uuid).await?;
  Ok(uuid)
}

async fn resolve_username(tg: &dyn RemoteContentService, username: &str) -> Option<ChatId> {
  match tg.search_public_chat(username.to_string()).await {
    Ok(raw) => payload::decode(&raw)
      .ok()
      .and_then(|chat| first_present(&chat, &["id", "chat_id"]).and_then(as_i64_loose)),
    Err(e) => {
      tracing::warn!(event = "feed_channel_unresolved", channel = username, error = %e, "public chat lookup failed");
      None
    }
  }
}

/// Turns feed entries into full messages: newest first, at most [`FEED_BATCH`], entries that
/// cannot be fetched are dropped.
pub async fn load_feed_messages(tg: Arc<dyn RemoteContentService>, entries: &[FeedEntry]) -> Vec<MessageRecord> {
  let mut batch: Vec<FeedEntry> = entries.iter().take(FEED_BATCH).cloned().collect();
  batch.sort_by(|a, b| b.message_id.cmp(&a.message_id));

  let mut resolved: HashMap<String, Option<ChatId>> = HashMap::new();
  for channel in batch.iter().filter_map(|e| e.channel.as_deref()) {
    if !resolved.contains_key(channel) {
      let id = resolve_username(tg.as_ref(), channel).await;
      resolved.insert(channel.to_string(), id);
    }
  }

  let targets: Vec<(usize, ChatId, FeedEntry)> = batch
    .into_iter()
    .enumerate()
    .filter_map(|(idx, e)| {
      let chat_id = e.channel.as_ref().and_then(|c| resolved.get(c).copied().flatten()).or(e.chat_id)?;
      Some((idx, chat_id, e))
    })
    .collect();

  let chats: BTreeSet<ChatId> = targets.iter().map(|(_, chat_id, _)| *chat_id).collect();
  for chat_id in &chats {
    if let Err(e) = tg.open_chat(*chat_id).await {
      tracing::debug!(event = "feed_open_chat_failed", chat_id = chat_id, error = %e, "openChat failed");
    }
  }

  let limit = Arc::new(Semaphore::new(FETCH_CONCURRENCY));
  let mut set = JoinSet::new();
  for (idx, chat_id, entry) in targets {
    let tg = tg.clone();
    let limit = limit.clone();
    set.spawn(async move {
      let _permit = limit.acquire_owned().await.ok()?;
      match tg.get_message(chat_id, entry.message_id).await {
        Ok(raw) => normalize_raw(&raw).map(|mut record| {
          if record.channel.is_none() {
            record.channel = entry.channel.clone();
          }
          (idx, record)
        }),
        Err(e) => {
          tracing::warn!(
            event = "feed_message_fetch_failed",
            chat_id = chat_id,
            message_id = entry.message_id,
            error = %e,
            "getMessage failed"
          );
          None
        }
      }
    });
  }

  let mut fetched = Vec::new();
  while let Some(joined) = set.join_next().await {
    match joined {
      Ok(Some(item)) => fetched.push(item),
      Ok(None) => {}
      Err(e) => tracing::warn!(event = "feed_task_failed", error = %e, "message fetch task failed")
    }
  }
  fetched.sort_by_key(|(idx, _)| *idx);

  for chat_id in &chats {
    if let Err(e) = tg.close_chat(*chat_id).await {
      tracing::debug!(event = "feed_close_chat_failed", chat_id = chat_id, error = %e, "closeChat failed");
    }
  }

  tracing::info!(event = "feed_loaded", requested = entries.len().min(FEED_BATCH), loaded = fetched.len(), "feed messages loaded");
  fetched.into_iter().map(|(_, record)| record).collect()
}
