use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::updates::UpdateHub;
use super::payload::{as_i64_loose, first_present};
use super::{ChatId, FileId, MessageId, Raw, RemoteContentService, TgError, UserId};

/// In-memory service: answers from fixtures and records every call.
pub struct MockTelegram {
  hub: UpdateHub,
  state: Mutex<MockState>
}

#[derive(Default)]
struct MockState {
  authed: bool,
  messages: HashMap<(ChatId, MessageId), Value>,
  chats: HashMap<ChatId, Value>,
  public_chats: HashMap<String, ChatId>,
  files: HashMap<FileId, Value>,
  auth_errors: HashMap<&'static str, String>,
  hold_downloads: bool,
  calls: Vec<String>
}

impl MockTelegram {
  pub fn new() -> Self {
    Self { hub: UpdateHub::new(), state: Mutex::new(MockState { authed: true, ..MockState::default() }) }
  }

  /// Loads `{ "chats": [...], "messages": [...], "files": [...] }` from a JSON file.
  pub fn from_fixtures(path: &Path) -> anyhow::Result<Self> {
    let text = std::fs::read_to_string(path)?;
    let fixtures: Value = serde_json::from_str(&text)?;
    let mock = Self::new();
    for chat in fixtures.get("chats").and_then(|v| v.as_array()).into_iter().flatten() {
      mock.add_chat(chat.clone());
    }
    for message in fixtures.get("messages").and_then(|v| v.as_array()).into_iter().flatten() {
      mock.add_message(message.clone());
    }
    for file in fixtures.get("files").and_then(|v| v.as_array()).into_iter().flatten() {
      mock.add_file(file.clone());
    }
    Ok(mock)
  }

  pub fn with_message(self, message: Value) -> Self {
    self.add_message(message);
    self
  }

  pub fn with_chat(self, chat: Value) -> Self {
    self.add_chat(chat);
    self
  }

  pub fn with_file(self, file: Value) -> Self {
    self.add_file(file);
    self
  }

  /// Makes the named auth step (`phone`, `code`, `password`) fail with `message`.
  pub fn with_auth_error(self, step: &'static str, message: &str) -> Self {
    self.state.lock().auth_errors.insert(step, message.to_string());
    self
  }

  /// `download_file` never answers; progress then only arrives through pushed updates.
  pub fn with_held_downloads(self) -> Self {
    self.state.lock().hold_downloads = true;
    self
  }

  pub fn add_message(&self, message: Value) {
    let chat_id = first_present(&message, &["chat_id", "chatId"]).and_then(as_i64_loose).unwrap_or(0);
    let id = first_present(&message, &["id", "message_id"]).and_then(as_i64_loose).unwrap_or(0);
    self.state.lock().messages.insert((chat_id, id), message);
  }

  pub fn add_chat(&self, chat: Value) {
    let id = first_present(&chat, &["id", "chat_id"]).and_then(as_i64_loose).unwrap_or(0);
    let mut state = self.state.lock();
    if let Some(username) = chat.get("username").and_then(|u| u.as_str()) {
      state.public_chats.insert(username.to_lowercase(), id);
    }
    state.chats.insert(id, chat);
  }

  pub fn add_file(&self, file: Value) {
    let id = file.get("id").and_then(as_i64_loose).and_then(|id| FileId::try_from(id).ok()).unwrap_or(0);
    self.state.lock().files.insert(id, file);
  }

  /// Publishes a push update to every subscriber.
  pub fn push_update(&self, update: Value) -> usize {
    self.hub.publish(update.to_string())
  }

  pub fn calls(&self) -> Vec<String> {
    self.state.lock().calls.clone()
  }

  pub fn count_calls(&self, prefix: &str) -> usize {
    self.state.lock().calls.iter().filter(|c| c.starts_with(prefix)).count()
  }

  fn record(&self, call: String) {
    self.state.lock().calls.push(call);
  }

  fn auth_step(&self, step: &'static str) -> Result<(), TgError> {
    let mut state = self.state.lock();
    state.calls.push(format!("auth_{step}"));
    match state.auth_errors.get(step) {
      Some(message) => Err(TgError::Remote { code: 400, message: message.clone() }),
      None => Ok(())
    }
  }
}

impl Default for MockTelegram {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait::async_trait]
impl RemoteContentService for MockTelegram {
  async fn auth_start(&self, _phone: String) -> Result<(), TgError> { self.auth_step("phone") }
  async fn auth_submit_code(&self, _code: String) -> Result<(), TgError> { self.auth_step("code") }
  async fn auth_submit_password(&self, _password: String) -> Result<(), TgError> { self.auth_step("password") }

  async fn authorization_state(&self) -> Result<Raw, TgError> {
    let state = if self.state.lock().authed { "authorizationStateReady" } else { "authorizationStateWaitPhoneNumber" };
    Ok(json!({ "@type": state }).to_string())
  }

  async fn logout(&self) -> Result<(), TgError> {
    self.record("logout".into());
    self.state.lock().authed = false;
    Ok(())
  }

  async fn get_profile(&self) -> Result<Raw, TgError> {
    Ok(json!({ "@type": "user", "id": 1, "first_name": "Mock", "usernames": { "active_usernames": ["mock"] } }).to_string())
  }

  async fn get_user_profile_photos(&self, user_id: UserId, _offset: i32, _limit: i32) -> Result<Raw, TgError> {
    self.record(format!("get_user_profile_photos:{user_id}"));
    Ok(json!({ "@type": "chatPhotos", "total_count": 0, "photos": [] }).to_string())
  }

  async fn get_chat(&self, chat_id: ChatId) -> Result<Raw, TgError> {
    self.record(format!("get_chat:{chat_id}"));
    self.state.lock().chats.get(&chat_id).map(|c| c.to_string()).ok_or_else(|| TgError::Remote {
      code: 400,
      message: "Chat not found".into()
    })
  }

  async fn search_public_chat(&self, username: String) -> Result<Raw, TgError> {
    self.record(format!("search_public_chat:{username}"));
    let state = self.state.lock();
    let key = username.trim_start_matches('@').to_lowercase();
    state
      .public_chats
      .get(&key)
      .and_then(|id| state.chats.get(id))
      .map(|c| c.to_string())
      .ok_or_else(|| TgError::Remote { code: 400, message: "USERNAME_NOT_OCCUPIED".into() })
  }

  async fn open_chat(&self, chat_id: ChatId) -> Result<(), TgError> {
    self.record(format!("open_chat:{chat_id}"));
    Ok(())
  }

  async fn close_chat(&self, chat_id: ChatId) -> Result<(), TgError> {
    self.record(format!("close_chat:{chat_id}"));
    Ok(())
  }

  async fn get_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<Raw, TgError> {
    self.record(format!("get_message:{chat_id}:{message_id}"));
    self
      .state
      .lock()
      .messages
      .get(&(chat_id, message_id))
      .map(|m| json!({ "raw": m.to_string() }).to_string())
      .ok_or_else(|| TgError::Remote { code: 404, message: "Message not found".into() })
  }

  async fn get_chat_history(&self, chat_id: ChatId, from_message_id: MessageId, limit: i32) -> Result<Raw, TgError> {
    self.record(format!("get_chat_history:{chat_id}:{from_message_id}"));
    let state = self.state.lock();
    let mut messages: Vec<&Value> = state
      .messages
      .iter()
      .filter(|((c, id), _)| *c == chat_id && (from_message_id == 0 || *id < from_message_id))
      .map(|(_, m)| m)
      .collect();
    messages.sort_by_key(|m| std::cmp::Reverse(m.get("id").and_then(as_i64_loose).unwrap_or(0)));
    messages.truncate(limit.max(0) as usize);
    Ok(json!({ "@type": "messages", "total_count": messages.len(), "messages": messages }).to_string())
  }

  async fn get_message_thread(&self, chat_id: ChatId, message_id: MessageId) -> Result<Raw, TgError> {
    self.record(format!("get_message_thread:{chat_id}:{message_id}"));
    Ok(json!({ "@type": "messageThreadInfo", "chat_id": chat_id, "message_thread_id": message_id, "messages": [] }).to_string())
  }

  async fn get_message_thread_history(
    &self,
    chat_id: ChatId,
    message_id: MessageId,
    _from_message_id: MessageId,
    _limit: i32
  ) -> Result<Raw, TgError> {
    self.record(format!("get_message_thread_history:{chat_id}:{message_id}"));
    Ok(json!({ "@type": "messages", "total_count": 0, "messages": [] }).to_string())
  }

  async fn view_messages(&self, chat_id: ChatId, message_ids: Vec<MessageId>) -> Result<(), TgError> {
    self.record(format!("view_messages:{chat_id}:{}", message_ids.len()));
    Ok(())
  }

  async fn download_file(&self, file_id: FileId) -> Result<Raw, TgError> {
    self.record(format!("download_file:{file_id}"));
    let held = self.state.lock().hold_downloads;
    if held {
      std::future::pending::<()>().await;
    }
    let file = self.state.lock().files.get(&file_id).cloned().unwrap_or_else(|| {
      json!({ "@type": "file", "id": file_id, "local": { "path": "", "is_downloading_completed": false, "downloaded_size": 0 } })
    });
    Ok(file.to_string())
  }

  async fn cancel_download_file(&self, file_id: FileId) -> Result<(), TgError> {
    self.record(format!("cancel_download_file:{file_id}"));
    Ok(())
  }

  fn subscribe_updates(&self) -> broadcast::Receiver<Raw> {
    self.hub.subscribe()
  }
}
