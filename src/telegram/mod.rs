use std::sync::Arc;

use tokio::sync::broadcast;

use crate::paths::Paths;
use crate::settings::Settings;

pub mod payload;

pub type ChatId = i64;
pub type MessageId = i64;
pub type FileId = i32;
pub type UserId = i64;

/// Raw JSON text as returned by the messaging library. Decode with [`payload::decode`].
pub type Raw = String;

#[derive(thiserror::Error, Debug)]
pub enum TgError {
  #[error("not implemented")]
  NotImplemented,
  #[error("authorization required")]
  AuthRequired,
  #[error("request timed out")]
  Timeout,
  #[error("tdlib client is not running")]
  Disconnected,
  #[error("tdlib error {code}: {message}")]
  Remote { code: i64, message: String },
  #[error("malformed payload: {0}")]
  Payload(String),
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),
  #[error("{0}")]
  Other(String)
}

impl TgError {
  /// Failures worth another attempt: the request may succeed if simply repeated.
  pub fn is_transient(&self) -> bool {
    matches!(self, TgError::Timeout | TgError::Disconnected | TgError::Io(_))
  }
}

impl From<payload::PayloadError> for TgError {
  fn from(e: payload::PayloadError) -> Self {
    TgError::Payload(e.to_string())
  }
}

/// The opaque messaging service the client talks to. Every call answers with raw JSON.
#[async_trait::async_trait]
pub trait RemoteContentService: Send + Sync {
  async fn auth_start(&self, phone: String) -> Result<(), TgError>;
  async fn auth_submit_code(&self, code: String) -> Result<(), TgError>;
  async fn auth_submit_password(&self, password: String) -> Result<(), TgError>;
  async fn authorization_state(&self) -> Result<Raw, TgError>;
  async fn logout(&self) -> Result<(), TgError>;

  async fn get_profile(&self) -> Result<Raw, TgError>;
  async fn get_user_profile_photos(&self, user_id: UserId, offset: i32, limit: i32) -> Result<Raw, TgError>;

  async fn get_chat(&self, chat_id: ChatId) -> Result<Raw, TgError>;
  async fn search_public_chat(&self, username: String) -> Result<Raw, TgError>;
  async fn open_chat(&self, chat_id: ChatId) -> Result<(), TgError>;
  async fn close_chat(&self, chat_id: ChatId) -> Result<(), TgError>;

  async fn get_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<Raw, TgError>;
  async fn get_chat_history(&self, chat_id: ChatId, from_message_id: MessageId, limit: i32) -> Result<Raw, TgError>;
  async fn get_message_thread(&self, chat_id: ChatId, message_id: MessageId) -> Result<Raw, TgError>;
  async fn get_message_thread_history(
    &self,
    chat_id: ChatId,
    message_id: MessageId,
    from_message_id: MessageId,
    limit: i32
  ) -> Result<Raw, TgError>;
  async fn view_messages(&self, chat_id: ChatId, message_ids: Vec<MessageId>) -> Result<(), TgError>;

  async fn download_file(&self, file_id: FileId) -> Result<Raw, TgError>;
  /// Must succeed for downloads that already finished or never started.
  async fn cancel_download_file(&self, file_id: FileId) -> Result<(), TgError>;

  /// Push stream of raw updates (`updateFile`, message updates, authorization states).
  fn subscribe_updates(&self) -> broadcast::Receiver<Raw>;
}

#[cfg(any(test, feature = "mock_telegram"))]
mod mock;
#[cfg(any(test, feature = "mock_telegram"))]
pub use mock::MockTelegram;

#[cfg(feature = "tdlib")]
mod tdlib;
#[cfg(feature = "tdlib")]
pub use tdlib::TdlibTelegram;

pub fn make_remote_service(paths: &Paths, settings: &Settings) -> anyhow::Result<Arc<dyn RemoteContentService>> {
  #[cfg(feature = "mock_telegram")]
  {
    let _ = paths;
    let mock = match &settings.mock_fixtures {
      Some(path) => MockTelegram::from_fixtures(path)?,
      None => MockTelegram::new()
    };
    return Ok(Arc::new(mock));
  }

  #[cfg(all(not(feature = "mock_telegram"), feature = "tdlib"))]
  {
    return Ok(Arc::new(TdlibTelegram::new(paths, settings)?));
  }

  #[cfg(all(not(feature = "mock_telegram"), not(feature = "tdlib")))]
  {
    let _ = (paths, settings);
    Err(anyhow::anyhow!(
      "No Telegram backend selected. Enable the 'mock_telegram' or 'tdlib' feature."
    ))
  }
}
