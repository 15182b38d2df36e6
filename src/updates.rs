use serde_json::Value;
use tokio::sync::broadcast;

use crate::media::progress::FileProgress;
use crate::telegram::payload::{self, as_i64_loose, first_present, PayloadError};
use crate::telegram::{ChatId, MessageId, Raw};

const HUB_CAPACITY: usize = 1024;

/// Process-wide push stream. Every subscriber sees every update published after it subscribed.
#[derive(Clone)]
pub struct UpdateHub {
  tx: broadcast::Sender<Raw>
}

impl UpdateHub {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(HUB_CAPACITY);
    Self { tx }
  }

  /// Returns how many subscribers received the update.
  pub fn publish(&self, raw: Raw) -> usize {
    self.tx.send(raw).unwrap_or(0)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Raw> {
    self.tx.subscribe()
  }

  pub fn subscriber_count(&self) -> usize {
    self.tx.receiver_count()
  }
}

impl Default for UpdateHub {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate {
  /// File download progress or completion.
  File(FileProgress),
  /// The update carries the full message; it is still only a trigger for a re-fetch.
  MessageEmbedded { chat_id: ChatId, message_id: MessageId, message: Value },
  /// Something about this message changed (interaction info, content, edit).
  MessageTouched { chat_id: ChatId, message_id: MessageId },
  Other(String)
}

impl LiveUpdate {
  pub fn message_key(&self) -> Option<(ChatId, MessageId)> {
    match self {
      LiveUpdate::MessageEmbedded { chat_id, message_id, .. } | LiveUpdate::MessageTouched { chat_id, message_id } => {
        Some((*chat_id, *message_id))
      }
      _ => None
    }
  }
}

pub fn classify(raw: &str) -> Result<LiveUpdate, PayloadError> {
  let value = payload::decode(raw)?;
  Ok(classify_value(&value))
}

pub fn classify_value(v: &Value) -> LiveUpdate {
  let kind = payload::type_name(v).to_string();

  if kind.eq_ignore_ascii_case("updateFile") || kind.eq_ignore_ascii_case("file") || carries_file(v) {
    if let Some(progress) = FileProgress::from_update(v) {
      return LiveUpdate::File(progress);
    }
  }

  if let Some(message) = v.get("message").filter(|m| m.is_object()) {
    let chat_id = first_present(message, &["chat_id", "chatId"]).and_then(as_i64_loose);
    let message_id = first_present(message, &["id", "message_id", "messageId"]).and_then(as_i64_loose);
    if let (Some(chat_id), Some(message_id)) = (chat_id, message_id) {
      return LiveUpdate::MessageEmbedded { chat_id, message_id, message: message.clone() };
    }
  }

  let chat_id = first_present(v, &["chat_id", "chatId"]).and_then(as_i64_loose);
  let message_id = first_present(v, &["message_id", "messageId"]).and_then(as_i64_loose);
  if let (Some(chat_id), Some(message_id)) = (chat_id, message_id) {
    return LiveUpdate::MessageTouched { chat_id, message_id };
  }

  LiveUpdate::Other(kind)
}

fn carries_file(v: &Value) -> bool {
  v.get("file").map(|f| f.is_object()).unwrap_or(false)
    || payload::path(v, "data.file").map(|f| f.is_object()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn recognizes_file_updates_in_both_spellings() {
    let raw = json!({
      "@type": "updateFile",
      "file": { "id": 42, "size": 1000, "local": { "path": "/tmp/a.mp4", "downloaded_size": 10 } }
    })
    .to_string();
    match classify(&raw).unwrap() {
      LiveUpdate::File(p) => {
        assert_eq!(p.file_id, Some(42));
        assert_eq!(p.downloaded, 10);
      }
      other => panic!("unexpected {other:?}")
    }

    let camel = json!({ "type": "UpdateFile", "data": { "file": { "id": 5, "local": { "downloadedSize": 3 } } } }).to_string();
    assert!(matches!(classify(&camel).unwrap(), LiveUpdate::File(_)));
  }

  #[test]
  fn recognizes_message_updates() {
    let touched = json!({ "type": "UpdateMessageInteractionInfo", "chatId": 10, "messageId": 5, "interactionInfo": {} });
    assert_eq!(classify_value(&touched), LiveUpdate::MessageTouched { chat_id: 10, message_id: 5 });

    let snake = json!({ "@type": "updateMessageContent", "chat_id": "-100", "message_id": 77 });
    assert_eq!(classify_value(&snake).message_key(), Some((-100, 77)));

    let embedded = json!({ "@type": "updateNewMessage", "message": { "id": 3, "chat_id": 9 } });
    assert!(matches!(classify_value(&embedded), LiveUpdate::MessageEmbedded { chat_id: 9, message_id: 3, .. }));
  }

  #[test]
  fn unknown_updates_keep_their_type() {
    let v = json!({ "@type": "updateOption", "name": "version" });
    assert_eq!(classify_value(&v), LiveUpdate::Other("updateOption".into()));
  }

  #[tokio::test]
  async fn hub_fans_out_to_every_subscriber() {
    let hub = UpdateHub::new();
    let mut a = hub.subscribe();
    let mut b = hub.subscribe();
    assert_eq!(hub.publish("{}".into()), 2);
    assert_eq!(a.recv().await.unwrap(), "{}");
    assert_eq!(b.recv().await.unwrap(), "{}");
  }
}
