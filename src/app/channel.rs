use serde::Serialize;
use serde_json::Value;

use crate::app::models::{data_uri_from_base64, ChannelSummary, FileRef};
use crate::app::normalize::{minithumbnail_base64, normalize_message, parse_file};
use crate::media::progress::to_file_uri;
use crate::telegram::payload::{self, as_i64_loose, first_present};
use crate::telegram::{ChatId, RemoteContentService};

pub const UNTITLED: &str = "بدون عنوان";
const PREVIEW_MAX_CHARS: usize = 60;

/// A channel as the caller knows it: a chat object already at hand, a numeric id or a username.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelRef {
  Chat(Value),
  Id(ChatId),
  Username(String)
}

impl ChannelRef {
  pub fn from_value(v: &Value) -> Option<Self> {
    match v {
      Value::Object(_) => Some(Self::Chat(v.clone())),
      Value::Number(_) => as_i64_loose(v).map(Self::Id),
      Value::String(s) => Some(Self::parse(s)),
      _ => None
    }
  }

  /// Numeric text is an id; anything else is a username, with or without `@`.
  pub fn parse(s: &str) -> Self {
    let trimmed = s.trim();
    match trimmed.parse::<ChatId>() {
      Ok(id) => Self::Id(id),
      Err(_) => Self::Username(trimmed.trim_start_matches('@').to_string())
    }
  }
}

/// Chat object reduced to what the client shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
  pub id: ChatId,
  pub title: String,
  pub kind: Option<String>,
  pub small: Option<FileRef>,
  pub big: Option<FileRef>,
  pub minithumbnail: Option<String>
}

pub fn normalize_chat(srv: &Value) -> Option<ChatRecord> {
  if !srv.is_object() {
    return None;
  }
  let id = first_present(srv, &["id", "chat_id"]).and_then(as_i64_loose).unwrap_or(0);
  let title = first_present(srv, &["title", "name"]).and_then(|t| t.as_str()).unwrap_or_default().to_string();
  let kind = first_present(srv, &["type.@type", "type", "_"]).and_then(|t| t.as_str()).map(str::to_string);
  let photo = srv.get("photo").filter(|p| p.is_object());
  let minithumbnail = first_present(srv, &["minithumbnail.data", "minithumbnail", "photo.minithumbnail.data"])
    .and_then(minithumbnail_base64);

  Some(ChatRecord {
    id,
    title,
    kind,
    small: photo.and_then(|p| p.get("small")).filter(|f| f.is_object()).map(parse_file),
    big: photo.and_then(|p| p.get("big")).filter(|f| f.is_object()).map(parse_file),
    minithumbnail
  })
}

/// Collapses whitespace and cuts to the preview length.
pub fn preview_text(text: &str) -> String {
  let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
  if cleaned.chars().count() <= PREVIEW_MAX_CHARS {
    return cleaned;
  }
  let cut: String = cleaned.chars().take(PREVIEW_MAX_CHARS).collect();
  format!("{}…", cut.trim_end())
}

fn str_field(v: &Value, keys: &[&str]) -> Option<String> {
  first_present(v, keys).and_then(|s| s.as_str()).map(str::to_string).filter(|s| !s.is_empty())
}

fn summarize_chat(ch: &Value) -> ChannelSummary {
  let chat = normalize_chat(ch);
  let title = str_field(ch, &["title", "name", "username"]).unwrap_or_default();
  let resolved_chat_id = first_present(ch, &["chatId", "id"]).and_then(as_i64_loose);

  let last_message = ch.get("last_message").and_then(normalize_message);
  let last_text = str_field(ch, &["lastMessageText", "lastMessage"]).or_else(|| {
    last_message.as_ref().map(|m| if m.content.text.is_empty() { m.content.caption.clone() } else { m.content.text.clone() })
  });
  let last_thumb = str_field(ch, &["lastMessageMiniThumbnail", "lastMessage_mini_thumbnail", "miniThumbnailBase64"])
    .or_else(|| last_message.as_ref().and_then(|m| m.minithumbnail.clone()));

  let full = str_field(ch, &["profileBase64", "avatarBase64"]).and_then(|b| data_uri_from_base64(&b));
  let small = str_field(ch, &["avatarSmallBase64", "avatar_small_base64"]).and_then(|b| data_uri_from_base64(&b));
  let mini = str_field(ch, &["miniThumbnailBase64", "miniThumbnail"])
    .or_else(|| chat.as_ref().and_then(|c| c.minithumbnail.clone()))
    .and_then(|b| data_uri_from_base64(&b));
  let downloaded_small = chat
    .as_ref()
    .and_then(|c| c.small.as_ref())
    .filter(|f| f.downloaded)
    .and_then(|f| f.local_path.as_deref())
    .map(to_file_uri);

  let (avatar_uri, mini_avatar_uri) = match full.or(downloaded_small) {
    Some(full) => (Some(full), None),
    None => (None, small.or(mini))
  };

  ChannelSummary {
    title,
    avatar_uri,
    mini_avatar_uri,
    last_message_preview: last_text.as_deref().map(preview_text).unwrap_or_default(),
    last_message_thumb_uri: last_thumb.and_then(|b| data_uri_from_base64(&b)),
    resolved_chat_id
  }
}

/// Display shape without any network access.
pub fn summarize(channel: &ChannelRef) -> ChannelSummary {
  match channel {
    ChannelRef::Chat(ch) => summarize_chat(ch),
    ChannelRef::Id(id) => ChannelSummary { title: id.to_string(), resolved_chat_id: Some(*id), ..Default::default() },
    ChannelRef::Username(name) => ChannelSummary { title: name.clone(), ..Default::default() }
  }
}

/// Like [`summarize`] for a loose value; unknown shapes get the untitled placeholder.
pub fn summarize_value(v: &Value) -> ChannelSummary {
  match ChannelRef::from_value(v) {
    Some(channel) => summarize(&channel),
    None => ChannelSummary { title: UNTITLED.to_string(), ..Default::default() }
  }
}

/// Looks the channel up when only an id or username is known. Falls back to [`summarize`] when
/// the lookup fails.
pub async fn resolve_channel(channel: &ChannelRef, tg: &dyn RemoteContentService) -> ChannelSummary {
  let fetched = match channel {
    ChannelRef::Chat(_) => return summarize(channel),
    ChannelRef::Id(id) => tg.get_chat(*id).await,
    ChannelRef::Username(name) => tg.search_public_chat(name.clone()).await
  };

  let chat = match fetched {
    Ok(raw) => match payload::decode(&raw) {
      Ok(chat) => chat,
      Err(e) => {
        tracing::warn!(event = "channel_decode_failed", channel = ?channel, error = %e, "channel answer undecodable");
        return summarize(channel);
      }
    },
    Err(e) => {
      tracing::warn!(event = "channel_resolve_failed", channel = ?channel, error = %e, "channel lookup failed");
      return summarize(channel);
    }
  };

  let mut summary = summarize_chat(&chat);
  if summary.title.is_empty() {
    summary.title = summarize(channel).title;
  }
  if summary.resolved_chat_id.is_none() {
    if let ChannelRef::Id(id) = channel {
      summary.resolved_chat_id = Some(*id);
    }
  }
  summary
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  use crate::telegram::MockTelegram;

  #[test]
  fn parses_references() {
    assert_eq!(ChannelRef::from_value(&json!(-1001)), Some(ChannelRef::Id(-1001)));
    assert_eq!(ChannelRef::from_value(&json!("-1001")), Some(ChannelRef::Id(-1001)));
    assert_eq!(ChannelRef::from_value(&json!("@esteghlal")), Some(ChannelRef::Username("esteghlal".into())));
    assert_eq!(ChannelRef::from_value(&Value::Null), None);
    assert_eq!(summarize_value(&Value::Null).title, UNTITLED);
  }

  #[test]
  fn preview_is_collapsed_and_truncated() {
    assert_eq!(preview_text("  a \n\n b  "), "a b");
    let long = "x".repeat(70);
    let p = preview_text(&long);
    assert_eq!(p.chars().count(), 61);
    assert!(p.ends_with('…'));
  }

  #[test]
  fn backend_chat_prefers_full_profile_image() {
    let s = summarize(&ChannelRef::Chat(json!({
      "name": "Sepahan", "chatId": 44,
      "profileBase64": "QUJD", "avatarSmallBase64": "REVG",
      "lastMessageText": "hello   world", "lastMessageMiniThumbnail": "R0hJ"
    })));
    assert_eq!(s.title, "Sepahan");
    assert_eq!(s.resolved_chat_id, Some(44));
    assert_eq!(s.avatar_uri.as_deref(), Some("data:image/jpeg;base64,QUJD"));
    assert_eq!(s.mini_avatar_uri, None);
    assert_eq!(s.last_message_preview, "hello world");
    assert_eq!(s.last_message_thumb_uri.as_deref(), Some("data:image/jpeg;base64,R0hJ"));

    let s = summarize(&ChannelRef::Chat(json!({ "title": "T", "avatarSmallBase64": "REVG" })));
    assert_eq!(s.avatar_uri, None);
    assert_eq!(s.mini_avatar_uri.as_deref(), Some("data:image/jpeg;base64,REVG"));
  }

  #[tokio::test]
  async fn resolves_username_through_service() {
    let tg = MockTelegram::new().with_chat(json!({
      "@type": "chat", "id": -100500, "title": "Persepolis FC", "username": "persepolis",
      "photo": { "minithumbnail": { "data": "AAEC" }, "small": { "id": 3, "local": { "path": "/a/s.jpg", "is_downloading_completed": true } } },
      "last_message": { "id": 9, "chat_id": -100500, "content": { "text": { "text": "match day" } } }
    }));

    let s = resolve_channel(&ChannelRef::Username("persepolis".into()), &tg).await;
    assert_eq!(s.title, "Persepolis FC");
    assert_eq!(s.resolved_chat_id, Some(-100500));
    assert_eq!(s.avatar_uri.as_deref(), Some("file:///a/s.jpg"));
    assert_eq!(s.last_message_preview, "match day");
  }

  #[tokio::test]
  async fn falls_back_when_lookup_fails() {
    let tg = MockTelegram::new();
    let s = resolve_channel(&ChannelRef::Id(77), &tg).await;
    assert_eq!(s.title, "77");
    assert_eq!(s.resolved_chat_id, Some(77));
  }
}
