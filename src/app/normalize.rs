use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value};

use crate::app::models::{
  FileRef, InteractionInfo, MessageContent, MessageRecord, Minithumbnail, PhotoContent, PhotoSize, Reaction, ReplyInfo,
  VideoContent
};
use crate::media::progress::FileProgress;
use crate::telegram::payload::{as_i64_loose, first_present, path};

/// Values above this are taken as milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

static EMPTY: Value = Value::Null;

/// First key that exists on the object, even if its value is `null`.
fn pick<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a Value> {
  let obj = v.as_object()?;
  keys.iter().find_map(|k| obj.get(*k))
}

fn non_null(v: Option<&Value>) -> Option<&Value> {
  v.filter(|x| !x.is_null())
}

fn string_at(v: &Value, paths: &[&str]) -> Option<String> {
  paths
    .iter()
    .filter_map(|p| path(v, p))
    .find(|found| !found.is_null())
    .map(|found| match found {
      Value::String(s) => s.clone(),
      other => other.to_string()
    })
}

fn int_at(v: &Value, paths: &[&str]) -> i64 {
  first_present(v, paths).and_then(as_i64_loose).unwrap_or(0)
}

/// Splits a possible date into `(seconds, milliseconds)`.
pub fn normalize_date(raw: i64) -> (i64, i64) {
  let seconds = if raw > MILLIS_THRESHOLD { raw.div_euclid(1000) } else { raw };
  (seconds, seconds.saturating_mul(1000))
}

fn iso_from_millis(ms: i64) -> String {
  DateTime::from_timestamp_millis(ms)
    .map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true))
    .unwrap_or_default()
}

/// Minithumbnail data arrives either as base64 text or as a byte array.
pub fn minithumbnail_base64(data: &Value) -> Option<String> {
  match data {
    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
    Value::Array(items) => {
      let bytes: Option<Vec<u8>> = items
        .iter()
        .map(|b| b.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect();
      bytes.filter(|b| !b.is_empty()).map(|b| BASE64.encode(b))
    }
    _ => None
  }
}

pub fn parse_minithumbnail(v: Option<&Value>) -> Option<Minithumbnail> {
  let mini = non_null(v)?;
  let data = match mini {
    Value::Object(_) => minithumbnail_base64(mini.get("data")?)?,
    other => minithumbnail_base64(other)?
  };
  Some(Minithumbnail { width: int_at(mini, &["width"]), height: int_at(mini, &["height"]), data })
}

pub fn parse_file(file: &Value) -> FileRef {
  let p = FileProgress::from_file(file);
  FileRef {
    id: p.file_id.unwrap_or(0),
    remote_id: p.remote_id,
    size: p.total.unwrap_or(0),
    local_path: p.local_path,
    downloaded: p.completed
  }
}

fn parse_photo(photo: &Value) -> Option<PhotoContent> {
  if !photo.is_object() {
    return None;
  }
  let sizes = photo
    .get("sizes")
    .and_then(|s| s.as_array())
    .map(|sizes| {
      sizes
        .iter()
        .filter_map(|s| {
          let file = s.get("photo")?;
          Some(PhotoSize {
            kind: string_at(s, &["type", "kind"]).unwrap_or_default(),
            width: int_at(s, &["width"]),
            height: int_at(s, &["height"]),
            photo: parse_file(file)
          })
        })
        .collect()
    })
    .unwrap_or_default();
  Some(PhotoContent { sizes, minithumbnail: parse_minithumbnail(photo.get("minithumbnail")) })
}

fn parse_video(video: &Value) -> Option<VideoContent> {
  if !video.is_object() {
    return None;
  }
  let file = non_null(video.get("video")).unwrap_or(video);
  Some(VideoContent {
    duration: int_at(video, &["duration"]),
    width: int_at(video, &["width"]),
    height: int_at(video, &["height"]),
    file_name: string_at(video, &["file_name", "fileName"]).unwrap_or_default(),
    mime_type: string_at(video, &["mime_type", "mimeType"]).unwrap_or_default(),
    video: parse_file(file),
    thumbnail: first_present(video, &["thumbnail.file", "thumbnail.photo"]).map(parse_file),
    minithumbnail: parse_minithumbnail(video.get("minithumbnail"))
  })
}

fn parse_reaction(r: &Value) -> Option<Reaction> {
  let emoji = string_at(r, &["type.emoji", "emoji", "reaction"])?;
  Some(Reaction {
    emoji,
    total_count: int_at(r, &["total_count", "totalCount", "count"]),
    is_chosen: first_present(r, &["is_chosen", "isChosen"]).and_then(|c| c.as_bool()).unwrap_or(false)
  })
}

fn caption_text(content: &Value) -> String {
  string_at(content, &["caption.text", "caption.formattedText", "caption.caption"]).unwrap_or_default()
}

fn message_text(content: &Value) -> String {
  if let Some(text) = non_null(path(content, "text.text")) {
    return text.as_str().map(str::to_string).unwrap_or_else(|| text.to_string());
  }
  if let Some(text) = content.get("text").and_then(|t| t.as_str()) {
    return text.to_string();
  }
  string_at(content, &["message_text.text"]).unwrap_or_default()
}

fn interaction_info(interaction: &Value, raw: &Value) -> InteractionInfo {
  let view_count = first_present(interaction, &["view_count", "viewCount"])
    .or_else(|| first_present(raw, &["view_count", "viewCount"]))
    .and_then(as_i64_loose)
    .unwrap_or(0);
  let reply_info = first_present(interaction, &["reply_info", "replyInfo"]).unwrap_or(&EMPTY);
  let reactions = first_present(interaction, &["reactions.reactions", "reactions", "reactionsList"])
    .and_then(|r| r.as_array())
    .map(|items| items.iter().filter_map(parse_reaction).collect())
    .unwrap_or_default();

  InteractionInfo {
    view_count,
    forward_count: int_at(interaction, &["forward_count", "forwardCount"]),
    reply_info: ReplyInfo { reply_count: int_at(reply_info, &["reply_count", "replyCount"]) },
    reactions
  }
}

/// Canonical message from any of the shapes the service and the backend produce. Total: every
/// missing field gets its default. Only a null input yields `None`.
pub fn normalize_message(srv: &Value) -> Option<MessageRecord> {
  if srv.is_null() {
    return None;
  }
  let unwrapped;
  let raw = match non_null(srv.get("raw")) {
    Some(Value::String(text)) => {
      unwrapped = serde_json::from_str::<Value>(text).unwrap_or(Value::Object(Map::new()));
      &unwrapped
    }
    Some(inner) => inner,
    None => srv
  };

  let content = non_null(pick(raw, &["content", "message", "message_content"])).unwrap_or(&EMPTY);
  let interaction = non_null(pick(raw, &["interaction_info", "interactionInfo", "interaction"])).unwrap_or(&EMPTY);

  let id = non_null(pick(raw, &["id", "messageId", "message_id"]))
    .or_else(|| non_null(srv.get("messageId")))
    .and_then(as_i64_loose)
    .unwrap_or(0);
  let chat_id = non_null(pick(raw, &["chat_id", "chatId", "chatIdStr"]))
    .or_else(|| non_null(path(raw, "sender_id.chat_id")))
    .or_else(|| non_null(srv.get("chatId")))
    .and_then(as_i64_loose)
    .unwrap_or(0);
  let raw_date = non_null(pick(raw, &["date", "timestamp", "time", "ts"])).and_then(as_i64_loose).unwrap_or(0);
  let (date, timestamp) = normalize_date(raw_date);

  let photo = content.get("photo").and_then(parse_photo);
  let video = content.get("video").and_then(parse_video);
  let minithumbnail = photo
    .as_ref()
    .and_then(|p| p.minithumbnail.as_ref())
    .or_else(|| video.as_ref().and_then(|v| v.minithumbnail.as_ref()))
    .map(|m| m.data.clone());

  Some(MessageRecord {
    id,
    chat_id,
    date,
    timestamp,
    iso: iso_from_millis(timestamp),
    content: MessageContent { caption: caption_text(content), text: message_text(content), photo, video },
    interaction_info: interaction_info(interaction, raw),
    minithumbnail,
    author_signature: string_at(raw, &["author_signature", "authorSignature"]).unwrap_or_default(),
    media_album_id: int_at(raw, &["media_album_id", "mediaAlbumId"]),
    channel: string_at(srv, &["channel"]),
    media_url: string_at(srv, &["media_url", "file_url"]),
    display_score: first_present(srv, &["displayScore", "display_score"]).and_then(|s| s.as_f64())
  })
}

/// Normalizes a service answer holding one message.
pub fn normalize_raw(raw: &str) -> Option<MessageRecord> {
  let value = crate::telegram::payload::decode(raw).ok()?;
  normalize_message(&value)
}

/// Normalizes every entry of a `messages` answer, skipping the ones that are null.
pub fn normalize_history(v: &Value) -> Vec<MessageRecord> {
  v.get("messages")
    .and_then(|m| m.as_array())
    .map(|items| items.iter().filter_map(normalize_message).collect())
    .unwrap_or_default()
}
