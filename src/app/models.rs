use serde::Serialize;

use crate::media::progress::{to_file_uri, MediaKind, LARGE_FILE_THRESHOLD, LONG_VIDEO_SECS};
use crate::telegram::{ChatId, FileId, MessageId};

/// A remote file as known to the messaging service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
  pub id: FileId,
  pub remote_id: Option<String>,
  pub size: i64,
  pub local_path: Option<String>,
  pub downloaded: bool
}

/// Inline preview, always held as base64 whatever shape it arrived in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Minithumbnail {
  pub width: i64,
  pub height: i64,
  pub data: String
}

impl Minithumbnail {
  pub fn data_uri(&self) -> String {
    data_uri_from_base64(&self.data).unwrap_or_default()
  }
}

pub fn data_uri_from_base64(b64: &str) -> Option<String> {
  let trimmed = b64.trim();
  if trimmed.is_empty() {
    return None;
  }
  if trimmed.starts_with("data:") {
    return Some(trimmed.to_string());
  }
  Some(format!("data:image/jpeg;base64,{trimmed}"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoSize {
  pub kind: String,
  pub width: i64,
  pub height: i64,
  pub photo: FileRef
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoContent {
  pub sizes: Vec<PhotoSize>,
  pub minithumbnail: Option<Minithumbnail>
}

impl PhotoContent {
  /// Sizes are ordered smallest first; the last one is what gets downloaded.
  pub fn largest(&self) -> Option<&PhotoSize> {
    self.sizes.last()
  }

  pub fn descriptor(&self) -> Option<FileDescriptor> {
    let best = self.largest()?;
    Some(FileDescriptor {
      id: best.photo.id,
      kind: MediaKind::Photo,
      remote_id: best.photo.remote_id.clone(),
      size: best.photo.size,
      duration: 0,
      local_path: best.photo.local_path.clone(),
      downloaded: best.photo.downloaded,
      sizes: self.sizes.clone(),
      minithumbnail: self.minithumbnail.clone()
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoContent {
  pub duration: i64,
  pub width: i64,
  pub height: i64,
  pub file_name: String,
  pub mime_type: String,
  pub video: FileRef,
  pub thumbnail: Option<FileRef>,
  pub minithumbnail: Option<Minithumbnail>
}

impl VideoContent {
  pub fn descriptor(&self) -> FileDescriptor {
    FileDescriptor {
      id: self.video.id,
      kind: MediaKind::Video,
      remote_id: self.video.remote_id.clone(),
      size: self.video.size,
      duration: self.duration,
      local_path: self.video.local_path.clone(),
      downloaded: self.video.downloaded,
      sizes: Vec::new(),
      minithumbnail: self.minithumbnail.clone()
    }
  }
}

/// What a media component needs to fetch and show one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
  pub id: FileId,
  pub kind: MediaKind,
  pub remote_id: Option<String>,
  pub size: i64,
  pub duration: i64,
  pub local_path: Option<String>,
  pub downloaded: bool,
  pub sizes: Vec<PhotoSize>,
  pub minithumbnail: Option<Minithumbnail>
}

impl FileDescriptor {
  /// Photos always load right away. Videos only when small and short; large or long ones stream
  /// on demand.
  pub fn auto_start(&self) -> bool {
    match self.kind {
      MediaKind::Photo => true,
      MediaKind::Video => self.size > 0 && self.size < LARGE_FILE_THRESHOLD && self.duration < LONG_VIDEO_SECS
    }
  }

  /// A file the service reports as fully downloaded can be shown without asking again.
  pub fn ready_uri(&self) -> Option<String> {
    if !self.downloaded {
      return None;
    }
    self.local_path.as_deref().map(to_file_uri)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
  pub caption: String,
  pub text: String,
  pub photo: Option<PhotoContent>,
  pub video: Option<VideoContent>
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
  pub emoji: String,
  pub total_count: i64,
  pub is_chosen: bool
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyInfo {
  pub reply_count: i64
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionInfo {
  pub view_count: i64,
  pub forward_count: i64,
  pub reply_info: ReplyInfo,
  pub reactions: Vec<Reaction>
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
  pub id: MessageId,
  pub chat_id: ChatId,
  /// Seconds since epoch.
  pub date: i64,
  /// Milliseconds since epoch.
  pub timestamp: i64,
  pub iso: String,
  pub content: MessageContent,
  pub interaction_info: InteractionInfo,
  pub minithumbnail: Option<String>,
  pub author_signature: String,
  pub media_album_id: i64,
  pub channel: Option<String>,
  pub media_url: Option<String>,
  pub display_score: Option<f64>
}

impl MessageRecord {
  pub fn key(&self) -> (ChatId, MessageId) {
    (self.chat_id, self.id)
  }

  pub fn media(&self) -> Option<FileDescriptor> {
    if let Some(video) = &self.content.video {
      return Some(video.descriptor());
    }
    self.content.photo.as_ref().and_then(|p| p.descriptor())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
  pub title: String,
  pub avatar_uri: Option<String>,
  pub mini_avatar_uri: Option<String>,
  pub last_message_preview: String,
  pub last_message_thumb_uri: Option<String>,
  pub resolved_chat_id: Option<ChatId>
}
