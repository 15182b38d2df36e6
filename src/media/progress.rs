use serde::Serialize;
use serde_json::Value;

use crate::telegram::payload::{as_i64_loose, first_present, path};
use crate::telegram::FileId;

/// Buffered prefix needed before a partially downloaded video is handed to the player.
pub const START_THRESHOLD_BYTES: i64 = 120 * 1024;
/// Videos at or above this size are not downloaded until asked for.
pub const LARGE_FILE_THRESHOLD: i64 = 10 * 1024 * 1024;
pub const LONG_VIDEO_SECS: i64 = 120;

/// One observation of a remote file, taken from an `updateFile` push or a `downloadFile` answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileProgress {
  pub file_id: Option<FileId>,
  pub remote_id: Option<String>,
  pub local_path: Option<String>,
  pub downloaded: i64,
  pub total: Option<i64>,
  pub completed: bool
}

impl FileProgress {
  /// Finds the file object inside an update (`file`, `data.file`, `data`, or the update itself).
  /// Returns `None` when nothing identifies the file.
  pub fn from_update(v: &Value) -> Option<Self> {
    let file = first_present(v, &["file", "data.file", "data"]).unwrap_or(v);
    if !file.is_object() {
      return None;
    }
    let progress = Self::from_file(file);
    if progress.file_id.is_none() && progress.remote_id.is_none() {
      return None;
    }
    Some(progress)
  }

  /// Reads a TDLib `file` object. Accepts snake_case and camelCase field spellings.
  pub fn from_file(file: &Value) -> Self {
    let file_id = first_present(file, &["id", "file_id", "fileId"])
      .and_then(as_i64_loose)
      .and_then(|id| FileId::try_from(id).ok());
    let remote_id = path(file, "remote.id").and_then(|r| match r {
      Value::String(s) if !s.is_empty() => Some(s.clone()),
      Value::Number(n) => Some(n.to_string()),
      _ => None
    });
    let local_path = path(file, "local.path")
      .and_then(|p| p.as_str())
      .map(str::trim)
      .filter(|p| !p.is_empty())
      .map(str::to_string);
    let downloaded = first_present(
      file,
      &[
        "local.downloadedSize",
        "local.downloaded_size",
        "local.downloaded_prefix_size",
        "downloadedSize",
        "downloaded_size"
      ]
    )
    .and_then(as_i64_loose)
    .unwrap_or(0);
    let total = first_present(file, &["size", "total", "expected_size"])
      .and_then(as_i64_loose)
      .filter(|t| *t > 0);
    let completed = ["local.is_downloading_completed", "local.isDownloadingCompleted"]
      .iter()
      .any(|p| path(file, p).and_then(|v| v.as_bool()).unwrap_or(false));

    Self { file_id, remote_id, local_path, downloaded, total, completed }
  }

  pub fn percent(&self) -> Option<u8> {
    let total = self.total?;
    let pct = self.downloaded.max(0).saturating_mul(100) / total.max(1);
    Some(pct.clamp(0, 100) as u8)
  }

  pub fn uri(&self) -> Option<String> {
    self.local_path.as_deref().map(to_file_uri)
  }
}

/// `scheme://...` counts as a URI already; everything else is a bare filesystem path.
pub fn is_uri_like(path: &str) -> bool {
  match path.split_once("://") {
    Some((scheme, _)) => {
      !scheme.is_empty()
        && scheme.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
        && scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    }
    None => false
  }
}

pub fn to_file_uri(path: &str) -> String {
  if is_uri_like(path) {
    path.to_string()
  } else {
    format!("file://{path}")
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
  Photo,
  Video
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum MediaPhase {
  Placeholder,
  Downloading { percent: u8 },
  Ready { uri: String },
  Failed { reason: String }
}

impl MediaPhase {
  pub fn is_ready(&self) -> bool {
    matches!(self, MediaPhase::Ready { .. })
  }
}

/// Display state of one media item. `Ready` is terminal: once a path is committed every further
/// event for the file is ignored.
#[derive(Debug, Clone)]
pub struct MediaTracker {
  file_id: FileId,
  remote_id: Option<String>,
  kind: MediaKind,
  phase: MediaPhase,
  committed: bool
}

impl MediaTracker {
  pub fn new(file_id: FileId, remote_id: Option<String>, kind: MediaKind) -> Self {
    Self { file_id, remote_id, kind, phase: MediaPhase::Placeholder, committed: false }
  }

  pub fn file_id(&self) -> FileId {
    self.file_id
  }

  pub fn kind(&self) -> MediaKind {
    self.kind
  }

  pub fn phase(&self) -> &MediaPhase {
    &self.phase
  }

  pub fn is_committed(&self) -> bool {
    self.committed
  }

  /// Matching is by string equality: the update may name the file by its local id or its remote id.
  pub fn matches(&self, p: &FileProgress) -> bool {
    let tracked = [Some(self.file_id.to_string()), self.remote_id.clone()];
    let incoming = [p.file_id.map(|id| id.to_string()), p.remote_id.clone()];
    incoming
      .iter()
      .flatten()
      .any(|i| tracked.iter().flatten().any(|t| t == i))
  }

  /// A download was requested.
  pub fn begin(&mut self) -> Option<MediaPhase> {
    match self.phase {
      MediaPhase::Placeholder | MediaPhase::Failed { .. } => self.set(MediaPhase::Downloading { percent: 0 }),
      _ => None
    }
  }

  /// Applies a progress observation and returns the new phase when it changed.
  pub fn apply(&mut self, p: &FileProgress) -> Option<MediaPhase> {
    if self.committed || !self.matches(p) {
      return None;
    }

    let playable = match self.kind {
      MediaKind::Video => p.completed || p.downloaded >= START_THRESHOLD_BYTES,
      MediaKind::Photo => p.completed
    };
    if playable {
      if let Some(uri) = p.uri() {
        return self.commit(uri);
      }
    } else {
      tracing::debug!(
        event = "media_progress_below_threshold",
        file_id = self.file_id,
        downloaded = p.downloaded,
        "progress below start threshold"
      );
    }

    let percent = match (p.percent(), &self.phase) {
      (Some(pct), _) => pct,
      (None, MediaPhase::Downloading { percent }) => *percent,
      (None, _) => 0
    };
    self.set(MediaPhase::Downloading { percent })
  }

  /// One-shot: the first committed uri wins.
  pub fn commit(&mut self, uri: String) -> Option<MediaPhase> {
    if self.committed {
      return None;
    }
    self.committed = true;
    self.set(MediaPhase::Ready { uri })
  }

  pub fn fail(&mut self, reason: impl Into<String>) -> Option<MediaPhase> {
    if self.committed {
      return None;
    }
    self.set(MediaPhase::Failed { reason: reason.into() })
  }

  /// Back to the placeholder after the download was cancelled.
  pub fn reset(&mut self) -> Option<MediaPhase> {
    if self.committed {
      return None;
    }
    self.set(MediaPhase::Placeholder)
  }

  fn set(&mut self, next: MediaPhase) -> Option<MediaPhase> {
    if self.phase == next {
      return None;
    }
    self.phase = next.clone();
    Some(next)
  }
}
