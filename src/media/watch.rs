use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::models::FileDescriptor;
use crate::media::coordinator::{DownloadCoordinator, DownloadOutcome};
use crate::media::progress::{MediaPhase, MediaTracker};
use crate::telegram::{FileId, Raw};
use crate::updates::{classify, LiveUpdate};

struct Shared {
  tracker: Mutex<MediaTracker>,
  phase_tx: watch::Sender<MediaPhase>,
  /// Generation of the download this item started; `None` while another item holds the file.
  owned: Mutex<Option<u64>>
}

impl Shared {
  fn update(&self, f: impl FnOnce(&mut MediaTracker) -> Option<MediaPhase>) {
    let changed = {
      let mut tracker = self.tracker.lock();
      f(&mut tracker)
    };
    if let Some(phase) = changed {
      self.phase_tx.send_replace(phase);
    }
  }

  fn is_committed(&self) -> bool {
    self.tracker.lock().is_committed()
  }
}

/// One mounted media item: drives the download for its file and follows the push stream until a
/// playable path is committed.
pub struct MediaWatch {
  file_id: FileId,
  shared: Arc<Shared>,
  phase_rx: watch::Receiver<MediaPhase>,
  start: Arc<Notify>,
  token: CancellationToken,
  coordinator: Arc<DownloadCoordinator>,
  task: Option<JoinHandle<()>>
}

impl MediaWatch {
  pub fn spawn(
    coordinator: Arc<DownloadCoordinator>,
    updates: broadcast::Receiver<Raw>,
    descriptor: &FileDescriptor
  ) -> Self {
    let tracker = MediaTracker::new(descriptor.id, descriptor.remote_id.clone(), descriptor.kind);
    let (phase_tx, phase_rx) = watch::channel(MediaPhase::Placeholder);
    let shared = Arc::new(Shared { tracker: Mutex::new(tracker), phase_tx, owned: Mutex::new(None) });
    let token = CancellationToken::new();
    let start = Arc::new(Notify::new());

    let task = match descriptor.ready_uri() {
      Some(uri) => {
        tracing::debug!(event = "media_watch_already_local", file_id = descriptor.id, "file already downloaded");
        shared.update(|t| t.commit(uri));
        None
      }
      None => Some(tokio::spawn(drive(
        shared.clone(),
        coordinator.clone(),
        updates,
        token.clone(),
        start.clone(),
        descriptor.auto_start(),
        descriptor.id
      )))
    };

    Self { file_id: descriptor.id, shared, phase_rx, start, token, coordinator, task }
  }

  pub fn file_id(&self) -> FileId {
    self.file_id
  }

  pub fn phase(&self) -> MediaPhase {
    self.phase_rx.borrow().clone()
  }

  pub fn phases(&self) -> watch::Receiver<MediaPhase> {
    self.phase_rx.clone()
  }

  /// Starts a download that was held back by the auto-start policy.
  pub fn start(&self) {
    self.start.notify_one();
  }

  /// Waits until the item is ready or has failed.
  pub async fn settled(&self) -> MediaPhase {
    let mut rx = self.phase_rx.clone();
    let waited = rx
      .wait_for(|p| matches!(p, MediaPhase::Ready { .. } | MediaPhase::Failed { .. }))
      .await
      .map(|phase| phase.clone());
    waited.unwrap_or_else(|_| self.phase())
  }

  /// Unmount: stops listening and cancels the download this item owns. A download started by
  /// another item for the same file keeps running.
  pub async fn close(mut self) {
    self.token.cancel();
    let owned = *self.shared.owned.lock();
    if let (Some(generation), false) = (owned, self.shared.is_committed()) {
      self.coordinator.cancel_owned(self.file_id, generation).await;
    }
    if let Some(task) = self.task.take() {
      if let Err(e) = task.await {
        tracing::warn!(event = "media_watch_join_failed", file_id = self.file_id, error = %e, "media task ended abnormally");
      }
    }
  }
}

impl Drop for MediaWatch {
  fn drop(&mut self) {
    self.token.cancel();
  }
}

async fn drive(
  shared: Arc<Shared>,
  coordinator: Arc<DownloadCoordinator>,
  mut updates: broadcast::Receiver<Raw>,
  token: CancellationToken,
  start: Arc<Notify>,
  auto_start: bool,
  file_id: FileId
) {
  if !auto_start {
    tokio::select! {
      _ = token.cancelled() => return,
      _ = start.notified() => {}
    }
  }

  shared.update(|t| t.begin());
  let claim = coordinator.claim(file_id, &token);
  *shared.owned.lock() = claim.as_ref().map(|c| c.generation());
  let sink = shared.clone();
  let download = async {
    match claim {
      Some(claim) => coordinator.download(claim, move |uri| sink.update(|t| t.commit(uri))).await,
      None => DownloadOutcome::Duplicate
    }
  };
  tokio::pin!(download);

  let mut download_done = false;
  let mut updates_open = true;
  while !shared.is_committed() {
    if download_done && !updates_open {
      break;
    }
    tokio::select! {
      _ = token.cancelled() => break,
      outcome = &mut download, if !download_done => {
        download_done = true;
        match outcome {
          DownloadOutcome::Failed { reason } => shared.update(move |t| t.fail(reason)),
          DownloadOutcome::Cancelled => shared.update(|t| t.reset()),
          DownloadOutcome::Completed { .. } | DownloadOutcome::Pending { .. } | DownloadOutcome::Duplicate => {}
        }
      }
      received = updates.recv(), if updates_open => match received {
        Ok(raw) => match classify(&raw) {
          Ok(LiveUpdate::File(progress)) => shared.update(|t| t.apply(&progress)),
          Ok(_) => {}
          Err(e) => tracing::debug!(event = "media_watch_bad_update", file_id = file_id, error = %e, "undecodable update")
        },
        Err(RecvError::Lagged(skipped)) => {
          tracing::warn!(event = "media_watch_lagged", file_id = file_id, skipped = skipped, "update stream lagged")
        }
        Err(RecvError::Closed) => updates_open = false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  use serde_json::json;

  use crate::media::coordinator::DownloadPolicy;
  use crate::media::progress::{MediaKind, START_THRESHOLD_BYTES};
  use crate::telegram::{MockTelegram, RemoteContentService};

  fn video(id: FileId, size: i64) -> FileDescriptor {
    FileDescriptor {
      id,
      kind: MediaKind::Video,
      remote_id: Some(format!("remote-{id}")),
      size,
      duration: 30,
      local_path: None,
      downloaded: false,
      sizes: Vec::new(),
      minithumbnail: None
    }
  }

  fn file_update(id: FileId, downloaded: i64, completed: bool) -> serde_json::Value {
    json!({
      "@type": "updateFile",
      "file": {
        "id": id,
        "size": 8 * 1024 * 1024,
        "local": { "path": "/tmp/v.mp4", "downloaded_size": downloaded, "is_downloading_completed": completed }
      }
    })
  }

  fn setup(mock: MockTelegram) -> (Arc<MockTelegram>, Arc<DownloadCoordinator>) {
    let mock = Arc::new(mock);
    let coordinator = Arc::new(DownloadCoordinator::new(mock.clone(), DownloadPolicy::default()));
    (mock, coordinator)
  }

  async fn wait_for_phase(w: &MediaWatch, f: impl Fn(&MediaPhase) -> bool) -> MediaPhase {
    let mut rx = w.phases();
    let waited = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|p| f(p)))
      .await
      .expect("phase timeout")
      .map(|phase| phase.clone());
    waited.expect("watch closed")
  }

  #[tokio::test]
  async fn video_becomes_ready_from_push_after_threshold() {
    let (mock, coordinator) = setup(MockTelegram::new());
    let w = MediaWatch::spawn(coordinator, mock.subscribe_updates(), &video(21, 1024 * 1024));
    wait_for_phase(&w, |p| matches!(p, MediaPhase::Downloading { .. })).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    mock.push_update(file_update(21, 100 * 1024, false));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!w.phase().is_ready());

    mock.push_update(file_update(21, START_THRESHOLD_BYTES + 10 * 1024, false));
    let ready = wait_for_phase(&w, |p| p.is_ready()).await;
    assert_eq!(ready, MediaPhase::Ready { uri: "file:///tmp/v.mp4".into() });
    assert_eq!(mock.count_calls("download_file:21"), 1);
    w.close().await;
  }

  #[tokio::test]
  async fn already_downloaded_file_is_ready_without_request() {
    let (mock, coordinator) = setup(MockTelegram::new());
    let mut descriptor = video(4, 2048);
    descriptor.local_path = Some("/cache/a.mp4".into());
    descriptor.downloaded = true;

    let w = MediaWatch::spawn(coordinator, mock.subscribe_updates(), &descriptor);
    assert_eq!(w.phase(), MediaPhase::Ready { uri: "file:///cache/a.mp4".into() });
    w.close().await;
    assert!(mock.calls().is_empty());
  }

  #[tokio::test]
  async fn large_video_waits_for_start() {
    let mock = MockTelegram::new().with_file(json!({
      "id": 8, "size": 50_000_000,
      "local": { "path": "/tmp/big.mp4", "is_downloading_completed": true, "downloaded_size": 50_000_000 }
    }));
    let (mock, coordinator) = setup(mock);
    let w = MediaWatch::spawn(coordinator, mock.subscribe_updates(), &video(8, 50_000_000));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(mock.count_calls("download_file"), 0);
    assert_eq!(w.phase(), MediaPhase::Placeholder);

    w.start();
    let ready = wait_for_phase(&w, |p| p.is_ready()).await;
    assert_eq!(ready, MediaPhase::Ready { uri: "file:///tmp/big.mp4".into() });
    w.close().await;
  }

  #[tokio::test]
  async fn close_cancels_pending_download() {
    let (mock, coordinator) = setup(MockTelegram::new());
    let w = MediaWatch::spawn(coordinator.clone(), mock.subscribe_updates(), &video(30, 4096));
    wait_for_phase(&w, |p| matches!(p, MediaPhase::Downloading { .. })).await;

    w.close().await;
    assert_eq!(mock.count_calls("cancel_download_file:30"), 1);
    assert!(!coordinator.is_active(30));
  }

  #[tokio::test]
  async fn closing_a_second_mount_keeps_the_first_download() {
    let (mock, coordinator) = setup(MockTelegram::new().with_held_downloads());
    let first = MediaWatch::spawn(coordinator.clone(), mock.subscribe_updates(), &video(7, 4096));
    wait_for_phase(&first, |p| matches!(p, MediaPhase::Downloading { .. })).await;
    while !coordinator.is_active(7) {
      tokio::task::yield_now().await;
    }

    let second = MediaWatch::spawn(coordinator.clone(), mock.subscribe_updates(), &video(7, 4096));
    wait_for_phase(&second, |p| matches!(p, MediaPhase::Downloading { .. })).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    second.close().await;

    assert!(coordinator.is_active(7));
    assert_eq!(mock.count_calls("download_file:7"), 1);
    assert_eq!(mock.count_calls("cancel_download_file"), 0);

    mock.push_update(file_update(7, 8 * 1024 * 1024, true));
    let ready = wait_for_phase(&first, |p| p.is_ready()).await;
    assert_eq!(ready, MediaPhase::Ready { uri: "file:///tmp/v.mp4".into() });
    first.close().await;
    assert!(!coordinator.is_active(7));
    assert_eq!(mock.count_calls("cancel_download_file"), 0);
  }

  #[tokio::test]
  async fn closing_the_owner_cancels_its_download() {
    let (mock, coordinator) = setup(MockTelegram::new().with_held_downloads());
    let owner = MediaWatch::spawn(coordinator.clone(), mock.subscribe_updates(), &video(11, 4096));
    wait_for_phase(&owner, |p| matches!(p, MediaPhase::Downloading { .. })).await;
    while !coordinator.is_active(11) {
      tokio::task::yield_now().await;
    }

    owner.close().await;
    assert!(!coordinator.is_active(11));
    assert_eq!(mock.count_calls("cancel_download_file:11"), 1);
  }

  #[tokio::test]
  async fn ignores_updates_for_other_files() {
    let (mock, coordinator) = setup(MockTelegram::new());
    let w = MediaWatch::spawn(coordinator, mock.subscribe_updates(), &video(1, 4096));
    wait_for_phase(&w, |p| matches!(p, MediaPhase::Downloading { .. })).await;

    mock.push_update(file_update(2, 1024 * 1024, true));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!w.phase().is_ready());
    w.close().await;
  }
}
