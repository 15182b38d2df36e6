use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::media::progress::FileProgress;
use crate::telegram::{payload, FileId, RemoteContentService, TgError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadPolicy {
  /// Upper bound for a single `downloadFile` call.
  pub timeout: Duration,
  pub max_attempts: u32,
  pub backoff: Duration
}

impl Default for DownloadPolicy {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(30),
      max_attempts: 3,
      backoff: Duration::from_millis(500)
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DownloadOutcome {
  /// The file is on disk; the completion callback received this uri.
  Completed { uri: String },
  /// The service accepted the request but has not finished. Completion arrives as `updateFile`.
  Pending { downloaded: i64 },
  /// Another request for the same file is in flight; nothing was sent.
  Duplicate,
  Cancelled,
  Failed { reason: String }
}

struct InFlight {
  generation: u64,
  token: CancellationToken
}

#[derive(Default)]
struct Ledger {
  in_flight: HashMap<FileId, InFlight>,
  /// Generation of the most recent claim per file, kept after the entry is released.
  latest: HashMap<FileId, u64>
}

/// Exclusive right to issue the download for one file id.
#[derive(Debug)]
pub(crate) struct DownloadClaim {
  file_id: FileId,
  generation: u64,
  token: CancellationToken
}

impl DownloadClaim {
  pub(crate) fn generation(&self) -> u64 {
    self.generation
  }
}

/// Issues at most one download request per file id at a time.
///
/// The in-flight map is a mutex flag, not a queue: a second `request` for an id that is still
/// running returns [`DownloadOutcome::Duplicate`] without touching the service. Entries are
/// removed on every exit path, including the request future being dropped.
pub struct DownloadCoordinator {
  tg: Arc<dyn RemoteContentService>,
  policy: DownloadPolicy,
  ledger: Mutex<Ledger>,
  next_generation: AtomicU64
}

impl DownloadCoordinator {
  pub fn new(tg: Arc<dyn RemoteContentService>, policy: DownloadPolicy) -> Self {
    Self {
      tg,
      policy,
      ledger: Mutex::new(Ledger::default()),
      next_generation: AtomicU64::new(1)
    }
  }

  pub fn policy(&self) -> DownloadPolicy {
    self.policy
  }

  pub fn is_active(&self, file_id: FileId) -> bool {
    self.ledger.lock().in_flight.contains_key(&file_id)
  }

  pub fn active_count(&self) -> usize {
    self.ledger.lock().in_flight.len()
  }

  pub async fn request<F>(&self, file_id: FileId, on_complete: F) -> DownloadOutcome
  where
    F: FnOnce(String) + Send
  {
    self.request_with_token(file_id, &CancellationToken::new(), on_complete).await
  }

  /// Like [`request`](Self::request), bound to the caller's lifetime token. Once `parent` is
  /// cancelled the result is discarded and `on_complete` is never called.
  pub async fn request_with_token<F>(&self, file_id: FileId, parent: &CancellationToken, on_complete: F) -> DownloadOutcome
  where
    F: FnOnce(String) + Send
  {
    match self.claim(file_id, parent) {
      Some(claim) => self.download(claim, on_complete).await,
      None => DownloadOutcome::Duplicate
    }
  }

  /// Takes the in-flight slot for `file_id`, or `None` when another request holds it. The claim
  /// token is a child of `parent`.
  pub(crate) fn claim(&self, file_id: FileId, parent: &CancellationToken) -> Option<DownloadClaim> {
    let mut ledger = self.ledger.lock();
    if ledger.in_flight.contains_key(&file_id) {
      tracing::debug!(event = "media_download_duplicate", file_id = file_id, "download already in flight");
      return None;
    }
    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
    let token = parent.child_token();
    ledger.in_flight.insert(file_id, InFlight { generation, token: token.clone() });
    ledger.latest.insert(file_id, generation);
    Some(DownloadClaim { file_id, generation, token })
  }

  /// Runs a claimed download. The slot is released when this returns or is dropped, so every
  /// claim must end up here.
  pub(crate) async fn download<F>(&self, claim: DownloadClaim, on_complete: F) -> DownloadOutcome
  where
    F: FnOnce(String) + Send
  {
    let DownloadClaim { file_id, generation, token } = claim;
    let _cleanup = scopeguard::guard((), |_| self.finish(file_id, generation));

    tracing::debug!(event = "media_download_start", file_id = file_id, generation = generation, "requesting file");
    let outcome = self.run(file_id, &token).await;

    match &outcome {
      DownloadOutcome::Completed { uri } => {
        if token.is_cancelled() {
          return DownloadOutcome::Cancelled;
        }
        tracing::debug!(event = "media_download_done", file_id = file_id, uri = %uri, "file ready");
        on_complete(uri.clone());
      }
      DownloadOutcome::Failed { reason } => {
        tracing::warn!(event = "media_download_failed", file_id = file_id, error = %reason, "download failed");
      }
      _ => {}
    }
    outcome
  }

  /// Best-effort cancel. Safe to call when nothing is in flight.
  pub async fn cancel(&self, file_id: FileId) {
    let entry = self.ledger.lock().in_flight.remove(&file_id);
    if let Some(entry) = entry {
      entry.token.cancel();
      tracing::debug!(event = "media_download_cancel", file_id = file_id, generation = entry.generation, "download cancelled");
    }
    self.cancel_remote(file_id).await;
  }

  /// Cancels only the download started under `generation`. Does nothing once a later claim for
  /// the same file exists, so a holder of a stale or duplicate request cannot stop another one.
  pub async fn cancel_owned(&self, file_id: FileId, generation: u64) {
    let owned = {
      let mut ledger = self.ledger.lock();
      match ledger.in_flight.get(&file_id).map(|e| e.generation) {
        Some(current) if current == generation => {
          if let Some(entry) = ledger.in_flight.remove(&file_id) {
            entry.token.cancel();
          }
          true
        }
        Some(_) => false,
        None => ledger.latest.get(&file_id) == Some(&generation)
      }
    };
    if !owned {
      tracing::debug!(event = "media_download_cancel_skipped", file_id = file_id, generation = generation, "download owned elsewhere");
      return;
    }
    tracing::debug!(event = "media_download_cancel", file_id = file_id, generation = generation, "download cancelled");
    self.cancel_remote(file_id).await;
  }

  async fn cancel_remote(&self, file_id: FileId) {
    if let Err(e) = self.tg.cancel_download_file(file_id).await {
      tracing::debug!(event = "media_download_cancel_failed", file_id = file_id, error = %e, "service cancel failed");
    }
  }

  fn finish(&self, file_id: FileId, generation: u64) {
    let mut ledger = self.ledger.lock();
    if ledger.in_flight.get(&file_id).map(|e| e.generation) == Some(generation) {
      ledger.in_flight.remove(&file_id);
    }
  }

  async fn run(&self, file_id: FileId, token: &CancellationToken) -> DownloadOutcome {
    let attempts = self.policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
      let call = tokio::time::timeout(self.policy.timeout, self.tg.download_file(file_id));
      let result = tokio::select! {
        _ = token.cancelled() => return DownloadOutcome::Cancelled,
        r = call => r.unwrap_or(Err(TgError::Timeout))
      };

      match result {
        Ok(raw) => return interpret_response(&raw),
        Err(e) if e.is_transient() && attempt < attempts => {
          tracing::warn!(
            event = "media_download_retry",
            file_id = file_id,
            attempt = attempt,
            error = %e,
            "transient download failure, retrying"
          );
          last_error = e.to_string();
          tokio::select! {
            _ = token.cancelled() => return DownloadOutcome::Cancelled,
            _ = tokio::time::sleep(self.policy.backoff * attempt) => {}
          }
        }
        Err(e) => return DownloadOutcome::Failed { reason: e.to_string() }
      }
    }

    DownloadOutcome::Failed { reason: last_error }
  }
}

fn interpret_response(raw: &str) -> DownloadOutcome {
  let value = match payload::decode(raw) {
    Ok(v) => v,
    Err(e) => return DownloadOutcome::Failed { reason: e.to_string() }
  };
  // some bindings wrap the file object as `{ file: {...} }`
  let file = value.get("file").filter(|f| f.is_object()).unwrap_or(&value);
  let state = FileProgress::from_file(file);
  match state.uri() {
    Some(uri) if state.completed => DownloadOutcome::Completed { uri },
    _ => DownloadOutcome::Pending { downloaded: state.downloaded }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;

  use serde_json::json;
  use tokio::sync::{broadcast, Notify};

  use crate::telegram::{ChatId, MessageId, Raw, UserId};

  #[derive(Default)]
  struct ScriptedState {
    download_calls: Vec<FileId>,
    cancel_calls: Vec<FileId>,
    answers: VecDeque<Result<Raw, TgError>>
  }

  #[derive(Clone, Default)]
  struct ScriptedTelegram {
    state: Arc<Mutex<ScriptedState>>,
    gate: Option<Arc<Notify>>,
    hang: bool
  }

  impl ScriptedTelegram {
    fn answering(answers: Vec<Result<Raw, TgError>>) -> Self {
      let mock = Self::default();
      mock.state.lock().answers = answers.into();
      mock
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
      self.gate = Some(gate);
      self
    }

    fn hanging(mut self) -> Self {
      self.hang = true;
      self
    }

    fn download_calls(&self) -> Vec<FileId> {
      self.state.lock().download_calls.clone()
    }
  }

  #[async_trait::async_trait]
  impl RemoteContentService for ScriptedTelegram {
    async fn auth_start(&self, _phone: String) -> Result<(), TgError> { Ok(()) }
    async fn auth_submit_code(&self, _code: String) -> Result<(), TgError> { Ok(()) }
    async fn auth_submit_password(&self, _password: String) -> Result<(), TgError> { Ok(()) }
    async fn authorization_state(&self) -> Result<Raw, TgError> { Err(TgError::NotImplemented) }
    async fn logout(&self) -> Result<(), TgError> { Ok(()) }
    async fn get_profile(&self) -> Result<Raw, TgError> { Err(TgError::NotImplemented) }
    async fn get_user_profile_photos(&self, _user_id: UserId, _offset: i32, _limit: i32) -> Result<Raw, TgError> {
      Err(TgError::NotImplemented)
    }
    async fn get_chat(&self, _chat_id: ChatId) -> Result<Raw, TgError> { Err(TgError::NotImplemented) }
    async fn search_public_chat(&self, _username: String) -> Result<Raw, TgError> { Err(TgError::NotImplemented) }
    async fn open_chat(&self, _chat_id: ChatId) -> Result<(), TgError> { Ok(()) }
    async fn close_chat(&self, _chat_id: ChatId) -> Result<(), TgError> { Ok(()) }
    async fn get_message(&self, _chat_id: ChatId, _message_id: MessageId) -> Result<Raw, TgError> {
      Err(TgError::NotImplemented)
    }
    async fn get_chat_history(&self, _chat_id: ChatId, _from: MessageId, _limit: i32) -> Result<Raw, TgError> {
      Err(TgError::NotImplemented)
    }
    async fn get_message_thread(&self, _chat_id: ChatId, _message_id: MessageId) -> Result<Raw, TgError> {
      Err(TgError::NotImplemented)
    }
    async fn get_message_thread_history(&self, _c: ChatId, _m: MessageId, _f: MessageId, _l: i32) -> Result<Raw, TgError> {
      Err(TgError::NotImplemented)
    }
    async fn view_messages(&self, _chat_id: ChatId, _ids: Vec<MessageId>) -> Result<(), TgError> { Ok(()) }

    async fn download_file(&self, file_id: FileId) -> Result<Raw, TgError> {
      self.state.lock().download_calls.push(file_id);
      if let Some(gate) = &self.gate {
        gate.notified().await;
      }
      if self.hang {
        std::future::pending::<()>().await;
      }
      self
        .state
        .lock()
        .answers
        .pop_front()
        .unwrap_or_else(|| Err(TgError::Other("no scripted answer".into())))
    }

    async fn cancel_download_file(&self, file_id: FileId) -> Result<(), TgError> {
      self.state.lock().cancel_calls.push(file_id);
      Ok(())
    }

    fn subscribe_updates(&self) -> broadcast::Receiver<Raw> {
      broadcast::channel(1).1
    }
  }

  fn completed(path: &str) -> Result<Raw, TgError> {
    Ok(json!({ "@type": "file", "id": 1, "local": { "path": path, "is_downloading_completed": true } }).to_string())
  }

  fn fast_policy() -> DownloadPolicy {
    DownloadPolicy { timeout: Duration::from_millis(50), max_attempts: 3, backoff: Duration::from_millis(1) }
  }

  #[tokio::test]
  async fn concurrent_requests_for_one_file_issue_one_call() {
    let gate = Arc::new(Notify::new());
    let tg = ScriptedTelegram::answering(vec![completed("/files/a.jpg")]).gated(gate.clone());
    let coordinator = DownloadCoordinator::new(Arc::new(tg.clone()), DownloadPolicy::default());

    let first = coordinator.request(1, |_| {});
    let second = async {
      let dup = coordinator.request(1, |_| panic!("duplicate must not complete"));
      let out = dup.await;
      gate.notify_one();
      out
    };
    let (a, b) = tokio::join!(first, second);

    assert_eq!(a, DownloadOutcome::Completed { uri: "file:///files/a.jpg".into() });
    assert_eq!(b, DownloadOutcome::Duplicate);
    assert_eq!(tg.download_calls(), vec![1]);
    assert!(!coordinator.is_active(1));
  }

  #[tokio::test]
  async fn completion_invokes_callback_and_clears_entry() {
    let tg = ScriptedTelegram::answering(vec![Ok(json!({
      "raw": json!({ "local": { "isDownloadingCompleted": true, "path": "file:///already/uri.mp4" } }).to_string()
    }).to_string())]);
    let coordinator = DownloadCoordinator::new(Arc::new(tg), DownloadPolicy::default());

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let out = coordinator.request(4, move |uri| *sink.lock() = Some(uri)).await;

    assert!(matches!(out, DownloadOutcome::Completed { .. }));
    assert_eq!(seen.lock().as_deref(), Some("file:///already/uri.mp4"));
    assert_eq!(coordinator.active_count(), 0);
  }

  #[tokio::test]
  async fn partial_answer_is_pending_without_callback() {
    let tg = ScriptedTelegram::answering(vec![Ok(
      json!({ "local": { "path": "/p", "downloaded_size": 4096, "is_downloading_completed": false } }).to_string()
    )]);
    let coordinator = DownloadCoordinator::new(Arc::new(tg), DownloadPolicy::default());

    let out = coordinator.request(2, |_| panic!("not complete yet")).await;
    assert_eq!(out, DownloadOutcome::Pending { downloaded: 4096 });
    assert!(!coordinator.is_active(2));
  }

  #[tokio::test]
  async fn service_failure_leaves_no_entry() {
    let tg = ScriptedTelegram::answering(vec![Err(TgError::Remote { code: 400, message: "FILE_ID_INVALID".into() })]);
    let coordinator = DownloadCoordinator::new(Arc::new(tg.clone()), fast_policy());

    let out = coordinator.request(3, |_| {}).await;
    assert!(matches!(out, DownloadOutcome::Failed { .. }));
    assert!(!coordinator.is_active(3));
    assert_eq!(tg.download_calls().len(), 1);
  }

  #[tokio::test]
  async fn transient_failures_are_retried_within_bounds() {
    let tg = ScriptedTelegram::answering(vec![Err(TgError::Disconnected), completed("/f.jpg")]);
    let coordinator = DownloadCoordinator::new(Arc::new(tg.clone()), fast_policy());

    let out = coordinator.request(8, |_| {}).await;
    assert_eq!(out, DownloadOutcome::Completed { uri: "file:///f.jpg".into() });
    assert_eq!(tg.download_calls(), vec![8, 8]);
  }

  #[tokio::test]
  async fn hanging_service_times_out_after_max_attempts() {
    let tg = ScriptedTelegram::default().hanging();
    let coordinator = DownloadCoordinator::new(Arc::new(tg.clone()), fast_policy());

    let out = coordinator.request(9, |_| {}).await;
    assert!(matches!(out, DownloadOutcome::Failed { .. }));
    assert_eq!(tg.download_calls().len(), 3);
    assert!(!coordinator.is_active(9));
  }

  #[tokio::test]
  async fn cancel_without_request_is_a_noop() {
    let tg = ScriptedTelegram::default();
    let coordinator = DownloadCoordinator::new(Arc::new(tg.clone()), DownloadPolicy::default());

    coordinator.cancel(77).await;
    assert_eq!(coordinator.active_count(), 0);
    assert_eq!(tg.state.lock().cancel_calls, vec![77]);
  }

  #[tokio::test]
  async fn cancelled_request_never_applies_late_result() {
    let gate = Arc::new(Notify::new());
    let tg = ScriptedTelegram::answering(vec![completed("/late.jpg")]).gated(gate.clone());
    let coordinator = Arc::new(DownloadCoordinator::new(Arc::new(tg), DownloadPolicy::default()));

    let parent = CancellationToken::new();
    let runner = {
      let coordinator = coordinator.clone();
      let parent = parent.clone();
      tokio::spawn(async move {
        coordinator.request_with_token(5, &parent, |_| panic!("late result applied")).await
      })
    };
    while !coordinator.is_active(5) {
      tokio::task::yield_now().await;
    }
    parent.cancel();
    gate.notify_one();

    assert_eq!(runner.await.unwrap(), DownloadOutcome::Cancelled);
    assert!(!coordinator.is_active(5));
  }

  #[tokio::test]
  async fn cancel_owned_only_stops_its_own_generation() {
    let tg = ScriptedTelegram::default().hanging();
    let coordinator = Arc::new(DownloadCoordinator::new(Arc::new(tg.clone()), DownloadPolicy::default()));

    let parent = CancellationToken::new();
    let claim = coordinator.claim(3, &parent).expect("free slot");
    let generation = claim.generation();
    let runner = {
      let coordinator = coordinator.clone();
      tokio::spawn(async move { coordinator.download(claim, |_| {}).await })
    };
    assert!(coordinator.claim(3, &parent).is_none());

    coordinator.cancel_owned(3, generation + 100).await;
    assert!(coordinator.is_active(3));
    assert!(tg.state.lock().cancel_calls.is_empty());

    coordinator.cancel_owned(3, generation).await;
    assert!(!coordinator.is_active(3));
    assert_eq!(tg.state.lock().cancel_calls, vec![3]);
    assert_eq!(runner.await.unwrap(), DownloadOutcome::Cancelled);
  }

  #[tokio::test]
  async fn released_claim_cancels_until_reclaimed() {
    let pending = || Ok(json!({ "local": { "path": "", "downloaded_size": 0 } }).to_string());
    let tg = ScriptedTelegram::answering(vec![pending(), pending()]);
    let coordinator = DownloadCoordinator::new(Arc::new(tg.clone()), DownloadPolicy::default());
    let parent = CancellationToken::new();

    let first = coordinator.claim(6, &parent).expect("free slot");
    let first_generation = first.generation();
    assert!(matches!(coordinator.download(first, |_| {}).await, DownloadOutcome::Pending { .. }));
    coordinator.cancel_owned(6, first_generation).await;
    assert_eq!(tg.state.lock().cancel_calls, vec![6]);

    let second = coordinator.claim(6, &parent).expect("free slot");
    assert!(matches!(coordinator.download(second, |_| {}).await, DownloadOutcome::Pending { .. }));
    coordinator.cancel_owned(6, first_generation).await;
    assert_eq!(tg.state.lock().cancel_calls, vec![6]);
  }

  #[tokio::test]
  async fn dropped_request_future_releases_the_file() {
    let tg = ScriptedTelegram::default().hanging();
    let coordinator = DownloadCoordinator::new(Arc::new(tg), DownloadPolicy::default());

    let fut = coordinator.request(12, |_| {});
    let _ = tokio::time::timeout(Duration::from_millis(10), fut).await;
    assert!(!coordinator.is_active(12));
  }
}
