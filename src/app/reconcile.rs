use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::models::MessageRecord;
use crate::app::normalize::normalize_raw;
use crate::telegram::{ChatId, MessageId, Raw, RemoteContentService};
use crate::updates::{classify, LiveUpdate};

/// Interval at which on-screen messages are re-fetched.
pub const VISIBLE_POLL_INTERVAL: Duration = Duration::from_secs(3);

type Key = (ChatId, MessageId);

/// Ordered messages a screen currently holds.
#[derive(Debug, Clone, Default)]
pub struct MessageList {
  records: Vec<MessageRecord>
}

impl MessageList {
  pub fn new(records: Vec<MessageRecord>) -> Self {
    Self { records }
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn records(&self) -> &[MessageRecord] {
    &self.records
  }

  pub fn position(&self, chat_id: ChatId, message_id: MessageId) -> Option<usize> {
    self.records.iter().position(|r| r.key() == (chat_id, message_id))
  }

  /// Replaces the record at the key's current index. Untracked keys are left alone.
  pub fn replace(&mut self, key: Key, record: MessageRecord) -> Option<usize> {
    let index = self.position(key.0, key.1)?;
    self.records[index] = record;
    Some(index)
  }

  /// Appends a page, skipping keys already held.
  pub fn extend(&mut self, page: Vec<MessageRecord>) -> usize {
    let before = self.records.len();
    for record in page {
      if self.position(record.chat_id, record.id).is_none() {
        self.records.push(record);
      }
    }
    self.records.len() - before
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
  Replaced { index: usize },
  /// The message is not in the list; push updates never insert.
  NotTracked,
  /// The update does not concern a message.
  Ignored,
  FetchFailed
}

/// Re-fetches the message an update points at and swaps it in. The update itself is only a
/// trigger; its payload is never used as content.
pub async fn reconcile_update(
  list: &Mutex<MessageList>,
  update: &LiveUpdate,
  tg: &dyn RemoteContentService
) -> ReconcileOutcome {
  let Some((chat_id, message_id)) = update.message_key() else {
    return ReconcileOutcome::Ignored;
  };
  if list.lock().position(chat_id, message_id).is_none() {
    tracing::debug!(event = "reconcile_not_tracked", chat_id = chat_id, message_id = message_id, "update for message not held");
    return ReconcileOutcome::NotTracked;
  }
  refetch(list, (chat_id, message_id), tg).await
}

async fn refetch(list: &Mutex<MessageList>, key: Key, tg: &dyn RemoteContentService) -> ReconcileOutcome {
  let (chat_id, message_id) = key;
  let raw = match tg.get_message(chat_id, message_id).await {
    Ok(raw) => raw,
    Err(e) => {
      tracing::warn!(event = "reconcile_fetch_failed", chat_id = chat_id, message_id = message_id, error = %e, "getMessage failed");
      return ReconcileOutcome::FetchFailed;
    }
  };
  let Some(mut record) = normalize_raw(&raw) else {
    tracing::warn!(event = "reconcile_decode_failed", chat_id = chat_id, message_id = message_id, "message answer undecodable");
    return ReconcileOutcome::FetchFailed;
  };
  if record.id == 0 {
    record.id = message_id;
  }
  if record.chat_id == 0 {
    record.chat_id = chat_id;
  }

  // the list may have changed while the fetch was in flight
  match list.lock().replace(key, record) {
    Some(index) => {
      tracing::debug!(event = "reconcile_replaced", chat_id = chat_id, message_id = message_id, index = index, "message replaced");
      ReconcileOutcome::Replaced { index }
    }
    None => ReconcileOutcome::NotTracked
  }
}

/// Marks the given messages viewed and re-fetches each one that is still held.
pub async fn refresh_visible(list: &Mutex<MessageList>, keys: &[Key], tg: &dyn RemoteContentService) -> Vec<ReconcileOutcome> {
  let mut by_chat: BTreeMap<ChatId, Vec<MessageId>> = BTreeMap::new();
  for (chat_id, message_id) in keys {
    by_chat.entry(*chat_id).or_default().push(*message_id);
  }
  for (chat_id, ids) in by_chat {
    if let Err(e) = tg.view_messages(chat_id, ids).await {
      tracing::debug!(event = "reconcile_view_failed", chat_id = chat_id, error = %e, "viewMessages failed");
    }
  }

  let mut outcomes = Vec::with_capacity(keys.len());
  for key in keys {
    let tracked = list.lock().position(key.0, key.1).is_some();
    outcomes.push(if tracked { refetch(list, *key, tg).await } else { ReconcileOutcome::NotTracked });
  }
  outcomes
}

/// Keeps a [`MessageList`] in step with the push stream, optionally polling the visible keys.
pub struct ReconcileListener {
  visible: Arc<Mutex<Vec<Key>>>,
  revision: watch::Receiver<u64>,
  token: CancellationToken,
  task: Option<JoinHandle<()>>
}

impl ReconcileListener {
  pub fn spawn(
    list: Arc<Mutex<MessageList>>,
    updates: broadcast::Receiver<Raw>,
    tg: Arc<dyn RemoteContentService>,
    poll: Option<Duration>
  ) -> Self {
    let visible = Arc::new(Mutex::new(Vec::new()));
    let (revision_tx, revision) = watch::channel(0u64);
    let token = CancellationToken::new();
    let task = tokio::spawn(listen(list, updates, tg, poll, visible.clone(), revision_tx, token.clone()));
    Self { visible, revision, token, task: Some(task) }
  }

  /// Keys currently on screen; these are polled when polling is enabled.
  pub fn set_visible(&self, keys: Vec<Key>) {
    *self.visible.lock() = keys;
  }

  /// Bumped after every replacement.
  pub fn revisions(&self) -> watch::Receiver<u64> {
    self.revision.clone()
  }

  pub async fn stop(mut self) {
    self.token.cancel();
    if let Some(task) = self.task.take() {
      if let Err(e) = task.await {
        tracing::warn!(event = "reconcile_join_failed", error = %e, "reconcile task ended abnormally");
      }
    }
  }
}

impl Drop for ReconcileListener {
  fn drop(&mut self) {
    self.token.cancel();
  }
}

async fn listen(
  list: Arc<Mutex<MessageList>>,
  mut updates: broadcast::Receiver<Raw>,
  tg: Arc<dyn RemoteContentService>,
  poll: Option<Duration>,
  visible: Arc<Mutex<Vec<Key>>>,
  revision: watch::Sender<u64>,
  token: CancellationToken
) {
  let mut ticker = tokio::time::interval(poll.unwrap_or(VISIBLE_POLL_INTERVAL));
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  let bump = |outcome: &ReconcileOutcome| {
    if matches!(outcome, ReconcileOutcome::Replaced { .. }) {
      revision.send_modify(|r| *r += 1);
    }
  };

  loop {
    tokio::select! {
      _ = token.cancelled() => break,
      _ = ticker.tick(), if poll.is_some() => {
        let keys = visible.lock().clone();
        if !keys.is_empty() {
          for outcome in refresh_visible(&list, &keys, tg.as_ref()).await {
            bump(&outcome);
          }
        }
      }
      received = updates.recv() => match received {
        Ok(raw) => match classify(&raw) {
          Ok(update) => bump(&reconcile_update(&list, &update, tg.as_ref()).await),
          Err(e) => tracing::debug!(event = "reconcile_bad_update", error = %e, "undecodable update")
        },
        Err(RecvError::Lagged(skipped)) => {
          tracing::warn!(event = "reconcile_lagged", skipped = skipped, "update stream lagged")
        }
        Err(RecvError::Closed) => break
      }
    }
  }
  tracing::debug!(event = "reconcile_stopped", "reconcile listener stopped");
}
