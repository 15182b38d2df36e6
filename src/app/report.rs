use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::app::prefs::{get_json, set_json, PreferenceStore};
use crate::telegram::MessageId;

const KEY_PREFIX: &str = "reported_message_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
  pub id: MessageId,
  /// Milliseconds since epoch.
  pub at: i64,
  pub reported: bool
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
  Created(ReportRecord),
  AlreadyReported(ReportRecord)
}

pub fn report_key(message_id: MessageId) -> String {
  format!("{KEY_PREFIX}{message_id}")
}

pub async fn find_report(store: &dyn PreferenceStore, message_id: MessageId) -> anyhow::Result<Option<ReportRecord>> {
  get_json(store, &report_key(message_id)).await
}

pub async fn is_reported(store: &dyn PreferenceStore, message_id: MessageId) -> anyhow::Result<bool> {
  Ok(find_report(store, message_id).await?.map(|r| r.reported).unwrap_or(false))
}

/// Records a report once per message. Existing records are never rewritten.
pub async fn submit_report(store: &dyn PreferenceStore, message_id: MessageId) -> anyhow::Result<ReportOutcome> {
  if let Some(existing) = find_report(store, message_id).await? {
    tracing::debug!(event = "report_exists", message_id = message_id, "message already reported");
    return Ok(ReportOutcome::AlreadyReported(existing));
  }

  let record = ReportRecord { id: message_id, at: Utc::now().timestamp_millis(), reported: true };
  set_json(store, &report_key(message_id), &record).await?;
  tracing::info!(event = "report_created", message_id = message_id, "message reported");
  Ok(ReportOutcome::Created(record))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app::prefs::MemoryPrefs;

  #[tokio::test]
  async fn second_submission_returns_first_record() -> anyhow::Result<()> {
    let store = MemoryPrefs::new();
    assert!(!is_reported(&store, 5).await?);

    let first = match submit_report(&store, 5).await? {
      ReportOutcome::Created(r) => r,
      other => panic!("unexpected {other:?}")
    };
    assert_eq!(first.id, 5);
    assert!(first.reported);

    assert_eq!(submit_report(&store, 5).await?, ReportOutcome::AlreadyReported(first));
    assert!(is_reported(&store, 5).await?);
    assert!(store.get_item("reported_message_5").await?.is_some());
    Ok(())
  }
}
