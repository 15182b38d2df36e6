use sqlx::Row;
use tempfile::tempdir;

use corner_lib::app::auth::{complete_team_pick, load_step, AuthStep};
use corner_lib::app::prefs::{load_teams, PreferenceStore, SqlitePrefs};
use corner_lib::app::report::{is_reported, submit_report, ReportOutcome};
use corner_lib::db::Db;

#[tokio::test]
async fn migrations_apply_and_preferences_round_trip() -> anyhow::Result<()> {
  let dir = tempdir()?;
  let db_path = dir.path().join("test.sqlite");

  let db = Db::connect(&db_path).await?;
  db.migrate().await?;
  let store = SqlitePrefs::new(db.pool().clone());

  store.set_item("phone-number", "{\"phoneNumber\":\"+989121234567\"}").await?;
  store.set_item("phone-number", "{\"phoneNumber\":\"+989350000000\"}").await?;
  assert_eq!(
    store.get_item("phone-number").await?.as_deref(),
    Some("{\"phoneNumber\":\"+989350000000\"}")
  );

  let row = sqlx::query("SELECT COUNT(*) AS n FROM preferences").fetch_one(db.pool()).await?;
  let n: i64 = row.get("n");
  assert_eq!(n, 1);

  store.remove_item("phone-number").await?;
  assert_eq!(store.get_item("phone-number").await?, None);
  db.close().await;
  Ok(())
}

#[tokio::test]
async fn onboarding_and_reports_survive_reopen() -> anyhow::Result<()> {
  let dir = tempdir()?;
  let db_path = dir.path().join("corner.sqlite");

  {
    let db = Db::connect(&db_path).await?;
    db.migrate().await?;
    let store = SqlitePrefs::new(db.pool().clone());
    let saved = complete_team_pick(&store, &["persepolis".into(), " esteghlal ".into(), "persepolis".into()]).await?;
    assert_eq!(saved, vec!["persepolis".to_string(), "esteghlal".to_string()]);
    assert!(matches!(submit_report(&store, 42).await?, ReportOutcome::Created(_)));
    db.close().await;
  }

  let db = Db::connect(&db_path).await?;
  db.migrate().await?;
  let store = SqlitePrefs::new(db.pool().clone());
  assert_eq!(load_step(&store).await?, Some(AuthStep::Ready));
  assert_eq!(load_teams(&store).await?, vec!["persepolis".to_string(), "esteghlal".to_string()]);
  assert!(is_reported(&store, 42).await?);
  assert!(matches!(submit_report(&store, 42).await?, ReportOutcome::AlreadyReported(_)));
  db.close().await;
  Ok(())
}
