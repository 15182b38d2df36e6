use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde::Serialize;

use corner_lib::app::auth::{self, AuthStep};
use corner_lib::app::channel::{resolve_channel, ChannelRef};
use corner_lib::app::feed::{ensure_backend_user, load_feed_messages};
use corner_lib::app::normalize::{normalize_history, normalize_raw};
use corner_lib::app::prefs::load_teams;
use corner_lib::app::reconcile::{MessageList, ReconcileListener, VISIBLE_POLL_INTERVAL};
use corner_lib::app::report::{submit_report, ReportOutcome};
use corner_lib::media::{MediaPhase, MediaWatch};
use corner_lib::paths::Paths;
use corner_lib::settings::{set_tdlib_path, Settings};
use corner_lib::state::AppState;
use corner_lib::telegram::{payload, ChatId, MessageId};

#[derive(Parser)]
#[command(name = "corner")]
#[command(about = "Corner client core: feeds, channels, media downloads and live updates", long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands
}

#[derive(Subcommand)]
enum Commands {
  /// Show the stored onboarding step
  Status,

  /// Send the phone number and request a login code
  Login {
    phone: String
  },

  /// Submit the login code
  Code {
    code: String
  },

  /// Submit the two-step verification password
  Password {
    password: String
  },

  /// Log out and clear the local auth state
  Logout,

  /// List or pick followed teams
  Teams {
    #[command(subcommand)]
    action: TeamsAction
  },

  /// Load the team feed from the backend and print normalized messages
  Feed {
    /// Team to load; defaults to the first followed team
    team: Option<String>
  },

  /// Resolve a channel by id or username and print its summary and recent history
  Channel {
    reference: String,
    #[arg(short, long, default_value = "20")]
    limit: i32
  },

  /// Follow a channel and print messages as live updates replace them
  Live {
    chat_id: ChatId,
    #[arg(short, long, default_value = "20")]
    limit: i32,
    /// Poll visible messages as well as listening to pushes
    #[arg(long)]
    poll: bool
  },

  /// Download the media of one message and print each display phase
  WatchFile {
    chat_id: ChatId,
    message_id: MessageId,
    /// Give up after this many seconds
    #[arg(long, default_value = "120")]
    timeout: u64
  },

  /// Report a message once
  Report {
    message_id: MessageId
  },

  /// Save or clear the stored libtdjson path
  SetTdlibPath {
    path: Option<String>
  }
}

#[derive(Subcommand)]
enum TeamsAction {
  List,
  Set {
    #[arg(required = true)]
    teams: Vec<String>
  }
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  let _ = dotenvy::dotenv();
  let cli = Cli::parse();

  let paths = Paths::detect()?;
  let _guard = corner_lib::logging::init(Some(paths.logs_dir.as_path()));
  let settings = Settings::from_env();

  let state = AppState::init(paths, settings).await?;
  let result = run(&state, cli.command).await;
  state.shutdown().await;
  result
}

async fn run(state: &AppState, command: Commands) -> Result<()> {
  let tg = state.telegram();
  let prefs = state.prefs();

  match command {
    Commands::Status => {
      let step = auth::load_step(prefs).await?;
      emit(&serde_json::json!({ "status": step }))?;
    }
    Commands::Login { phone } => {
      let step = auth::login(tg.as_ref(), prefs, &phone).await?;
      emit(&serde_json::json!({ "status": step }))?;
    }
    Commands::Code { code } => {
      let step = auth::submit_code(tg.as_ref(), prefs, &code).await?;
      emit(&serde_json::json!({ "status": step }))?;
    }
    Commands::Password { password } => {
      let step = auth::submit_password(tg.as_ref(), prefs, &password).await?;
      emit(&serde_json::json!({ "status": step }))?;
    }
    Commands::Logout => {
      auth::logout(tg.as_ref(), prefs).await?;
      emit(&serde_json::json!({ "status": null }))?;
    }
    Commands::Teams { action: TeamsAction::List } => {
      emit(&load_teams(prefs).await?)?;
    }
    Commands::Teams { action: TeamsAction::Set { teams } } => {
      let saved = auth::complete_team_pick(prefs, &teams).await?;
      emit(&serde_json::json!({ "status": AuthStep::Ready, "teams": saved }))?;
    }
    Commands::Feed { team } => {
      let team = match team {
        Some(t) => t,
        None => load_teams(prefs)
          .await?
          .into_iter()
          .next()
          .ok_or_else(|| anyhow!("no team followed yet; run `corner teams set <team>`"))?
      };
      let client = state.feed_client();
      let uuid = ensure_backend_user(&client, prefs).await?;
      let entries = client.fetch_feed(&team, &uuid).await?;
      for record in load_feed_messages(tg.clone(), &entries).await {
        emit(&record)?;
      }
    }
    Commands::Channel { reference, limit } => {
      let channel = ChannelRef::parse(&reference);
      let summary = resolve_channel(&channel, tg.as_ref()).await;
      emit(&summary)?;
      if let Some(chat_id) = summary.resolved_chat_id {
        let raw = tg.get_chat_history(chat_id, 0, limit).await?;
        for record in normalize_history(&payload::decode(&raw)?) {
          emit(&record)?;
        }
      }
    }
    Commands::Live { chat_id, limit, poll } => live(state, chat_id, limit, poll).await?,
    Commands::WatchFile { chat_id, message_id, timeout } => {
      let raw = tg.get_message(chat_id, message_id).await?;
      let record = normalize_raw(&raw).ok_or_else(|| anyhow!("message {chat_id}/{message_id} could not be read"))?;
      let descriptor = record.media().ok_or_else(|| anyhow!("message {chat_id}/{message_id} carries no media"))?;

      let watch = MediaWatch::spawn(state.downloads(), tg.subscribe_updates(), &descriptor);
      watch.start();
      let mut phases = watch.phases();
      let deadline = tokio::time::sleep(Duration::from_secs(timeout));
      tokio::pin!(deadline);
      loop {
        let phase = phases.borrow_and_update().clone();
        emit(&phase)?;
        if phase.is_ready() || matches!(phase, MediaPhase::Failed { .. }) {
          break;
        }
        tokio::select! {
          changed = phases.changed() => {
            if changed.is_err() {
              break;
            }
          }
          _ = &mut deadline => {
            tracing::warn!(event = "watch_file_timeout", file_id = watch.file_id(), "gave up waiting for the download");
            break;
          }
        }
      }
      watch.close().await;
    }
    Commands::Report { message_id } => match submit_report(prefs, message_id).await? {
      ReportOutcome::Created(r) => emit(&serde_json::json!({ "created": true, "report": r }))?,
      ReportOutcome::AlreadyReported(r) => emit(&serde_json::json!({ "created": false, "report": r }))?
    },
    Commands::SetTdlibPath { path } => {
      set_tdlib_path(prefs, path.as_deref()).await?;
      emit(&serde_json::json!({ "tdlibPath": path }))?;
    }
  }
  Ok(())
}

async fn live(state: &AppState, chat_id: ChatId, limit: i32, poll: bool) -> Result<()> {
  let tg = state.telegram();
  tg.open_chat(chat_id).await?;

  let raw = tg.get_chat_history(chat_id, 0, limit).await?;
  let records = normalize_history(&payload::decode(&raw)?);
  for record in &records {
    emit(record)?;
  }
  let keys = records.iter().map(|r| r.key()).collect::<Vec<_>>();
  let list = Arc::new(Mutex::new(MessageList::new(records)));

  let listener = ReconcileListener::spawn(
    list.clone(),
    tg.subscribe_updates(),
    tg.clone(),
    poll.then_some(VISIBLE_POLL_INTERVAL)
  );
  listener.set_visible(keys);
  let mut revisions = listener.revisions();

  loop {
    tokio::select! {
      changed = revisions.changed() => {
        if changed.is_err() {
          break;
        }
        let snapshot = list.lock().records().to_vec();
        emit(&serde_json::json!({ "revision": *revisions.borrow_and_update(), "messages": snapshot }))?;
      }
      _ = tokio::signal::ctrl_c() => {
        tracing::info!(event = "live_interrupted", chat_id = chat_id, "stopping live view");
        break;
      }
    }
  }

  listener.stop().await;
  if let Err(e) = tg.close_chat(chat_id).await {
    tracing::debug!(event = "live_close_chat_failed", chat_id = chat_id, error = %e, "closeChat failed");
  }
  Ok(())
}
