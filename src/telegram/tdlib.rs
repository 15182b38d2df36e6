use std::{
  collections::HashMap,
  ffi::{CStr, CString},
  os::raw::{c_char, c_double, c_int, c_void},
  path::{Path, PathBuf},
  sync::{mpsc, Arc},
  time::Duration
};

use libloading::Library;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};

use crate::paths::Paths;
use crate::settings::Settings;
use crate::updates::UpdateHub;
use super::{payload, ChatId, FileId, MessageId, Raw, RemoteContentService, TgError, UserId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_PRIORITY: i32 = 1;

#[derive(Clone)]
struct TdlibConfig {
  api_id: i32,
  api_hash: String,
  db_dir: PathBuf,
  files_dir: PathBuf
}

impl TdlibConfig {
  fn from_settings(paths: &Paths, settings: &Settings) -> anyhow::Result<Self> {
    let tg = settings
      .tg
      .clone()
      .ok_or_else(|| anyhow::anyhow!("CORNER_API_ID and CORNER_API_HASH must be set for TDLib"))?;
    let db_dir = paths.tdlib_db_dir();
    let files_dir = paths.tdlib_files_dir();
    std::fs::create_dir_all(&db_dir)?;
    std::fs::create_dir_all(&files_dir)?;

    Ok(Self { api_id: tg.api_id, api_hash: tg.api_hash, db_dir, files_dir })
  }
}

struct TdlibClient {
  _lib: Library,
  client: *mut c_void,
  send: unsafe extern "C" fn(*mut c_void, *const c_char),
  receive: unsafe extern "C" fn(*mut c_void, c_double) -> *const c_char,
  destroy: unsafe extern "C" fn(*mut c_void),
  set_log_verbosity: Option<unsafe extern "C" fn(c_int)>
}

// Only the worker thread touches the client after construction.
unsafe impl Send for TdlibClient {}

impl TdlibClient {
  fn load(path: &Path) -> anyhow::Result<Self> {
    unsafe {
      let lib = Library::new(path)?;
      let create = *lib.get::<unsafe extern "C" fn() -> *mut c_void>(b"td_json_client_create")?;
      let send = *lib.get::<unsafe extern "C" fn(*mut c_void, *const c_char)>(b"td_json_client_send")?;
      let receive = *lib.get::<unsafe extern "C" fn(*mut c_void, c_double) -> *const c_char>(b"td_json_client_receive")?;
      let destroy = *lib.get::<unsafe extern "C" fn(*mut c_void)>(b"td_json_client_destroy")?;

      let set_log_verbosity = lib.get::<unsafe extern "C" fn(c_int)>(b"td_set_log_verbosity_level").ok().map(|f| *f);

      let client = create();
      if client.is_null() {
        return Err(anyhow::anyhow!("td_json_client_create returned null"));
      }

      Ok(Self { _lib: lib, client, send, receive, destroy, set_log_verbosity })
    }
  }

  fn send(&self, query: &str) -> Result<(), TgError> {
    let c = CString::new(query).map_err(|_| TgError::Payload("query contains a NUL byte".into()))?;
    unsafe { (self.send)(self.client, c.as_ptr()); }
    Ok(())
  }

  fn receive(&self, timeout: f64) -> Option<String> {
    let ptr = unsafe { (self.receive)(self.client, timeout) };
    if ptr.is_null() { return None; }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().to_string())
  }

  fn set_verbosity(&self, level: i32) {
    if let Some(f) = self.set_log_verbosity {
      unsafe { f(level); }
    }
  }

  fn destroy(self) {
    unsafe { (self.destroy)(self.client); }
  }
}

type Responder = oneshot::Sender<Result<Value, TgError>>;

enum TdlibCommand {
  Request { payload: Value, respond_to: Responder }
}

/// Remote content service backed by `libtdjson`, driven from one dedicated thread.
pub struct TdlibTelegram {
  tx: mpsc::Sender<TdlibCommand>,
  hub: UpdateHub,
  auth_state: Arc<Mutex<Option<Value>>>
}

impl TdlibTelegram {
  pub fn new(paths: &Paths, settings: &Settings) -> anyhow::Result<Self> {
    let config = TdlibConfig::from_settings(paths, settings)?;
    let lib_path = resolve_tdlib_path(paths, settings.tdlib_path.as_deref())
      .ok_or_else(|| anyhow::anyhow!("libtdjson not found; set CORNER_TDLIB_PATH"))?;
    let client = TdlibClient::load(&lib_path)?;
    client.set_verbosity(1);
    tracing::info!(event = "tdlib_loaded", path = %lib_path.display(), "TDLib loaded");

    let (tx, rx) = mpsc::channel::<TdlibCommand>();
    let hub = UpdateHub::new();
    let auth_state = Arc::new(Mutex::new(None));

    let hub_for_thread = hub.clone();
    let auth_for_thread = auth_state.clone();
    std::thread::Builder::new().name("tdlib".into()).spawn(move || {
      run_client(client, config, rx, hub_for_thread, auth_for_thread);
    })?;

    Ok(Self { tx, hub, auth_state })
  }

  fn send_detached(&self, payload: Value) -> Result<oneshot::Receiver<Result<Value, TgError>>, TgError> {
    let (tx, rx) = oneshot::channel();
    self
      .tx
      .send(TdlibCommand::Request { payload, respond_to: tx })
      .map_err(|_| TgError::Disconnected)?;
    Ok(rx)
  }

  async fn request(&self, payload: Value, timeout: Duration) -> Result<Value, TgError> {
    let kind = payload::type_name(&payload).to_string();
    let rx = self.send_detached(payload)?;

    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(res)) => res,
      Ok(Err(_)) => Err(TgError::Disconnected),
      Err(_) => {
        tracing::warn!(event = "tdlib_request_timeout", request = %kind, "TDLib did not answer in time");
        Err(TgError::Timeout)
      }
    }
  }

  async fn request_raw(&self, payload: Value) -> Result<Raw, TgError> {
    Ok(self.request(payload, REQUEST_TIMEOUT).await?.to_string())
  }

  async fn request_ok(&self, payload: Value) -> Result<(), TgError> {
    self.request(payload, REQUEST_TIMEOUT).await.map(|_| ())
  }

  async fn ensure_authorized(&self) -> Result<(), TgError> {
    let cached = self.auth_state.lock().as_ref().map(|s| payload::type_name(s).to_string());
    let kind = match cached {
      Some(kind) => kind,
      None => {
        let state = self.request(json!({"@type":"getAuthorizationState"}), Duration::from_secs(10)).await?;
        payload::type_name(&state).to_string()
      }
    };
    if kind != "authorizationStateReady" {
      return Err(TgError::AuthRequired);
    }
    Ok(())
  }
}

#[async_trait::async_trait]
impl RemoteContentService for TdlibTelegram {
  async fn auth_start(&self, phone: String) -> Result<(), TgError> {
    let payload = json!({
      "@type": "setAuthenticationPhoneNumber",
      "phone_number": phone,
      "settings": {
        "allow_flash_call": false,
        "is_current_phone_number": false,
        "allow_sms_retriever_api": false
      }
    });
    self.request(payload, AUTH_TIMEOUT).await.map(|_| ())
  }

  async fn auth_submit_code(&self, code: String) -> Result<(), TgError> {
    self.request(json!({"@type":"checkAuthenticationCode","code":code}), AUTH_TIMEOUT).await.map(|_| ())
  }

  async fn auth_submit_password(&self, password: String) -> Result<(), TgError> {
    self
      .request(json!({"@type":"checkAuthenticationPassword","password":password}), AUTH_TIMEOUT)
      .await
      .map(|_| ())
  }

  async fn authorization_state(&self) -> Result<Raw, TgError> {
    self.request_raw(json!({"@type":"getAuthorizationState"})).await
  }

  async fn logout(&self) -> Result<(), TgError> {
    self.request(json!({"@type":"logOut"}), AUTH_TIMEOUT).await.map(|_| ())
  }

  async fn get_profile(&self) -> Result<Raw, TgError> {
    self.ensure_authorized().await?;
    self.request_raw(json!({"@type":"getMe"})).await
  }

  async fn get_user_profile_photos(&self, user_id: UserId, offset: i32, limit: i32) -> Result<Raw, TgError> {
    self.ensure_authorized().await?;
    self
      .request_raw(json!({"@type":"getUserProfilePhotos","user_id":user_id,"offset":offset,"limit":limit}))
      .await
  }

  async fn get_chat(&self, chat_id: ChatId) -> Result<Raw, TgError> {
    self.ensure_authorized().await?;
    self.request_raw(json!({"@type":"getChat","chat_id":chat_id})).await
  }

  async fn search_public_chat(&self, username: String) -> Result<Raw, TgError> {
    self.ensure_authorized().await?;
    self.request_raw(json!({"@type":"searchPublicChat","username":username})).await
  }

  async fn open_chat(&self, chat_id: ChatId) -> Result<(), TgError> {
    self.ensure_authorized().await?;
    self.request_ok(json!({"@type":"openChat","chat_id":chat_id})).await
  }

  async fn close_chat(&self, chat_id: ChatId) -> Result<(), TgError> {
    self.request_ok(json!({"@type":"closeChat","chat_id":chat_id})).await
  }

  async fn get_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<Raw, TgError> {
    self.ensure_authorized().await?;
    self
      .request_raw(json!({"@type":"getMessage","chat_id":chat_id,"message_id":message_id}))
      .await
  }

  async fn get_chat_history(&self, chat_id: ChatId, from_message_id: MessageId, limit: i32) -> Result<Raw, TgError> {
    self.ensure_authorized().await?;
    self
      .request_raw(json!({
        "@type": "getChatHistory",
        "chat_id": chat_id,
        "from_message_id": from_message_id,
        "offset": 0,
        "limit": limit,
        "only_local": false
      }))
      .await
  }

  async fn get_message_thread(&self, chat_id: ChatId, message_id: MessageId) -> Result<Raw, TgError> {
    self.ensure_authorized().await?;
    self
      .request_raw(json!({"@type":"getMessageThread","chat_id":chat_id,"message_id":message_id}))
      .await
  }

  async fn get_message_thread_history(
    &self,
    chat_id: ChatId,
    message_id: MessageId,
    from_message_id: MessageId,
    limit: i32
  ) -> Result<Raw, TgError> {
    self.ensure_authorized().await?;
    self
      .request_raw(json!({
        "@type": "getMessageThreadHistory",
        "chat_id": chat_id,
        "message_id": message_id,
        "from_message_id": from_message_id,
        "offset": 0,
        "limit": limit
      }))
      .await
  }

  async fn view_messages(&self, chat_id: ChatId, message_ids: Vec<MessageId>) -> Result<(), TgError> {
    self.ensure_authorized().await?;
    self
      .request_ok(json!({
        "@type": "viewMessages",
        "chat_id": chat_id,
        "message_ids": message_ids,
        "force_read": false
      }))
      .await
  }

  async fn download_file(&self, file_id: FileId) -> Result<Raw, TgError> {
    self.ensure_authorized().await?;
    self
      .request_raw(json!({
        "@type": "downloadFile",
        "file_id": file_id,
        "priority": DOWNLOAD_PRIORITY,
        "offset": 0,
        "limit": 0,
        "synchronous": false
      }))
      .await
  }

  async fn cancel_download_file(&self, file_id: FileId) -> Result<(), TgError> {
    self
      .request_ok(json!({"@type":"cancelDownloadFile","file_id":file_id,"only_if_pending":false}))
      .await
  }

  fn subscribe_updates(&self) -> broadcast::Receiver<Raw> {
    self.hub.subscribe()
  }
}

fn run_client(
  client: TdlibClient,
  config: TdlibConfig,
  rx: mpsc::Receiver<TdlibCommand>,
  hub: UpdateHub,
  auth_state: Arc<Mutex<Option<Value>>>
) {
  let mut pending_requests: HashMap<u64, Responder> = HashMap::new();
  let mut next_request_id: u64 = 1;
  let mut params_sent = false;
  let _ = client.send(&json!({"@type":"getAuthorizationState"}).to_string());

  'outer: loop {
    loop {
      match rx.try_recv() {
        Ok(cmd) => handle_command(cmd, &client, &mut pending_requests, &mut next_request_id),
        Err(mpsc::TryRecvError::Empty) => break,
        Err(mpsc::TryRecvError::Disconnected) => break 'outer
      }
    }

    let Some(resp) = client.receive(0.05) else {
      continue;
    };
    let value: Value = match serde_json::from_str(&resp) {
      Ok(v) => v,
      Err(e) => {
        tracing::error!(event = "tdlib_parse_failed", error = %e, "TDLib answered with invalid JSON");
        continue;
      }
    };
    if handle_request_response(&value, &mut pending_requests) {
      continue;
    }

    if let Some(state) = auth_state_of(&value) {
      handle_auth_state(state, &client, &config, &mut params_sent);
      *auth_state.lock() = Some(state.clone());
    } else if payload::type_name(&value) == "error" {
      tracing::warn!(event = "tdlib_error", payload = %resp, "TDLib reported an uncorrelated error");
    }

    hub.publish(resp);
  }

  for (_, tx) in pending_requests.drain() {
    let _ = tx.send(Err(TgError::Disconnected));
  }
  client.destroy();
  tracing::info!(event = "tdlib_stopped", "TDLib client destroyed");
}

fn handle_command(
  cmd: TdlibCommand,
  client: &TdlibClient,
  pending_requests: &mut HashMap<u64, Responder>,
  next_request_id: &mut u64
) {
  match cmd {
    TdlibCommand::Request { payload, respond_to } => {
      let mut request = payload;
      let Some(obj) = request.as_object_mut() else {
        let _ = respond_to.send(Err(TgError::Payload("TDLib request must be an object".into())));
        return;
      };

      let request_id = *next_request_id;
      *next_request_id = next_request_id.wrapping_add(1).max(1);
      obj.insert("@extra".to_string(), json!(request_id));

      match client.send(&request.to_string()) {
        Ok(()) => {
          pending_requests.insert(request_id, respond_to);
        }
        Err(e) => {
          let _ = respond_to.send(Err(e));
        }
      }
    }
  }
}

fn handle_request_response(v: &Value, pending_requests: &mut HashMap<u64, Responder>) -> bool {
  let Some(extra) = v.get("@extra") else {
    return false;
  };
  let id = match extra {
    Value::Number(n) => n.as_u64(),
    Value::String(s) => s.parse::<u64>().ok(),
    _ => None
  };
  let Some(id) = id else {
    return false;
  };
  let Some(tx) = pending_requests.remove(&id) else {
    return false;
  };

  let _ = tx.send(response_result(v));
  true
}

fn response_result(v: &Value) -> Result<Value, TgError> {
  if payload::type_name(v) != "error" {
    return Ok(v.clone());
  }
  let code = v.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
  let message = v
    .get("message")
    .and_then(|m| m.as_str())
    .unwrap_or("unknown error")
    .to_string();
  Err(TgError::Remote { code, message })
}

fn auth_state_of(v: &Value) -> Option<&Value> {
  let t = payload::type_name(v);
  if t == "updateAuthorizationState" {
    return v.get("authorization_state");
  }
  if t.starts_with("authorizationState") {
    return Some(v);
  }
  None
}

fn handle_auth_state(state: &Value, client: &TdlibClient, config: &TdlibConfig, params_sent: &mut bool) {
  let t = payload::type_name(state);
  tracing::debug!(event = "tdlib_auth_state", state = t, "authorization state changed");

  match t {
    "authorizationStateWaitTdlibParameters" => {
      if *params_sent {
        return;
      }
      if let Err(e) = client.send(&build_tdlib_parameters(config)) {
        tracing::error!(event = "tdlib_params_failed", error = %e, "could not send TDLib parameters");
        return;
      }
      *params_sent = true;
    }
    "authorizationStateWaitEncryptionKey" => {
      let _ = client.send(&json!({"@type":"checkDatabaseEncryptionKey","encryption_key":""}).to_string());
    }
    "authorizationStateClosing" | "authorizationStateLoggingOut" | "authorizationStateClosed" => {
      *params_sent = false;
    }
    "authorizationStateWaitRegistration" => {
      tracing::warn!(event = "tdlib_registration_required", "account registration is not supported");
    }
    _ => {}
  }
}

fn resolve_tdlib_path(paths: &Paths, configured: Option<&Path>) -> Option<PathBuf> {
  if let Some(p) = configured {
    if p.exists() {
      return Some(p.to_path_buf());
    }
    tracing::warn!(event = "tdlib_path_missing", path = %p.display(), "configured TDLib path does not exist");
  }

  let mut candidates = tdlib_platform_candidates(&paths.base_dir);
  candidates.extend(tdlib_platform_candidates(&paths.base_dir.join("tdlib")));
  candidates.extend(tdlib_platform_candidates(&paths.data_dir));
  candidates.into_iter().find(|c| c.exists())
}

fn tdlib_platform_candidates(base: &Path) -> Vec<PathBuf> {
  #[cfg(target_os = "windows")]
  let names = ["tdjson.dll"];

  #[cfg(target_os = "macos")]
  let names = ["libtdjson.dylib"];

  #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
  let names = ["libtdjson.so", "libtdjson.so.1"];

  names.iter().map(|name| base.join(name)).collect()
}

fn build_tdlib_parameters(config: &TdlibConfig) -> String {
  json!({
    "@type": "setTdlibParameters",
    "use_test_dc": false,
    "database_directory": config.db_dir.to_string_lossy(),
    "files_directory": config.files_dir.to_string_lossy(),
    "use_file_database": true,
    "use_chat_info_database": true,
    "use_message_database": true,
    "use_secret_chats": false,
    "api_id": config.api_id,
    "api_hash": config.api_hash.clone(),
    "system_language_code": "fa",
    "device_model": "Corner",
    "system_version": std::env::consts::OS,
    "application_version": env!("CARGO_PKG_VERSION"),
    "enable_storage_optimizer": true,
    "ignore_file_names": false
  })
  .to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn correlated_errors_become_remote_errors() {
    let (tx, mut rx) = oneshot::channel();
    let mut pending = HashMap::new();
    pending.insert(7u64, tx);

    let handled = handle_request_response(
      &json!({"@type":"error","code":400,"message":"MESSAGE_ID_INVALID","@extra":"7"}),
      &mut pending
    );
    assert!(handled);
    assert!(pending.is_empty());
    match rx.try_recv() {
      Ok(Err(TgError::Remote { code, message })) => {
        assert_eq!(code, 400);
        assert_eq!(message, "MESSAGE_ID_INVALID");
      }
      other => panic!("unexpected {other:?}")
    }
  }

  #[test]
  fn updates_without_extra_are_not_consumed() {
    let mut pending: HashMap<u64, Responder> = HashMap::new();
    assert!(!handle_request_response(&json!({"@type":"updateFile","file":{"id":1}}), &mut pending));
    assert!(!handle_request_response(&json!({"@type":"ok","@extra":99}), &mut pending));
  }

  #[test]
  fn auth_state_is_found_in_updates_and_answers() {
    let update = json!({"@type":"updateAuthorizationState","authorization_state":{"@type":"authorizationStateReady"}});
    assert_eq!(auth_state_of(&update).map(payload::type_name), Some("authorizationStateReady"));
    let answer = json!({"@type":"authorizationStateWaitCode"});
    assert_eq!(auth_state_of(&answer).map(payload::type_name), Some("authorizationStateWaitCode"));
    assert!(auth_state_of(&json!({"@type":"updateFile"})).is_none());
  }

  #[test]
  fn configured_path_must_exist() {
    let paths = Paths::from_base(PathBuf::from("/nonexistent/corner"));
    assert_eq!(resolve_tdlib_path(&paths, Some(Path::new("/nonexistent/libtdjson.so"))), None);
  }
}
