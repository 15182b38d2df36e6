use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::app::prefs::{
  get_json, save_phone, save_teams, set_json, PreferenceStore, KEY_AUTH_STATUS, KEY_PHONE_NUMBER
};
use crate::telegram::payload::{self, type_name};
use crate::telegram::{RemoteContentService, TgError};

static FLOOD_WAIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"FLOOD_WAIT_(\d+)").expect("valid regex"));
const DEFAULT_FLOOD_WAIT_SECS: u64 = 60;

/// Where the user stands in onboarding, persisted as `{ "status": ... }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStep {
  Verify,
  #[serde(alias = "two-step")]
  TwoStep,
  #[serde(rename = "pick-team")]
  PickTeam,
  #[serde(rename = "ready")]
  Ready
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthStatus {
  status: AuthStep
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationState {
  WaitPhoneNumber,
  WaitCode,
  WaitPassword,
  WaitRegistration,
  Ready,
  Closed,
  Other(String)
}

impl AuthorizationState {
  /// Accepts a TDLib state object, a `data` wrapper around one, and snake_case type names.
  pub fn from_raw(raw: &str) -> Self {
    let Ok(mut v) = payload::decode(raw) else {
      return Self::Other(String::new());
    };
    if let Some(data) = v.get("data").cloned() {
      if let Ok(inner) = payload::unwrap_envelope(data) {
        v = inner;
      }
    }
    let name = type_name(&v).replace('_', "").to_ascii_lowercase();
    match name.as_str() {
      "authorizationstatewaitphonenumber" => Self::WaitPhoneNumber,
      "authorizationstatewaitcode" => Self::WaitCode,
      "authorizationstatewaitpassword" => Self::WaitPassword,
      "authorizationstatewaitregistration" => Self::WaitRegistration,
      "authorizationstateready" => Self::Ready,
      "authorizationstateclosed" | "authorizationstateclosing" => Self::Closed,
      _ if name.contains("password") => Self::WaitPassword,
      _ => Self::Other(type_name(&v).to_string())
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthErrorKind {
  FloodWait { seconds: u64 },
  TooManyRequests,
  PhoneInvalid,
  CodeInvalid,
  CodeExpired,
  PasswordInvalid,
  PasswordRequired,
  ConnectionClosed,
  RegistrationRequired,
  CodeNotReady,
  UnknownState,
  Other
}

impl AuthErrorKind {
  pub fn user_message(&self) -> String {
    match self {
      Self::FloodWait { seconds } => format!("شما بیش از حد تلاش کردید. لطفاً {seconds} ثانیه دیگر صبر کنید."),
      Self::TooManyRequests => "شما بیش از حد درخواست ارسال کرده‌اید. لطفاً مدتی بعد دوباره تلاش کنید.".into(),
      Self::PhoneInvalid => "شماره‌ی وارد شده معتبر نمی‌باشد".into(),
      Self::CodeInvalid => "کد وارد شده اشتباه است".into(),
      Self::CodeExpired => "کد منقضی شده است. لطفاً دوباره شماره را ارسال کنید.".into(),
      Self::PasswordInvalid => "رمز اشتباه است".into(),
      Self::PasswordRequired => "حساب شما رمز دو مرحله‌ای دارد. لطفاً رمز را وارد کنید.".into(),
      Self::ConnectionClosed => "اتصال به تلگرام قطع شد. لطفا دوباره تلاش کنید.".into(),
      Self::RegistrationRequired => "حساب شما نیاز به ثبت نام دارد. لطفا مراحل ثبت نام را انجام دهید.".into(),
      Self::CodeNotReady => "کد هنوز آماده نشده. اگر کد را دریافت نکردید، دوباره شماره را ارسال کنید.".into(),
      Self::UnknownState => {
        "حالت احراز هویت نامشخص است. لطفا دوباره شماره را ارسال کنید یا اپ را ری‌استارت کنید.".into()
      }
      Self::Other => "خطایی در برقراری ارتباط به وجود آمد. لطفاً دوباره تلاش کنید.".into()
    }
  }
}

/// Maps a service error text onto the fixed substring table.
pub fn classify_auth_error(message: &str) -> AuthErrorKind {
  if message.contains("FLOOD_WAIT") {
    let seconds = FLOOD_WAIT_RE
      .captures(message)
      .and_then(|c| c.get(1))
      .and_then(|m| m.as_str().parse().ok())
      .unwrap_or(DEFAULT_FLOOD_WAIT_SECS);
    return AuthErrorKind::FloodWait { seconds };
  }
  if message.contains("Too Many Requests") || message.contains("TooManyRequests") {
    return AuthErrorKind::TooManyRequests;
  }
  if message.contains("PHONE_NUMBER_INVALID") {
    return AuthErrorKind::PhoneInvalid;
  }
  if message.contains("PHONE_CODE_INVALID") {
    return AuthErrorKind::CodeInvalid;
  }
  if message.contains("PHONE_CODE_EXPIRED") {
    return AuthErrorKind::CodeExpired;
  }
  if message.contains("PASSWORD_HASH_INVALID") {
    return AuthErrorKind::PasswordInvalid;
  }
  let upper = message.to_uppercase();
  if upper.contains("PASSWORD") || upper.contains("TWO-STEP") || upper.contains("TWO_STEP") {
    return AuthErrorKind::PasswordRequired;
  }
  AuthErrorKind::Other
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AuthFailure {
  pub kind: AuthErrorKind,
  pub message: String
}

impl AuthFailure {
  pub fn new(kind: AuthErrorKind) -> Self {
    let message = kind.user_message();
    Self { kind, message }
  }

  fn from_tg(e: &TgError) -> Self {
    let text = match e {
      TgError::Remote { message, .. } => message.clone(),
      other => other.to_string()
    };
    Self::new(classify_auth_error(&text))
  }
}

/// `09121234567`, `9121234567` and `+989121234567` all become `+989121234567`.
pub fn normalize_phone(input: &str) -> Option<String> {
  let compact: String = input.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
  if let Some(rest) = compact.strip_prefix('+') {
    let ok = (8..=15).contains(&rest.len()) && rest.chars().all(|c| c.is_ascii_digit());
    return ok.then(|| compact.clone());
  }
  let national = compact.trim_start_matches('0');
  let ok = national.len() == 10 && national.starts_with('9') && national.chars().all(|c| c.is_ascii_digit());
  ok.then(|| format!("+98{national}"))
}

pub async fn load_step(store: &dyn PreferenceStore) -> anyhow::Result<Option<AuthStep>> {
  Ok(get_json::<AuthStatus>(store, KEY_AUTH_STATUS).await?.map(|s| s.status))
}

pub async fn save_step(store: &dyn PreferenceStore, step: AuthStep) -> anyhow::Result<()> {
  set_json(store, KEY_AUTH_STATUS, &AuthStatus { status: step }).await?;
  tracing::info!(event = "auth_step_saved", step = ?step, "auth step saved");
  Ok(())
}

async fn persist(store: &dyn PreferenceStore, step: AuthStep) -> Result<AuthStep, AuthFailure> {
  match save_step(store, step).await {
    Ok(()) => Ok(step),
    Err(e) => {
      tracing::warn!(event = "auth_step_save_failed", error = %e, "failed to persist auth step");
      Ok(step)
    }
  }
}

async fn current_state(tg: &dyn RemoteContentService) -> Result<AuthorizationState, AuthFailure> {
  match tg.authorization_state().await {
    Ok(raw) => Ok(AuthorizationState::from_raw(&raw)),
    Err(e) => {
      tracing::warn!(event = "auth_state_failed", error = %e, "failed to read authorization state");
      Err(AuthFailure::from_tg(&e))
    }
  }
}

/// Sends the phone number. On success the user is asked for the code.
pub async fn login(tg: &dyn RemoteContentService, store: &dyn PreferenceStore, phone: &str) -> Result<AuthStep, AuthFailure> {
  let Some(full) = normalize_phone(phone) else {
    return Err(AuthFailure::new(AuthErrorKind::PhoneInvalid));
  };

  tracing::info!(event = "auth_login_start", "sending phone number");
  if let Err(e) = tg.auth_start(full.clone()).await {
    tracing::warn!(event = "auth_login_failed", error = %e, "phone submission failed");
    return Err(AuthFailure::from_tg(&e));
  }

  match current_state(tg).await? {
    AuthorizationState::Ready => persist(store, AuthStep::PickTeam).await,
    AuthorizationState::WaitPassword => persist(store, AuthStep::TwoStep).await,
    AuthorizationState::Closed => Err(AuthFailure::new(AuthErrorKind::ConnectionClosed)),
    _ => {
      if let Err(e) = save_phone(store, &full).await {
        tracing::warn!(event = "auth_phone_save_failed", error = %e, "failed to persist phone number");
      }
      persist(store, AuthStep::Verify).await
    }
  }
}

/// Submits the login code and routes on the resulting authorization state.
pub async fn submit_code(tg: &dyn RemoteContentService, store: &dyn PreferenceStore, code: &str) -> Result<AuthStep, AuthFailure> {
  if let Err(e) = tg.auth_submit_code(code.trim().to_string()).await {
    let failure = AuthFailure::from_tg(&e);
    tracing::warn!(event = "auth_code_failed", error = %e, kind = ?failure.kind, "code submission failed");
    if failure.kind == AuthErrorKind::PasswordRequired {
      return persist(store, AuthStep::TwoStep).await;
    }
    return Err(failure);
  }

  match current_state(tg).await {
    Ok(AuthorizationState::Ready) => persist(store, AuthStep::PickTeam).await,
    Ok(AuthorizationState::WaitPassword) => persist(store, AuthStep::TwoStep).await,
    Ok(AuthorizationState::WaitRegistration) => Err(AuthFailure::new(AuthErrorKind::RegistrationRequired)),
    Ok(AuthorizationState::WaitCode) => Err(AuthFailure::new(AuthErrorKind::CodeNotReady)),
    Ok(AuthorizationState::Closed) => Err(AuthFailure::new(AuthErrorKind::ConnectionClosed)),
    Ok(_) => Err(AuthFailure::new(AuthErrorKind::UnknownState)),
    Err(failure) if failure.kind == AuthErrorKind::PasswordRequired => persist(store, AuthStep::TwoStep).await,
    Err(failure) => Err(failure)
  }
}

pub async fn submit_password(
  tg: &dyn RemoteContentService,
  store: &dyn PreferenceStore,
  password: &str
) -> Result<AuthStep, AuthFailure> {
  if let Err(e) = tg.auth_submit_password(password.to_string()).await {
    tracing::warn!(event = "auth_password_failed", error = %e, "password submission failed");
    let failure = AuthFailure::from_tg(&e);
    return Err(match failure.kind {
      AuthErrorKind::PasswordRequired | AuthErrorKind::Other => AuthFailure::new(AuthErrorKind::PasswordInvalid),
      _ => failure
    });
  }
  persist(store, AuthStep::PickTeam).await
}

/// Stores the picked teams and finishes onboarding.
pub async fn complete_team_pick(store: &dyn PreferenceStore, teams: &[String]) -> anyhow::Result<Vec<String>> {
  let saved = save_teams(store, teams).await?;
  if saved.is_empty() {
    anyhow::bail!("at least one team must be selected");
  }
  save_step(store, AuthStep::Ready).await?;
  Ok(saved)
}

/// Clears the local auth state even when the service refuses to log out.
pub async fn logout(tg: &dyn RemoteContentService, store: &dyn PreferenceStore) -> anyhow::Result<()> {
  if let Err(e) = tg.logout().await {
    tracing::warn!(event = "auth_logout_failed", error = %e, "service logout failed");
  }
  store.remove_item(KEY_AUTH_STATUS).await?;
  store.remove_item(KEY_PHONE_NUMBER).await?;
  tracing::info!(event = "auth_logged_out", "local auth state cleared");
  Ok(())
}
