//!
//! Per-identity state machine: `Unknown -> Valid/Expiring/Refreshing
//! -> Invalid -> Provisioning`, with a background loop that refreshes
//! proactively and a device-flow bootstrap path when no access token
//! is available.

use crate::config::ConfigStore;
use crate::error::HelixError;
use crate::events::IdentityEvent;
use crate::helix::{DevicePollOutcome, HelixClient, REQUIRED_SCOPES};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{info, warn};

const BACKGROUND_TICK: Duration = Duration::from_secs(600);
const SAFETY_BUFFER_SECS: i64 = 3600;
const DRIFT_THRESHOLD_SECS: i64 = 60;
const REFRESH_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Unknown,
    Valid,
    Expiring,
    Refreshing,
    Invalid,
    Provisioning,
}

pub struct TokenLifecycle {
    username: String,
    client_id: String,
    client_secret: String,
    helix: Arc<HelixClient>,
    config: Arc<ConfigStore>,
    events: mpsc::Sender<IdentityEvent>,

    state: RwLock<TokenState>,
    access_token: RwLock<String>,
    refresh_token: RwLock<String>,
    expiry: RwLock<Option<DateTime<Utc>>>,
    refresh_mutex: Mutex<()>,
    invalidated: Notify,
    last_tick: RwLock<Instant>,
}

impl TokenLifecycle {
    pub fn new(
        username: String,
        client_id: String,
        client_secret: String,
        access_token: String,
        refresh_token: String,
        expiry: Option<DateTime<Utc>>,
        helix: Arc<HelixClient>,
        config: Arc<ConfigStore>,
        events: mpsc::Sender<IdentityEvent>,
    ) -> Self {
        Self {
            username,
            client_id,
            client_secret,
            helix,
            config,
            events,
            state: RwLock::new(TokenState::Unknown),
            access_token: RwLock::new(access_token),
            refresh_token: RwLock::new(refresh_token),
            expiry: RwLock::new(expiry),
            refresh_mutex: Mutex::new(()),
            invalidated: Notify::new(),
            last_tick: RwLock::new(Instant::now()),
        }
    }

    pub async fn access_token(&self) -> String {
        self.access_token.read().await.clone()
    }

    pub async fn state(&self) -> TokenState {
        *self.state.read().await
    }

    /// Signal consumed by the background loop: "a 401 was observed
    /// elsewhere, please re-check tokens now".
    pub fn notify_token_invalid(&self) {
        self.invalidated.notify_one();
    }

    /// Startup sequence: validate what we have, or provision from
    /// scratch if there's nothing to validate.
    pub async fn startup(&self) -> Result<(), HelixError> {
        let current = self.access_token.read().await.clone();
        if current.is_empty() {
            return self.provision().await;
        }

        match self.helix.validate(&current).await {
            Ok(v) => {
                if !has_required_scopes(&v.scopes) {
                    warn!(username = %self.username, "token missing required scopes at startup");
                    *self.state.write().await = TokenState::Invalid;
                    return self.refresh_or_provision().await;
                }
                *self.expiry.write().await =
                    Some(crate::util::now() + ChronoDuration::seconds(v.expires_in as i64));
                *self.state.write().await = TokenState::Valid;
                Ok(())
            }
            Err(HelixError::TokenInvalid) => {
                *self.state.write().await = TokenState::Invalid;
                self.refresh_or_provision().await
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh_or_provision(&self) -> Result<(), HelixError> {
        match self.refresh().await {
            Ok(()) => Ok(()),
            Err(_) => self.provision().await,
        }
    }

    /// Background loop: runs roughly every 600s and whenever woken by
    /// `notify_token_invalid`. Intended to be spawned once per
    /// identity and run for the supervisor's lifetime.
    pub async fn run(&self) {
        loop {
            let woke_early = tokio::select! {
                _ = tokio::time::sleep(BACKGROUND_TICK) => false,
                _ = self.invalidated.notified() => true,
            };

            let elapsed = {
                let mut last = self.last_tick.write().await;
                let elapsed = last.elapsed();
                *last = Instant::now();
                elapsed
            };
            let safety_buffer = safety_buffer_for(woke_early, elapsed);

            if let Err(e) = self.tick(safety_buffer).await {
                warn!(username = %self.username, error = %e, "token lifecycle tick failed");
            }
        }
    }

    async fn tick(&self, safety_buffer_secs: i64) -> Result<(), HelixError> {
        let expiry = *self.expiry.read().await;
        match expiry {
            Some(exp) => {
                let remaining = (exp - crate::util::now()).num_seconds();
                if remaining < safety_buffer_secs {
                    self.refresh_or_provision().await?;
                }
                Ok(())
            }
            None => {
                let current = self.access_token.read().await.clone();
                match self.helix.validate(&current).await {
                    Ok(v) => {
                        *self.expiry.write().await =
                            Some(crate::util::now() + ChronoDuration::seconds(v.expires_in as i64));
                        *self.state.write().await = TokenState::Valid;
                        Ok(())
                    }
                    Err(HelixError::TokenInvalid) => self.refresh_or_provision().await,
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Refreshes under a per-identity mutex to prevent refresh
    /// stampedes, retrying up to 3 times with exponential backoff. On
    /// success, persists the new tokens and fires
    /// `on_credentials_changed`.
    pub async fn refresh(&self) -> Result<(), HelixError> {
        let _guard = self.refresh_mutex.lock().await;
        *self.state.write().await = TokenState::Refreshing;

        let refresh_token = self.refresh_token.read().await.clone();
        let mut last_err = None;

        for attempt in 0..REFRESH_MAX_ATTEMPTS {
            match self
                .helix
                .refresh(&self.client_id, &self.client_secret, &refresh_token)
                .await
            {
                Ok(tokens) => {
                    let new_access = tokens.access_token.clone();
                    let new_refresh = tokens
                        .refresh_token
                        .clone()
                        .unwrap_or_else(|| refresh_token.clone());
                    let new_expiry = crate::util::now() + ChronoDuration::seconds(tokens.expires_in as i64);

                    *self.access_token.write().await = new_access.clone();
                    *self.refresh_token.write().await = new_refresh.clone();
                    *self.expiry.write().await = Some(new_expiry);
                    *self.state.write().await = TokenState::Valid;

                    let username = self.username.clone();
                    self.config
                        .update_user(&username, move |id| {
                            id.access_token = new_access.clone();
                            id.refresh_token = new_refresh.clone();
                            id.token_expiry = Some(new_expiry);
                        })
                        .await
                        .ok();

                    info!(username = %self.username, "refreshed access token");
                    let access_token = self.access_token.read().await.clone();
                    let _ = self
                        .events
                        .send(IdentityEvent::CredentialsChanged { access_token })
                        .await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(username = %self.username, attempt, error = %e, "refresh attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(500 * 2u64.pow(attempt))).await;
                }
            }
        }

        *self.state.write().await = TokenState::Invalid;
        Err(last_err.unwrap_or(HelixError::RefreshFailed("unknown".into())))
    }

    /// Device Authorization Grant bootstrap.
    pub async fn provision(&self) -> Result<(), HelixError> {
        *self.state.write().await = TokenState::Provisioning;

        let start = self.helix.device_start(&self.client_id, REQUIRED_SCOPES).await?;
        info!(
            username = %self.username,
            verification_uri = %start.verification_uri,
            user_code = %start.user_code,
            "device authorization required: open the verification URL and enter the code"
        );

        let mut interval = Duration::from_secs(start.interval.max(1));
        let deadline = Instant::now() + Duration::from_secs(start.expires_in);

        loop {
            if Instant::now() >= deadline {
                return Err(HelixError::DeviceFailed(
                    crate::error::DeviceFailureKind::ExpiredToken,
                ));
            }
            tokio::time::sleep(interval).await;

            match self
                .helix
                .device_poll(&self.client_id, &self.client_secret, &start.device_code)
                .await
            {
                Ok(DevicePollOutcome::Pending) => continue,
                Ok(DevicePollOutcome::SlowDown) => {
                    interval += Duration::from_secs(5);
                    continue;
                }
                Ok(DevicePollOutcome::Tokens(tokens)) => {
                    let new_access = tokens.access_token;
                    let new_refresh = tokens.refresh_token.unwrap_or_default();
                    let new_expiry = crate::util::now() + ChronoDuration::seconds(tokens.expires_in as i64);

                    *self.access_token.write().await = new_access.clone();
                    *self.refresh_token.write().await = new_refresh.clone();
                    *self.expiry.write().await = Some(new_expiry);
                    *self.state.write().await = TokenState::Valid;

                    let username = self.username.clone();
                    self.config
                        .update_user(&username, move |id| {
                            id.access_token = new_access.clone();
                            id.refresh_token = new_refresh.clone();
                            id.token_expiry = Some(new_expiry);
                        })
                        .await
                        .ok();

                    let access_token = self.access_token.read().await.clone();
                    let _ = self
                        .events
                        .send(IdentityEvent::CredentialsChanged { access_token })
                        .await;
                    info!(username = %self.username, "device flow completed");
                    return Ok(());
                }
                Err(e) => {
                    *self.state.write().await = TokenState::Invalid;
                    return Err(e);
                }
            }
        }
    }
}

/// Drift relative to the expected tick interval: a tick that fires on
/// schedule has `elapsed` close to `BACKGROUND_TICK`, so `drift` is
/// close to zero. Only a real clock/scheduler anomaly (the process was
/// suspended, the tick ran very late) pushes it past the threshold and
/// doubles the safety buffer; an early wake from `notify_token_invalid`
/// is never treated as drift.
fn safety_buffer_for(woke_early: bool, elapsed: Duration) -> i64 {
    let drift = elapsed.saturating_sub(BACKGROUND_TICK);
    if !woke_early && drift.as_secs() as i64 > DRIFT_THRESHOLD_SECS {
        SAFETY_BUFFER_SECS * 2
    } else {
        SAFETY_BUFFER_SECS
    }
}

fn has_required_scopes(granted: &[String]) -> bool {
    REQUIRED_SCOPES
        .iter()
        .all(|required| granted.iter().any(|g| g == required))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_required_scopes_true_when_superset() {
        let granted = vec![
            "user:read:chat".to_string(),
            "user:manage:chat_color".to_string(),
            "chat:read".to_string(),
        ];
        assert!(has_required_scopes(&granted));
    }

    #[test]
    fn has_required_scopes_false_when_missing_one() {
        let granted = vec!["user:read:chat".to_string()];
        assert!(!has_required_scopes(&granted));
    }

    #[test]
    fn safety_buffer_is_unchanged_on_a_normal_tick() {
        assert_eq!(
            safety_buffer_for(false, BACKGROUND_TICK),
            SAFETY_BUFFER_SECS
        );
        assert_eq!(
            safety_buffer_for(false, BACKGROUND_TICK + Duration::from_secs(30)),
            SAFETY_BUFFER_SECS
        );
    }

    #[test]
    fn safety_buffer_doubles_only_on_real_drift() {
        let late = BACKGROUND_TICK + Duration::from_secs(DRIFT_THRESHOLD_SECS as u64 + 1);
        assert_eq!(safety_buffer_for(false, late), SAFETY_BUFFER_SECS * 2);
    }

    #[test]
    fn safety_buffer_ignores_drift_on_an_early_wake() {
        let late = BACKGROUND_TICK + Duration::from_secs(DRIFT_THRESHOLD_SECS as u64 + 1);
        assert_eq!(safety_buffer_for(true, late), SAFETY_BUFFER_SECS);
    }
}
