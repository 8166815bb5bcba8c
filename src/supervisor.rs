//! Composes the Helix client, Token
//! Lifecycle, WebSocket Session, Subscription Reconciler, Message
//! Router and Color Apply Engine for one identity. Failures inside any
//! subtask restart the whole supervisor with backoff; peers are never
//! affected.

use crate::broadcaster_cache::BroadcasterCache;
use crate::color::{ApplyOutcome, ApplyRequest, ApplyResult, ColorApplyEngine};
use crate::config::ConfigStore;
use crate::events::IdentityEvent;
use crate::helix::HelixClient;
use crate::reconcile::Reconciler;
use crate::router::{ColorArg, RouterAction};
use crate::token::TokenLifecycle;
use crate::util::backoff_with_jitter;
use crate::ws::{WsFrameEvent, WsSession};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

const MAX_CONSECUTIVE_RESTARTS: u32 = 100;
const NORMAL_AUDIT_BASE: Duration = Duration::from_secs(600);
const NORMAL_AUDIT_JITTER_MAX: Duration = Duration::from_secs(120);
const FAST_AUDIT_MIN: Duration = Duration::from_secs(60);
const FAST_AUDIT_MAX: Duration = Duration::from_secs(120);

pub struct SupervisorHandle {
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl SupervisorHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }
}

pub fn spawn(
    username: String,
    config: Arc<ConfigStore>,
    helix: Arc<HelixClient>,
    broadcaster_cache: Arc<BroadcasterCache>,
) -> SupervisorHandle {
    let stop = Arc::new(Notify::new());
    let stopped = Arc::new(AtomicBool::new(false));

    let handle = SupervisorHandle {
        stop: stop.clone(),
        stopped: stopped.clone(),
    };

    tokio::spawn(async move {
        let mut consecutive_restarts = 0u32;
        loop {
            if stopped.load(Ordering::SeqCst) {
                return;
            }

            let outcome = tokio::select! {
                r = run_once(&username, &config, &helix, &broadcaster_cache, &stop, &stopped) => r,
                _ = stop.notified() => RunOutcome::Stopped,
            };

            match outcome {
                RunOutcome::Stopped | RunOutcome::Disabled => return,
                RunOutcome::Crashed(reason) => {
                    consecutive_restarts += 1;
                    warn!(username = %username, reason = %reason, consecutive_restarts, "identity supervisor crashed, restarting");
                    if consecutive_restarts >= MAX_CONSECUTIVE_RESTARTS {
                        error!(username = %username, "exceeded consecutive restart budget, giving up on this identity");
                        return;
                    }
                    let delay = backoff_with_jitter(
                        consecutive_restarts,
                        Duration::from_secs(1),
                        2.0,
                        Duration::from_secs(60),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    });

    handle
}

enum RunOutcome {
    Stopped,
    Disabled,
    Crashed(String),
}

async fn run_once(
    username: &str,
    config: &Arc<ConfigStore>,
    helix: &Arc<HelixClient>,
    broadcaster_cache: &Arc<BroadcasterCache>,
    stop: &Arc<Notify>,
    stopped: &Arc<AtomicBool>,
) -> RunOutcome {
    let list = match config.load().await {
        Ok(l) => l,
        Err(e) => return RunOutcome::Crashed(format!("config load failed: {e}")),
    };
    let Some(identity) = list.into_iter().find(|i| i.username == username) else {
        return RunOutcome::Disabled;
    };

    if identity.needs_provisioning() {
        info!(username, "identity has no access token; device flow provisioning will run at startup");
    }

    let (events_tx, mut events_rx) = mpsc::channel::<IdentityEvent>(32);

    let token_lifecycle = Arc::new(TokenLifecycle::new(
        identity.username.clone(),
        identity.client_id.clone(),
        identity.client_secret.clone(),
        identity.access_token.clone(),
        identity.refresh_token.clone(),
        identity.token_expiry,
        helix.clone(),
        config.clone(),
        events_tx.clone(),
    ));

    if let Err(e) = token_lifecycle.startup().await {
        warn!(username, error = %e, "token lifecycle startup failed");
        config
            .update_user(username, |id| id.enabled = false)
            .await
            .ok();
        return RunOutcome::Disabled;
    }

    let access_token = token_lifecycle.access_token().await;

    let user_id = match &identity.user_id {
        Some(id) => id.clone(),
        None => {
            let resolved = match helix
                .resolve_user(&access_token, &identity.client_id, &[identity.username.clone()])
                .await
            {
                Ok(m) => m,
                Err(e) => return RunOutcome::Crashed(format!("resolve_user failed: {e}")),
            };
            let Some(id) = resolved.get(&identity.username).cloned() else {
                return RunOutcome::Crashed("could not resolve own user_id".into());
            };
            let id_clone = id.clone();
            config
                .update_user(username, move |slot| slot.user_id = Some(id_clone.clone()))
                .await
                .ok();
            id
        }
    };

    let mut last_color = identity.last_color.clone();
    if last_color.is_none() {
        last_color = helix
            .get_color(&access_token, &identity.client_id, &user_id)
            .await
            .ok()
            .flatten();
    }

    let reconciler = Arc::new(Reconciler::new(
        helix.clone(),
        broadcaster_cache.clone(),
        identity.client_id.clone(),
        events_tx.clone(),
    ));
    let color_engine = Arc::new(ColorApplyEngine::new(helix.clone(), config.clone(), events_tx.clone()));

    let (ws_session, mut ws_events) = WsSession::new();

    {
        let ws_session = ws_session.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ws_session.clone().run() => {}
                _ = stop.notified() => ws_session.stop(),
            }
        });
    }

    {
        let token_lifecycle = token_lifecycle.clone();
        tokio::spawn(async move {
            token_lifecycle.run().await;
        });
    }

    let mut access_token = access_token;
    let mut current_session_id: Option<String> = None;
    let mut channels = identity.channels.clone();
    let mut enabled = identity.enabled;
    let client_id = identity.client_id.clone();

    let color_in_flight = Arc::new(AtomicBool::new(false));
    let pending_trigger: Arc<tokio::sync::Mutex<Option<Option<ColorArg>>>> =
        Arc::new(tokio::sync::Mutex::new(None));
    let color_state = Arc::new(tokio::sync::RwLock::new(ColorRuntimeState {
        last_color: last_color.clone(),
        is_prime_or_turbo: identity.is_prime_or_turbo,
        hex_rejection_strikes: identity.hex_rejection_strikes,
    }));

    let mut fast_audit_deadline: Option<tokio::time::Instant> = None;
    let mut normal_audit_deadline = tokio::time::Instant::now() + jittered_normal_audit_interval();

    loop {
        if stopped.load(Ordering::SeqCst) {
            ws_session.stop();
            return RunOutcome::Stopped;
        }

        let fast_audit_sleep = async {
            match fast_audit_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = stop.notified() => {
                ws_session.stop();
                return RunOutcome::Stopped;
            }

            frame = ws_events.recv() => {
                match frame {
                    Some(WsFrameEvent::Welcome { session_id }) => {
                        current_session_id = Some(session_id.clone());
                        let report = reconciler
                            .reconcile(&access_token, &user_id, &session_id, &channels)
                            .await;
                        info!(username, created = report.created, deleted = report.deleted, "post-welcome reconciliation");
                        fast_audit_deadline = Some(tokio::time::Instant::now() + jittered_fast_audit_delay());
                    }
                    Some(WsFrameEvent::Reconnected) => {
                        info!(username, state = ?ws_session.state().await, "websocket reconnected");
                    }
                    Some(WsFrameEvent::Notification { subscription_type, payload, .. }) => {
                        if subscription_type != "channel.chat.message" {
                            continue;
                        }
                        match crate::router::route(username, enabled, &payload) {
                            RouterAction::None => {}
                            RouterAction::SetEnabled(new_enabled) => {
                                enabled = new_enabled;
                                config.queue_update(username, move |id| id.enabled = new_enabled).await;
                            }
                            RouterAction::Immediate(arg) => {
                                trigger_color_apply(
                                    &color_engine, &color_in_flight, &pending_trigger, &color_state,
                                    username, &client_id, &access_token, &user_id,
                                    Some(arg),
                                ).await;
                            }
                            RouterAction::AutoChange => {
                                trigger_color_apply(
                                    &color_engine, &color_in_flight, &pending_trigger, &color_state,
                                    username, &client_id, &access_token, &user_id,
                                    None,
                                ).await;
                            }
                        }
                    }
                    None => return RunOutcome::Crashed("websocket event channel closed".into()),
                }
            }

            event = events_rx.recv() => {
                match event {
                    Some(IdentityEvent::CredentialsChanged { access_token: new_token }) => {
                        access_token = new_token;
                        info!(username, "credentials changed; will use new token on next Helix call");
                    }
                    Some(IdentityEvent::TokenInvalid) => {
                        token_lifecycle.notify_token_invalid();
                    }
                    Some(IdentityEvent::SubscriptionsMissing) => {
                        token_lifecycle.notify_token_invalid();
                    }
                    None => return RunOutcome::Crashed("identity event channel closed".into()),
                }
            }

            _ = fast_audit_sleep => {
                fast_audit_deadline = None;
                if let Some(session_id) = &current_session_id {
                    let report = reconciler.reconcile(&access_token, &user_id, session_id, &channels).await;
                    info!(username, created = report.created, deleted = report.deleted, "fast audit complete");
                }
            }

            _ = tokio::time::sleep_until(normal_audit_deadline) => {
                normal_audit_deadline = tokio::time::Instant::now() + jittered_normal_audit_interval();
                if let Some(session_id) = &current_session_id {
                    let report = reconciler.reconcile(&access_token, &user_id, session_id, &channels).await;
                    info!(username, created = report.created, deleted = report.deleted, "normal audit complete");
                }
            }
        }

        maybe_drain_pending_trigger(
            &color_engine, &color_in_flight, &pending_trigger, &color_state,
            username, &client_id, &access_token, &user_id,
        ).await;

        let _ = &mut channels;
    }
}

/// Mutable color-relevant state shared between the supervisor's main
/// loop and its spawned apply tasks: `last_color`,
/// `is_prime_or_turbo`, and `hex_rejection_strikes` are read to build
/// each apply request and written back when an apply completes, so a
/// coalesced retrigger always excludes the most recently applied
/// color rather than a stale snapshot.
struct ColorRuntimeState {
    last_color: Option<String>,
    is_prime_or_turbo: bool,
    hex_rejection_strikes: u32,
}

fn jittered_normal_audit_interval() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=NORMAL_AUDIT_JITTER_MAX.as_secs());
    NORMAL_AUDIT_BASE + Duration::from_secs(jitter)
}

fn jittered_fast_audit_delay() -> Duration {
    let span = FAST_AUDIT_MAX.as_secs() - FAST_AUDIT_MIN.as_secs();
    FAST_AUDIT_MIN + Duration::from_secs(rand::thread_rng().gen_range(0..=span))
}

type PendingTrigger = Arc<tokio::sync::Mutex<Option<Option<ColorArg>>>>;
type ColorState = Arc<tokio::sync::RwLock<ColorRuntimeState>>;

#[allow(clippy::too_many_arguments)]
async fn trigger_color_apply(
    color_engine: &Arc<ColorApplyEngine>,
    color_in_flight: &Arc<AtomicBool>,
    pending_trigger: &PendingTrigger,
    color_state: &ColorState,
    username: &str,
    client_id: &str,
    access_token: &str,
    user_id: &str,
    forced: Option<ColorArg>,
) {
    if color_in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        spawn_apply(
            color_engine.clone(),
            color_in_flight.clone(),
            pending_trigger.clone(),
            color_state.clone(),
            username.to_string(),
            client_id.to_string(),
            access_token.to_string(),
            user_id.to_string(),
            forced,
        );
    } else {
        let mut slot = pending_trigger.lock().await;
        *slot = Some(forced);
    }
}

async fn maybe_drain_pending_trigger(
    color_engine: &Arc<ColorApplyEngine>,
    color_in_flight: &Arc<AtomicBool>,
    pending_trigger: &PendingTrigger,
    color_state: &ColorState,
    username: &str,
    client_id: &str,
    access_token: &str,
    user_id: &str,
) {
    if color_in_flight.load(Ordering::SeqCst) {
        return;
    }
    let forced = {
        let mut slot = pending_trigger.lock().await;
        slot.take()
    };
    let Some(forced) = forced else { return };

    if color_in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        spawn_apply(
            color_engine.clone(),
            color_in_flight.clone(),
            pending_trigger.clone(),
            color_state.clone(),
            username.to_string(),
            client_id.to_string(),
            access_token.to_string(),
            user_id.to_string(),
            forced,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_apply(
    color_engine: Arc<ColorApplyEngine>,
    color_in_flight: Arc<AtomicBool>,
    pending_trigger: PendingTrigger,
    color_state: ColorState,
    username: String,
    client_id: String,
    access_token: String,
    user_id: String,
    forced: Option<ColorArg>,
) {
    tokio::spawn(async move {
        let (is_prime_or_turbo, hex_rejection_strikes, last_color) = {
            let snapshot = color_state.read().await;
            (
                snapshot.is_prime_or_turbo,
                snapshot.hex_rejection_strikes,
                snapshot.last_color.clone(),
            )
        };

        let ApplyResult {
            outcome,
            last_color,
            is_prime_or_turbo,
            hex_rejection_strikes,
        } = color_engine
            .apply(ApplyRequest {
                username: &username,
                client_id: &client_id,
                access_token: &access_token,
                user_id: &user_id,
                is_prime_or_turbo,
                hex_rejection_strikes,
                last_color: last_color.as_deref(),
                forced,
            })
            .await;

        {
            let mut state = color_state.write().await;
            state.last_color = last_color;
            state.is_prime_or_turbo = is_prime_or_turbo;
            state.hex_rejection_strikes = hex_rejection_strikes;
        }

        match outcome {
            ApplyOutcome::Applied(color) => {
                info!(username = %username, color = %color, "color apply complete");
            }
            ApplyOutcome::Dropped => {
                warn!(username = %username, "color apply dropped after retries");
            }
            ApplyOutcome::TokenInvalid => {
                warn!(username = %username, "color apply aborted: token invalid");
            }
        }

        color_in_flight.store(false, Ordering::SeqCst);

        // Re-check for a coalesced trigger queued while we were busy.
        let queued = {
            let mut slot = pending_trigger.lock().await;
            slot.take()
        };
        if let Some(forced) = queued {
            if color_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                spawn_apply(
                    color_engine,
                    color_in_flight,
                    pending_trigger,
                    color_state,
                    username,
                    client_id,
                    access_token,
                    user_id,
                    forced,
                );
            }
        }
    });
}

