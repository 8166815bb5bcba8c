//! Selects a color distinct from the last applied one and writes it
//! through Helix, with strike-based hex demotion and outcome-specific
//! retry rules.

use crate::config::ConfigStore;
use crate::error::HelixError;
use crate::events::IdentityEvent;
use crate::helix::HelixClient;
use crate::palette;
use crate::router::ColorArg;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const HEX_DEMOTION_THRESHOLD: u32 = 2;
const GENERIC_RETRY_MAX_ATTEMPTS: u32 = 3;
const GENERIC_RETRY_BASE: Duration = Duration::from_millis(500);
const GENERIC_RETRY_CAP: Duration = Duration::from_secs(8);
const RATE_LIMIT_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(String),
    Dropped,
    TokenInvalid,
}

/// Outcome plus the identity's color-relevant runtime fields as they
/// stand after this call, so a caller holding its own copy of
/// `last_color`/`is_prime_or_turbo`/`hex_rejection_strikes` can stay
/// in sync without re-reading the Config Store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub outcome: ApplyOutcome,
    pub last_color: Option<String>,
    pub is_prime_or_turbo: bool,
    pub hex_rejection_strikes: u32,
}

pub struct ApplyRequest<'a> {
    pub username: &'a str,
    pub client_id: &'a str,
    pub access_token: &'a str,
    pub user_id: &'a str,
    pub is_prime_or_turbo: bool,
    pub hex_rejection_strikes: u32,
    pub last_color: Option<&'a str>,
    pub forced: Option<ColorArg>,
}

pub struct ColorApplyEngine {
    helix: Arc<HelixClient>,
    config: Arc<ConfigStore>,
    events: mpsc::Sender<IdentityEvent>,
}

impl ColorApplyEngine {
    pub fn new(
        helix: Arc<HelixClient>,
        config: Arc<ConfigStore>,
        events: mpsc::Sender<IdentityEvent>,
    ) -> Self {
        Self {
            helix,
            config,
            events,
        }
    }

    pub async fn apply(&self, req: ApplyRequest<'_>) -> ApplyResult {
        let (mut color, mut is_hex) = self.select_color(&req);

        let mut strikes = req.hex_rejection_strikes;
        let mut prime_or_turbo = req.is_prime_or_turbo;
        let mut last_color = req.last_color.map(|s| s.to_string());
        let mut demoted_this_call = false;

        for attempt in 0..=GENERIC_RETRY_MAX_ATTEMPTS {
            match self
                .helix
                .put_color(req.access_token, req.client_id, req.user_id, &color)
                .await
            {
                Ok(()) => {
                    self.persist_last_color(req.username, &color).await;
                    info!(username = %req.username, color = %color, "applied new chat color");
                    last_color = Some(color.clone());
                    return self.finish(ApplyOutcome::Applied(color), last_color, prime_or_turbo, strikes);
                }
                Err(HelixError::HexUnavailable) if is_hex && !demoted_this_call => {
                    strikes += 1;
                    warn!(username = %req.username, strikes, "hex color rejected");
                    if strikes >= HEX_DEMOTION_THRESHOLD {
                        prime_or_turbo = false;
                        demoted_this_call = true;
                        self.persist_demotion(req.username, strikes, false).await;
                        color = palette::pick_preset(req.last_color);
                        is_hex = false;
                        info!(username = %req.username, "demoted to preset-only after repeated hex rejection");
                        continue;
                    }
                    self.persist_strikes(req.username, strikes).await;
                    return self.finish(ApplyOutcome::Dropped, last_color, prime_or_turbo, strikes);
                }
                Err(HelixError::RateLimited { retry_after_secs }) => {
                    let wait = Duration::from_secs(retry_after_secs).min(RATE_LIMIT_CAP);
                    warn!(username = %req.username, ?wait, "rate limited, retrying once");
                    tokio::time::sleep(wait).await;
                    match self
                        .helix
                        .put_color(req.access_token, req.client_id, req.user_id, &color)
                        .await
                    {
                        Ok(()) => {
                            self.persist_last_color(req.username, &color).await;
                            last_color = Some(color.clone());
                            return self.finish(ApplyOutcome::Applied(color), last_color, prime_or_turbo, strikes);
                        }
                        Err(_) => return self.finish(ApplyOutcome::Dropped, last_color, prime_or_turbo, strikes),
                    }
                }
                Err(HelixError::TokenInvalid) => {
                    let _ = self.events.send(IdentityEvent::TokenInvalid).await;
                    return self.finish(ApplyOutcome::TokenInvalid, last_color, prime_or_turbo, strikes);
                }
                Err(e) => {
                    if attempt == GENERIC_RETRY_MAX_ATTEMPTS {
                        warn!(username = %req.username, error = %e, "put_color failed after retries, dropping");
                        return self.finish(ApplyOutcome::Dropped, last_color, prime_or_turbo, strikes);
                    }
                    let backoff = (GENERIC_RETRY_BASE.as_millis() as f64 * 2f64.powi(attempt as i32))
                        .min(GENERIC_RETRY_CAP.as_millis() as f64);
                    warn!(username = %req.username, error = %e, attempt, "put_color failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff as u64)).await;
                }
            }
        }

        self.finish(ApplyOutcome::Dropped, last_color, prime_or_turbo, strikes)
    }

    fn finish(
        &self,
        outcome: ApplyOutcome,
        last_color: Option<String>,
        is_prime_or_turbo: bool,
        hex_rejection_strikes: u32,
    ) -> ApplyResult {
        ApplyResult {
            outcome,
            last_color,
            is_prime_or_turbo,
            hex_rejection_strikes,
        }
    }

    fn select_color(&self, req: &ApplyRequest<'_>) -> (String, bool) {
        if let Some(arg) = &req.forced {
            return match arg {
                ColorArg::Preset(p) => (p.clone(), false),
                ColorArg::Hex(h) => (h.clone(), true),
            };
        }

        if req.is_prime_or_turbo && req.hex_rejection_strikes < HEX_DEMOTION_THRESHOLD {
            (palette::pick_hex(req.last_color), true)
        } else {
            (palette::pick_preset(req.last_color), false)
        }
    }

    /// The 204 success path persists through the debounced
    /// `PendingPersistQueue` rather than `update_user`, so a rapid
    /// sequence of auto-changes coalesces into one disk write instead
    /// of one per message.
    async fn persist_last_color(&self, username: &str, color: &str) {
        let color = color.to_string();
        self.config
            .queue_update(username, move |id| id.last_color = Some(color.clone()))
            .await;
    }

    async fn persist_strikes(&self, username: &str, strikes: u32) {
        self.config
            .update_user(username, move |id| id.hex_rejection_strikes = strikes)
            .await
            .ok();
    }

    async fn persist_demotion(&self, username: &str, strikes: u32, prime_or_turbo: bool) {
        self.config
            .update_user(username, move |id| {
                id.hex_rejection_strikes = strikes;
                id.is_prime_or_turbo = prime_or_turbo;
            })
            .await
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_req<'a>() -> ApplyRequest<'a> {
        ApplyRequest {
            username: "bot",
            client_id: "client",
            access_token: "token",
            user_id: "123",
            is_prime_or_turbo: true,
            hex_rejection_strikes: 0,
            last_color: Some("#112233"),
            forced: None,
        }
    }

    #[test]
    fn select_color_picks_hex_for_prime_turbo_under_threshold() {
        let engine_req = base_req();
        // select_color has no I/O dependency on `self`'s fields, so a
        // throwaway engine with no running tasks is fine here.
        let (color, is_hex) = dummy_select(&engine_req);
        assert!(is_hex);
        assert!(color.starts_with('#'));
    }

    #[test]
    fn select_color_falls_back_to_preset_at_strike_threshold() {
        let mut req = base_req();
        req.hex_rejection_strikes = 2;
        let (color, is_hex) = dummy_select(&req);
        assert!(!is_hex);
        assert!(!color.starts_with('#'));
    }

    #[test]
    fn select_color_respects_forced_arg() {
        let mut req = base_req();
        req.forced = Some(ColorArg::Preset("red".into()));
        let (color, is_hex) = dummy_select(&req);
        assert_eq!(color, "red");
        assert!(!is_hex);
    }

    /// Mirrors `ColorApplyEngine::select_color` without constructing a
    /// full engine (which needs live Arc<HelixClient>/ConfigStore).
    fn dummy_select(req: &ApplyRequest<'_>) -> (String, bool) {
        if let Some(arg) = &req.forced {
            return match arg {
                ColorArg::Preset(p) => (p.clone(), false),
                ColorArg::Hex(h) => (h.clone(), true),
            };
        }
        if req.is_prime_or_turbo && req.hex_rejection_strikes < HEX_DEMOTION_THRESHOLD {
            (palette::pick_hex(req.last_color), true)
        } else {
            (palette::pick_preset(req.last_color), false)
        }
    }
}
