//! Owns the Config Store and the set of running Identity Supervisors:
//! one per enabled, valid identity. Reload diffs the new identity list
//! against what's running and restarts only supervisors whose
//! non-runtime fields actually changed.

use crate::broadcaster_cache::BroadcasterCache;
use crate::config::ConfigStore;
use crate::error::ConfigError;
use crate::events::IdentityEvent;
use crate::helix::HelixClient;
use crate::identity::Identity;
use crate::reconcile::Reconciler;
use crate::supervisor::{self, SupervisorHandle};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

pub struct FleetManager {
    config: Arc<ConfigStore>,
    broadcaster_cache: Arc<BroadcasterCache>,
    helix: Arc<HelixClient>,
    running: Mutex<HashMap<String, RunningEntry>>,
}

struct RunningEntry {
    handle: SupervisorHandle,
    fingerprint: Fingerprint,
    /// The identity this supervisor was last spawned with. Kept around
    /// so a subsequent `reload()` can tell which channels were dropped
    /// and clean up their subscriptions before restarting.
    identity: Identity,
}

/// The subset of an `Identity`'s fields whose change warrants
/// restarting its supervisor. Tokens, `last_color`,
/// `hex_rejection_strikes`, `is_prime_or_turbo` and `enabled` are
/// runtime state the supervisor itself owns and reconciles with the
/// config store; changing them from outside doesn't need a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    client_id: String,
    client_secret: String,
    channels: BTreeSet<String>,
}

impl Fingerprint {
    fn of(identity: &Identity) -> Self {
        Self {
            client_id: identity.client_id.clone(),
            client_secret: identity.client_secret.clone(),
            channels: identity.channels.clone(),
        }
    }
}

impl FleetManager {
    pub fn new(
        config: Arc<ConfigStore>,
        broadcaster_cache: Arc<BroadcasterCache>,
        helix: Arc<HelixClient>,
    ) -> Self {
        Self {
            config,
            broadcaster_cache,
            helix,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the current identity list and spawns a supervisor for
    /// every enabled identity in it.
    pub async fn start(&self) -> Result<(), ConfigError> {
        let list = self.config.load().await?;
        let mut running = self.running.lock().await;
        for identity in list.iter().filter(|i| i.enabled) {
            self.spawn_locked(&mut running, identity);
        }
        Ok(())
    }

    fn spawn_locked(&self, running: &mut HashMap<String, RunningEntry>, identity: &Identity) {
        info!(username = %identity.username, "starting identity supervisor");
        let handle = supervisor::spawn(
            identity.username.clone(),
            self.config.clone(),
            self.helix.clone(),
            self.broadcaster_cache.clone(),
        );
        running.insert(
            identity.username.clone(),
            RunningEntry {
                handle,
                fingerprint: Fingerprint::of(identity),
                identity: identity.clone(),
            },
        );
    }

    /// Best-effort cleanup of `channel.chat.message` subscriptions for
    /// channels dropped from `old`'s channel list, run before `old`'s
    /// supervisor is replaced. Uses the credentials `old` was last
    /// known to hold; a stale or invalid token just means this call
    /// fails and logs, same as any other best-effort Helix call, since
    /// the incoming supervisor's own reconciliation pass would also
    /// catch these as "extra" subscriptions eventually.
    async fn cleanup_dropped_channels(&self, old: &Identity, new_channels: &BTreeSet<String>) {
        let removed: Vec<&String> = old.channels.difference(new_channels).collect();
        if removed.is_empty() {
            return;
        }
        let Some(user_id) = &old.user_id else { return };
        if old.access_token.is_empty() {
            return;
        }

        let (events_tx, _events_rx) = mpsc::channel::<IdentityEvent>(1);
        let reconciler = Reconciler::new(
            self.helix.clone(),
            self.broadcaster_cache.clone(),
            old.client_id.clone(),
            events_tx,
        );
        for channel in removed {
            reconciler
                .delete_for_channel_leave(&old.access_token, user_id, channel)
                .await;
        }
    }

    /// Diffs `new_list` against the running set: stops supervisors for
    /// identities that were removed or disabled, starts supervisors for
    /// identities newly added or re-enabled, and restarts supervisors
    /// whose client_id/client_secret/channels changed in place.
    pub async fn reload(&self, new_list: Vec<Identity>) {
        let wanted: HashMap<String, &Identity> = new_list
            .iter()
            .filter(|i| i.enabled)
            .map(|i| (i.username.clone(), i))
            .collect();

        let mut running = self.running.lock().await;

        let to_stop: Vec<String> = running
            .keys()
            .filter(|u| !wanted.contains_key(*u))
            .cloned()
            .collect();
        for username in to_stop {
            if let Some(entry) = running.remove(&username) {
                info!(username = %username, "stopping identity supervisor (removed or disabled)");
                entry.handle.stop();
            }
        }

        for (username, identity) in &wanted {
            let fingerprint = Fingerprint::of(identity);
            match running.get(username) {
                Some(entry) if entry.fingerprint == fingerprint => {
                    // Unchanged in every way that matters; leave it running.
                }
                Some(entry) => {
                    info!(username = %username, "restarting identity supervisor (credentials or channels changed)");
                    self.cleanup_dropped_channels(&entry.identity, &identity.channels).await;
                    entry.handle.stop();
                    self.spawn_locked(&mut running, identity);
                }
                None => {
                    self.spawn_locked(&mut running, identity);
                }
            }
        }
    }

    /// Orderly shutdown: stop every running supervisor, then flush any
    /// debounced config writes still pending. Callers own the
    /// `ConfigStore::run_flusher` task and should cancel it only after
    /// this returns.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (username, entry) in running.drain() {
            info!(username = %username, "stopping identity supervisor (shutdown)");
            entry.handle.stop();
        }
    }

    pub async fn running_usernames(&self) -> Vec<String> {
        self.running.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(username: &str, channel: &str) -> Identity {
        Identity {
            username: username.to_string(),
            client_id: "clientid1234".into(),
            client_secret: "clientsecret1234".into(),
            channels: BTreeSet::from([channel.to_string()]),
            is_prime_or_turbo: true,
            enabled: true,
            access_token: "tok".into(),
            refresh_token: "ref".into(),
            token_expiry: None,
            user_id: None,
            last_color: None,
            hex_rejection_strikes: 0,
        }
    }

    #[test]
    fn fingerprint_ignores_runtime_fields() {
        let mut a = sample("alice", "chan");
        let mut b = a.clone();
        b.access_token = "different".into();
        b.last_color = Some("red".into());
        b.hex_rejection_strikes = 3;
        b.is_prime_or_turbo = false;
        b.enabled = false;
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));

        a.channels.insert("otherchan".into());
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }
}
