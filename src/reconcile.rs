//! Drives the actual EventSub subscription set for an identity towards
//! the expected set derived from its configured channels.

use crate::broadcaster_cache::BroadcasterCache;
use crate::error::HelixError;
use crate::events::IdentityEvent;
use crate::helix::HelixClient;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Reconciler {
    helix: Arc<HelixClient>,
    broadcaster_cache: Arc<BroadcasterCache>,
    client_id: String,
    events: mpsc::Sender<IdentityEvent>,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub created: usize,
    pub deleted: usize,
    pub unresolved_channels: Vec<String>,
}

impl Reconciler {
    pub fn new(
        helix: Arc<HelixClient>,
        broadcaster_cache: Arc<BroadcasterCache>,
        client_id: String,
        events: mpsc::Sender<IdentityEvent>,
    ) -> Self {
        Self {
            helix,
            broadcaster_cache,
            client_id,
            events,
        }
    }

    /// Runs the full 6-step reconciliation algorithm once.
    pub async fn reconcile(
        &self,
        access_token: &str,
        user_id: &str,
        session_id: &str,
        channels: &BTreeSet<String>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        // Step 1: resolve broadcaster ids, cache-first.
        let mut expected: HashSet<String> = HashSet::new();
        for channel in channels {
            match self.resolve_broadcaster_id(access_token, channel).await {
                Some(id) => {
                    expected.insert(id);
                }
                None => {
                    report.unresolved_channels.push(channel.clone());
                }
            }
        }

        // Step 2: list actual subscriptions for this user.
        let actual_subs = match self.helix.sub_list(access_token, &self.client_id, user_id).await {
            Ok(subs) => subs,
            Err(HelixError::TokenInvalid) => {
                let _ = self.events.send(IdentityEvent::TokenInvalid).await;
                return report;
            }
            Err(e) => {
                warn!(error = %e, "failed to list eventsub subscriptions");
                return report;
            }
        };

        let actual: HashSet<String> = actual_subs
            .iter()
            .filter(|s| s.typ == "channel.chat.message")
            .filter_map(|s| s.broadcaster_user_id().map(|b| b.to_string()))
            .collect();

        // Step 3: diff.
        let missing: Vec<&String> = expected.difference(&actual).collect();
        let extra: Vec<&crate::helix::EventSubSubscription> = actual_subs
            .iter()
            .filter(|s| {
                s.typ == "channel.chat.message"
                    && s.broadcaster_user_id()
                        .map(|b| !expected.contains(b))
                        .unwrap_or(false)
            })
            .collect();

        // Step 4: create missing.
        let mut unauthorized_count = 0;
        for broadcaster_id in missing {
            match self
                .helix
                .sub_create(access_token, &self.client_id, broadcaster_id, user_id, session_id)
                .await
            {
                Ok(_) => {
                    report.created += 1;
                    debug!(broadcaster_id, "created eventsub subscription");
                }
                Err(HelixError::MissingScopes(_)) => {
                    warn!(broadcaster_id, "subscribe failed: missing scopes");
                    let _ = self.events.send(IdentityEvent::SubscriptionsMissing).await;
                }
                Err(HelixError::TokenInvalid) => {
                    unauthorized_count += 1;
                    let _ = self.events.send(IdentityEvent::TokenInvalid).await;
                    if unauthorized_count >= 2 {
                        warn!("two 401s within one audit; treating token as dead");
                        break;
                    }
                }
                Err(e) => {
                    warn!(broadcaster_id, error = %e, "failed to create eventsub subscription");
                }
            }
        }

        // Step 5: remove extras, best-effort.
        for sub in extra {
            match self.helix.sub_delete(access_token, &self.client_id, &sub.id).await {
                Ok(()) => {
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(sub_id = %sub.id, error = %e, "failed to delete extra eventsub subscription (best-effort)");
                }
            }
        }

        if !report.unresolved_channels.is_empty() {
            warn!(channels = ?report.unresolved_channels, "could not resolve broadcaster id for channel(s)");
        }

        info!(
            created = report.created,
            deleted = report.deleted,
            "subscription reconciliation complete"
        );
        report
    }

    /// Deletes the subscription for a channel being removed from the
    /// expected set. Failure to delete is logged but never blocks local
    /// removal.
    pub async fn delete_for_channel_leave(
        &self,
        access_token: &str,
        user_id: &str,
        channel: &str,
    ) {
        let Some(broadcaster_id) = self.broadcaster_cache.get(channel).await else {
            return;
        };

        let subs = match self.helix.sub_list(access_token, &self.client_id, user_id).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(channel, error = %e, "failed to list subscriptions for channel_leave cleanup");
                return;
            }
        };

        for sub in subs
            .iter()
            .filter(|s| s.typ == "channel.chat.message")
            .filter(|s| s.broadcaster_user_id() == Some(broadcaster_id.as_str()))
        {
            if let Err(e) = self.helix.sub_delete(access_token, &self.client_id, &sub.id).await {
                warn!(channel, sub_id = %sub.id, error = %e, "failed to delete subscription on channel_leave");
            }
        }
    }

    async fn resolve_broadcaster_id(&self, access_token: &str, channel: &str) -> Option<String> {
        if let Some(id) = self.broadcaster_cache.get(channel).await {
            return Some(id);
        }

        let resolved = self
            .helix
            .resolve_user(access_token, &self.client_id, &[channel.to_string()])
            .await
            .ok()?;
        let id = resolved.get(channel).cloned()?;
        self.broadcaster_cache.insert(channel, id.clone()).await;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_is_expected_minus_actual() {
        let expected: HashSet<String> = ["a".into(), "b".into()].into_iter().collect();
        let actual: HashSet<String> = ["b".into(), "c".into()].into_iter().collect();
        let missing: Vec<&String> = expected.difference(&actual).collect();
        assert_eq!(missing, vec![&"a".to_string()]);
    }
}
