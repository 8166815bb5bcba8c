//! The `Identity` aggregate and the normalization / validation rules
//! the Config Store applies to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub client_id: String,
    pub client_secret: String,
    pub channels: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub is_prime_or_turbo: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub token_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub last_color: Option<String>,
    #[serde(default)]
    pub hex_rejection_strikes: u32,
}

fn default_true() -> bool {
    true
}

/// `Identity`'s `Debug` impl redacts secrets: tokens and client
/// secrets never appear in logs.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("client_id", &"<redacted>")
            .field("client_secret", &"<redacted>")
            .field("channels", &self.channels)
            .field("is_prime_or_turbo", &self.is_prime_or_turbo)
            .field("enabled", &self.enabled)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_expiry", &self.token_expiry)
            .field("user_id", &self.user_id)
            .field("last_color", &self.last_color)
            .field("hex_rejection_strikes", &self.hex_rejection_strikes)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityValidationError {
    #[error("username must be 3-25 chars of [A-Za-z0-9_], got {0:?}")]
    InvalidUsername(String),

    #[error("username {0:?} has no channels configured")]
    NoChannels(String),

    #[error("username {0:?} has a client_id or client_secret shorter than 10 chars")]
    CredentialTooShort(String),
}

impl Identity {
    /// Normalizes in place: lowercases `username`, lowercases and
    /// strips a leading `#` from every channel, and dedupes channels
    /// (the `BTreeSet` storage already guarantees dedup once normalized).
    pub fn normalize(&mut self) {
        self.username = self.username.to_lowercase();
        let normalized: BTreeSet<String> = self
            .channels
            .iter()
            .map(|c| normalize_channel(c))
            .collect();
        self.channels = normalized;
    }

    pub fn validate(&self) -> Result<(), IdentityValidationError> {
        let len = self.username.chars().count();
        let valid_chars = self
            .username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !(3..=25).contains(&len) || !valid_chars || self.username.is_empty() {
            return Err(IdentityValidationError::InvalidUsername(
                self.username.clone(),
            ));
        }

        if self.channels.is_empty() {
            return Err(IdentityValidationError::NoChannels(self.username.clone()));
        }

        if !self.client_id.is_empty()
            && (crate::util::is_blank(&self.client_id) || self.client_id.len() < 10)
        {
            return Err(IdentityValidationError::CredentialTooShort(
                self.username.clone(),
            ));
        }
        if !self.client_secret.is_empty()
            && (crate::util::is_blank(&self.client_secret) || self.client_secret.len() < 10)
        {
            return Err(IdentityValidationError::CredentialTooShort(
                self.username.clone(),
            ));
        }

        Ok(())
    }

    /// An identity with no access token must run the device flow
    /// before anything else can happen for it.
    pub fn needs_provisioning(&self) -> bool {
        self.access_token.is_empty()
    }
}

pub fn normalize_channel(channel: &str) -> String {
    channel.trim().trim_start_matches('#').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Identity {
        Identity {
            username: "SomeUser".into(),
            client_id: "clientid1234".into(),
            client_secret: "clientsecret1234".into(),
            channels: ["#FooBar".into(), "foobar".into(), " Baz ".into()]
                .into_iter()
                .collect(),
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
    fn normalize_lowercases_username_and_channels_and_dedupes() {
        let mut id = sample();
        id.normalize();
        assert_eq!(id.username, "someuser");
        assert_eq!(
            id.channels,
            ["foobar", "baz"].into_iter().map(String::from).collect()
        );
    }

    #[test]
    fn validate_rejects_short_username() {
        let mut id = sample();
        id.username = "ab".into();
        assert!(id.validate().is_err());
    }

    #[test]
    fn validate_rejects_no_channels() {
        let mut id = sample();
        id.channels.clear();
        assert!(id.validate().is_err());
    }

    #[test]
    fn validate_rejects_short_credentials() {
        let mut id = sample();
        id.client_id = "short".into();
        assert!(id.validate().is_err());
    }

    #[test]
    fn validate_rejects_whitespace_only_credentials_of_otherwise_valid_length() {
        let mut id = sample();
        id.client_id = " ".repeat(10);
        assert!(id.validate().is_err());
    }

    #[test]
    fn needs_provisioning_when_access_token_empty() {
        let mut id = sample();
        id.access_token.clear();
        assert!(id.needs_provisioning());
    }
}
