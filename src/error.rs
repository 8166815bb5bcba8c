//! Shared error and outcome types.
//!
//! Leaf components expose typed errors via `thiserror`; the
//! retryable/terminal split is exposed as a method rather than by
//! inspecting variants directly at call sites.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HelixError {
    #[error("access token rejected by Twitch")]
    TokenInvalid,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("device authorization start failed: {0}")]
    DeviceStartFailed(String),

    #[error("device authorization failed: {0:?}")]
    DeviceFailed(DeviceFailureKind),

    #[error("missing required scopes: {0:?}")]
    MissingScopes(Vec<String>),

    #[error("hex color rejected (account not Prime/Turbo)")]
    HexUnavailable,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("unexpected Helix response ({status}): {body}")]
    Unexpected { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFailureKind {
    AccessDenied,
    ExpiredToken,
}

impl HelixError {
    /// True when the caller that owns the underlying resource should
    /// retry with backoff rather than propagate the failure upward.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HelixError::Transient(_) | HelixError::RateLimited { .. }
        )
    }

    /// True when the failure is fatal to the current attempt and must
    /// be handled by a specific owner (Token Lifecycle, Color Apply
    /// Engine) rather than retried blindly.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HelixError::TokenInvalid
                | HelixError::MissingScopes(_)
                | HelixError::DeviceFailed(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
