//! Authenticated REST calls against Twitch's
//! Helix API and the `id.twitch.tv` OAuth endpoints. Hand-rolled
//! request/response structs over a shared `reqwest::Client`, no
//! generated SDK.

use crate::error::{DeviceFailureKind, HelixError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const ID_BASE: &str = "https://id.twitch.tv/oauth2";
const HELIX_BASE: &str = "https://api.twitch.tv/helix";
const EVENTSUB_SUB_TYPE: &str = "channel.chat.message";
const EVENTSUB_SUB_VERSION: &str = "1";
pub const REQUIRED_SCOPES: &[&str] = &["user:read:chat", "user:manage:chat_color"];
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body substrings Twitch uses to distinguish "hex rejected" from
/// other PUT /chat/color failures. These may drift with Twitch's own
/// wording; treat detection as data, not code, and log the raw body
/// when nothing matches.
const HEX_UNAVAILABLE_MARKERS: &[&str] = &["turbo or prime", "hex color code"];

#[derive(Clone)]
pub struct HelixClient {
    http: reqwest::Client,
}

impl Default for HelixClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HelixClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .user_agent("twitch-color-cycler/0.1")
            .build()
            .expect("reqwest client config is valid");
        Self { http }
    }

    fn observe_rate_limit(resp: &reqwest::Response) {
        if let (Some(remaining), Some(reset)) = (
            resp.headers().get("ratelimit-remaining"),
            resp.headers().get("ratelimit-reset"),
        ) {
            debug!(?remaining, ?reset, "helix rate-limit headers observed");
        }
    }

    fn retry_after_secs(resp: &reqwest::Response) -> u64 {
        resp.headers()
            .get("ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5)
    }

    // -- OAuth / token lifecycle -------------------------------------

    pub async fn validate(&self, access_token: &str) -> Result<ValidateResponse, HelixError> {
        let resp = self
            .http
            .get(format!("{ID_BASE}/validate"))
            .header("Authorization", format!("OAuth {access_token}"))
            .send()
            .await
            .map_err(transient)?;

        Self::observe_rate_limit(&resp);

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(HelixError::TokenInvalid);
        }
        if !resp.status().is_success() {
            return Err(unexpected(resp).await);
        }
        resp.json().await.map_err(|e| HelixError::Unexpected {
            status: 200,
            body: e.to_string(),
        })
    }

    pub async fn refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenResponse, HelixError> {
        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let resp = self
            .http
            .post(format!("{ID_BASE}/token"))
            .form(&params)
            .send()
            .await
            .map_err(transient)?;

        Self::observe_rate_limit(&resp);

        if resp.status() == reqwest::StatusCode::BAD_REQUEST
            || resp.status() == reqwest::StatusCode::UNAUTHORIZED
        {
            let body = resp.text().await.unwrap_or_default();
            return Err(HelixError::RefreshFailed(body));
        }
        if !resp.status().is_success() {
            return Err(unexpected(resp).await);
        }

        resp.json().await.map_err(|e| HelixError::Unexpected {
            status: 200,
            body: e.to_string(),
        })
    }

    pub async fn device_start(
        &self,
        client_id: &str,
        scopes: &[&str],
    ) -> Result<DeviceStartResponse, HelixError> {
        let scope_str = scopes.join(" ");
        let params = [("client_id", client_id), ("scopes", scope_str.as_str())];

        let resp = self
            .http
            .post(format!("{ID_BASE}/device"))
            .form(&params)
            .send()
            .await
            .map_err(transient)?;

        Self::observe_rate_limit(&resp);

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(HelixError::DeviceStartFailed(format!("{status}: {body}")));
        }

        resp.json().await.map_err(|e| HelixError::Unexpected {
            status: 200,
            body: e.to_string(),
        })
    }

    pub async fn device_poll(
        &self,
        client_id: &str,
        client_secret: &str,
        device_code: &str,
    ) -> Result<DevicePollOutcome, HelixError> {
        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("device_code", device_code),
            (
                "grant_type",
                "urn:ietf:params:oauth:grant-type:device_code",
            ),
        ];

        let resp = self
            .http
            .post(format!("{ID_BASE}/token"))
            .form(&params)
            .send()
            .await
            .map_err(transient)?;

        Self::observe_rate_limit(&resp);

        if resp.status().is_success() {
            let tokens: TokenResponse = resp.json().await.map_err(|e| HelixError::Unexpected {
                status: 200,
                body: e.to_string(),
            })?;
            return Ok(DevicePollOutcome::Tokens(tokens));
        }

        let body = resp.text().await.unwrap_or_default();
        if body.contains("authorization_pending") {
            Ok(DevicePollOutcome::Pending)
        } else if body.contains("slow_down") {
            Ok(DevicePollOutcome::SlowDown)
        } else if body.contains("expired_token") {
            Err(HelixError::DeviceFailed(DeviceFailureKind::ExpiredToken))
        } else if body.contains("access_denied") {
            Err(HelixError::DeviceFailed(DeviceFailureKind::AccessDenied))
        } else {
            Err(HelixError::Unexpected { status: 0, body })
        }
    }

    // -- Users ---------------------------------------------------------

    pub async fn resolve_user(
        &self,
        access_token: &str,
        client_id: &str,
        logins: &[String],
    ) -> Result<std::collections::HashMap<String, String>, HelixError> {
        let mut out = std::collections::HashMap::new();
        for chunk in logins.chunks(100) {
            let query: Vec<(&str, &str)> = chunk.iter().map(|l| ("login", l.as_str())).collect();
            let resp = self
                .http
                .get(format!("{HELIX_BASE}/users"))
                .header("Authorization", format!("Bearer {access_token}"))
                .header("Client-Id", client_id)
                .query(&query)
                .send()
                .await
                .map_err(transient)?;

            Self::observe_rate_limit(&resp);

            if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(HelixError::TokenInvalid);
            }
            if !resp.status().is_success() {
                return Err(unexpected(resp).await);
            }

            let body: HelixEnvelope<HelixUser> =
                resp.json().await.map_err(|e| HelixError::Unexpected {
                    status: 200,
                    body: e.to_string(),
                })?;
            for user in body.data {
                out.insert(user.login.to_lowercase(), user.id);
            }
        }
        Ok(out)
    }

    // -- Chat color ------------------------------------------------------

    pub async fn get_color(
        &self,
        access_token: &str,
        client_id: &str,
        user_id: &str,
    ) -> Result<Option<String>, HelixError> {
        let resp = self
            .http
            .get(format!("{HELIX_BASE}/chat/color"))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Client-Id", client_id)
            .query(&[("user_id", user_id)])
            .send()
            .await
            .map_err(transient)?;

        Self::observe_rate_limit(&resp);

        match resp.status() {
            reqwest::StatusCode::UNAUTHORIZED => Err(HelixError::TokenInvalid),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body: HelixEnvelope<HelixColor> =
                    resp.json().await.map_err(|e| HelixError::Unexpected {
                        status: 200,
                        body: e.to_string(),
                    })?;
                Ok(body.data.into_iter().next().map(|c| c.color))
            }
            _ => Err(unexpected(resp).await),
        }
    }

    pub async fn put_color(
        &self,
        access_token: &str,
        client_id: &str,
        user_id: &str,
        color: &str,
    ) -> Result<(), HelixError> {
        let resp = self
            .http
            .put(format!("{HELIX_BASE}/chat/color"))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Client-Id", client_id)
            .query(&[("user_id", user_id), ("color", color)])
            .send()
            .await
            .map_err(transient)?;

        Self::observe_rate_limit(&resp);

        match resp.status() {
            reqwest::StatusCode::NO_CONTENT => Ok(()),
            reqwest::StatusCode::UNAUTHORIZED => Err(HelixError::TokenInvalid),
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = Self::retry_after_secs(&resp);
                Err(HelixError::RateLimited { retry_after_secs })
            }
            reqwest::StatusCode::BAD_REQUEST | reqwest::StatusCode::FORBIDDEN => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                let lower = body.to_lowercase();
                if HEX_UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
                    Err(HelixError::HexUnavailable)
                } else {
                    warn!(status, body = %body, "put_color failed with unrecognized error body");
                    Err(HelixError::Unexpected { status, body })
                }
            }
            _ => Err(unexpected(resp).await),
        }
    }

    // -- EventSub subscriptions -------------------------------------

    pub async fn sub_create(
        &self,
        access_token: &str,
        client_id: &str,
        broadcaster_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<String, HelixError> {
        let body = CreateSubRequest {
            typ: EVENTSUB_SUB_TYPE,
            version: EVENTSUB_SUB_VERSION,
            condition: SubCondition {
                broadcaster_user_id: broadcaster_id,
                user_id,
            },
            transport: SubTransport {
                method: "websocket",
                session_id,
            },
        };

        let resp = self
            .http
            .post(format!("{HELIX_BASE}/eventsub/subscriptions"))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Client-Id", client_id)
            .json(&body)
            .send()
            .await
            .map_err(transient)?;

        Self::observe_rate_limit(&resp);

        match resp.status() {
            reqwest::StatusCode::ACCEPTED => {
                let parsed: HelixEnvelope<EventSubSubscription> =
                    resp.json().await.map_err(|e| HelixError::Unexpected {
                        status: 202,
                        body: e.to_string(),
                    })?;
                Ok(parsed
                    .data
                    .into_iter()
                    .next()
                    .map(|s| s.id)
                    .unwrap_or_default())
            }
            reqwest::StatusCode::CONFLICT => {
                debug!("sub_create: subscription already exists, treating as success");
                Ok(String::new())
            }
            reqwest::StatusCode::UNAUTHORIZED => Err(HelixError::TokenInvalid),
            reqwest::StatusCode::FORBIDDEN => {
                let body = resp.text().await.unwrap_or_default();
                Err(HelixError::MissingScopes(vec![body]))
            }
            _ => Err(unexpected(resp).await),
        }
    }

    pub async fn sub_list(
        &self,
        access_token: &str,
        client_id: &str,
        user_id: &str,
    ) -> Result<Vec<EventSubSubscription>, HelixError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("user_id", user_id.to_string())];
            if let Some(c) = &cursor {
                query.push(("after", c.clone()));
            }

            let resp = self
                .http
                .get(format!("{HELIX_BASE}/eventsub/subscriptions"))
                .header("Authorization", format!("Bearer {access_token}"))
                .header("Client-Id", client_id)
                .query(&query)
                .send()
                .await
                .map_err(transient)?;

            Self::observe_rate_limit(&resp);

            if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(HelixError::TokenInvalid);
            }
            if !resp.status().is_success() {
                return Err(unexpected(resp).await);
            }

            let page: EventSubListResponse =
                resp.json().await.map_err(|e| HelixError::Unexpected {
                    status: 200,
                    body: e.to_string(),
                })?;
            out.extend(page.data);
            cursor = page.pagination.and_then(|p| p.cursor);
            if cursor.is_none() {
                break;
            }
        }

        Ok(out)
    }

    pub async fn sub_delete(
        &self,
        access_token: &str,
        client_id: &str,
        id: &str,
    ) -> Result<(), HelixError> {
        let resp = self
            .http
            .delete(format!("{HELIX_BASE}/eventsub/subscriptions"))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Client-Id", client_id)
            .query(&[("id", id)])
            .send()
            .await
            .map_err(transient)?;

        Self::observe_rate_limit(&resp);

        match resp.status() {
            reqwest::StatusCode::NO_CONTENT | reqwest::StatusCode::NOT_FOUND => Ok(()),
            reqwest::StatusCode::UNAUTHORIZED => Err(HelixError::TokenInvalid),
            _ => Err(unexpected(resp).await),
        }
    }
}

fn transient(e: reqwest::Error) -> HelixError {
    HelixError::Transient(e.to_string())
}

async fn unexpected(resp: reqwest::Response) -> HelixError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    HelixError::Unexpected { status, body }
}

#[derive(Debug, Deserialize)]
pub struct ValidateResponse {
    pub login: String,
    pub user_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub struct DeviceStartResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub interval: u64,
    pub expires_in: u64,
}

#[derive(Debug)]
pub enum DevicePollOutcome {
    Pending,
    SlowDown,
    Tokens(TokenResponse),
}

#[derive(Debug, Deserialize)]
struct HelixEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
    id: String,
    login: String,
}

#[derive(Debug, Deserialize)]
struct HelixColor {
    color: String,
}

#[derive(Debug, Serialize)]
struct CreateSubRequest<'a> {
    #[serde(rename = "type")]
    typ: &'a str,
    version: &'a str,
    condition: SubCondition<'a>,
    transport: SubTransport<'a>,
}

#[derive(Debug, Serialize)]
struct SubCondition<'a> {
    broadcaster_user_id: &'a str,
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SubTransport<'a> {
    method: &'a str,
    session_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventSubSubscription {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub condition: serde_json::Value,
}

impl EventSubSubscription {
    pub fn broadcaster_user_id(&self) -> Option<&str> {
        self.condition.get("broadcaster_user_id").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct EventSubListResponse {
    #[serde(default)]
    data: Vec<EventSubSubscription>,
    #[serde(default)]
    pagination: Option<EventSubPagination>,
}

#[derive(Debug, Deserialize)]
struct EventSubPagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_scopes_are_the_two_chat_scopes() {
        assert_eq!(
            REQUIRED_SCOPES,
            &["user:read:chat", "user:manage:chat_color"]
        );
    }

    #[test]
    fn hex_unavailable_markers_are_case_insensitive_matched_by_caller() {
        let body = "requires Turbo or Prime to use hex colors".to_lowercase();
        assert!(HEX_UNAVAILABLE_MARKERS.iter().any(|m| body.contains(m)));
    }
}
