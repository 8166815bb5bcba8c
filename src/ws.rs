//! A single EventSub connection per
//! identity. One task owns the socket (reads frames, reconnects,
//! enforces staleness); writers (pongs) serialize through an outbound
//! channel. Welcome/notification/reconnect frames are republished as
//! `WsFrameEvent`s for the supervisor to route to the Subscription
//! Reconciler and Message Router, keeping this module free of direct
//! references to either.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::util::backoff_with_jitter;

const DEFAULT_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
const IDLE_TIMEOUT: Duration = Duration::from_secs(70);
const MAX_CONSECUTIVE_FAILURES: u32 = 100;
const WRITE_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Disconnected,
    Connecting,
    AwaitingWelcome,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub enum WsFrameEvent {
    Welcome { session_id: String },
    Notification {
        subscription_type: String,
        message_id: String,
        payload: serde_json::Value,
    },
    Reconnected,
}

pub struct WsSession {
    url: RwLock<String>,
    state: RwLock<WsState>,
    consecutive_failures: AtomicU32,
    stop: Notify,
    stopped: std::sync::atomic::AtomicBool,
    events: mpsc::Sender<WsFrameEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum WsFatalError {
    #[error("exceeded {0} consecutive reconnect failures")]
    TooManyFailures(u32),
}

impl WsSession {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<WsFrameEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let session = Arc::new(Self {
            url: RwLock::new(DEFAULT_URL.to_string()),
            state: RwLock::new(WsState::Disconnected),
            consecutive_failures: AtomicU32::new(0),
            stop: Notify::new(),
            stopped: std::sync::atomic::AtomicBool::new(false),
            events: tx,
        });
        (session, rx)
    }

    pub async fn state(&self) -> WsState {
        *self.state.read().await
    }

    /// Requests shutdown. Every suspension inside `run` is cancellable
    /// within the 2s drain grace.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Drives the connect -> read -> (reconnect | stale | closed) loop
    /// until `stop()` is called or the consecutive-failure budget is
    /// exhausted.
    pub async fn run(self: Arc<Self>) -> Result<(), WsFatalError> {
        loop {
            if self.is_stopped() {
                return Ok(());
            }

            *self.state.write().await = WsState::Connecting;
            let url = self.url.read().await.clone();
            info!(%url, "connecting to EventSub websocket");

            let connect_result = tokio::select! {
                r = tokio_tungstenite::connect_async(&url) => r,
                _ = self.stop.notified() => return Ok(()),
            };

            let stream = match connect_result {
                Ok((stream, _resp)) => stream,
                Err(e) => {
                    warn!(error = %e, "websocket connect failed");
                    if self.bump_failure_and_check()? {
                        return Err(WsFatalError::TooManyFailures(MAX_CONSECUTIVE_FAILURES));
                    }
                    self.sleep_with_backoff().await;
                    continue;
                }
            };

            *self.state.write().await = WsState::AwaitingWelcome;
            match self.read_loop(stream).await {
                ReadLoopOutcome::Reconnect(new_url) => {
                    *self.url.write().await = new_url;
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    let _ = self.events.send(WsFrameEvent::Reconnected).await;
                    continue;
                }
                ReadLoopOutcome::StaleOrClosed => {
                    *self.url.write().await = DEFAULT_URL.to_string();
                    if self.bump_failure_and_check()? {
                        return Err(WsFatalError::TooManyFailures(MAX_CONSECUTIVE_FAILURES));
                    }
                    self.sleep_with_backoff().await;
                }
                ReadLoopOutcome::Stopped => return Ok(()),
            }
        }
    }

    fn bump_failure_and_check(&self) -> Result<bool, WsFatalError> {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(failures >= MAX_CONSECUTIVE_FAILURES)
    }

    async fn sleep_with_backoff(&self) {
        *self.state.write().await = WsState::Reconnecting;
        let attempt = self.consecutive_failures.load(Ordering::SeqCst);
        let delay = backoff_with_jitter(
            attempt,
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(60),
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stop.notified() => {}
        }
    }

    async fn read_loop(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> ReadLoopOutcome {
        let (mut write, mut read) = stream.split();

        loop {
            let frame = tokio::select! {
                f = tokio::time::timeout(IDLE_TIMEOUT, read.next()) => f,
                _ = self.stop.notified() => {
                    let _ = tokio::time::timeout(WRITE_DRAIN_GRACE, write.close()).await;
                    return ReadLoopOutcome::Stopped;
                }
            };

            let msg = match frame {
                Err(_elapsed) => {
                    warn!("no websocket frames for {:?}, treating session as stale", IDLE_TIMEOUT);
                    let _ = tokio::time::timeout(WRITE_DRAIN_GRACE, write.close()).await;
                    return ReadLoopOutcome::StaleOrClosed;
                }
                Ok(None) => {
                    info!("websocket stream ended");
                    return ReadLoopOutcome::StaleOrClosed;
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "websocket read error");
                    return ReadLoopOutcome::StaleOrClosed;
                }
                Ok(Some(Ok(m))) => m,
            };

            match msg {
                Message::Text(text) => match self.handle_text_frame(&text).await {
                    FrameOutcome::Continue | FrameOutcome::Ignore => {}
                    FrameOutcome::Reconnect(url) => {
                        let _ = tokio::time::timeout(WRITE_DRAIN_GRACE, write.close()).await;
                        return ReadLoopOutcome::Reconnect(url);
                    }
                },
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(frame) => {
                    debug!(?frame, "websocket closed by peer");
                    return ReadLoopOutcome::StaleOrClosed;
                }
                _ => {}
            }
        }
    }

    async fn handle_text_frame(&self, text: &str) -> FrameOutcome {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, raw = %text, "malformed eventsub frame, skipping");
                return FrameOutcome::Ignore;
            }
        };

        match envelope.metadata.message_type.as_str() {
            "session_welcome" => {
                let payload: WelcomePayload = match serde_json::from_value(envelope.payload) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "malformed session_welcome payload");
                        return FrameOutcome::Ignore;
                    }
                };
                info!(session_id = %payload.session.id, "eventsub session welcome");
                *self.state.write().await = WsState::Connected;
                let _ = self
                    .events
                    .send(WsFrameEvent::Welcome {
                        session_id: payload.session.id,
                    })
                    .await;
                FrameOutcome::Continue
            }
            "session_keepalive" => FrameOutcome::Continue,
            "notification" => {
                let sub_type = envelope
                    .metadata
                    .subscription_type
                    .unwrap_or_default();
                let _ = self
                    .events
                    .send(WsFrameEvent::Notification {
                        subscription_type: sub_type,
                        message_id: envelope.metadata.message_id,
                        payload: envelope.payload,
                    })
                    .await;
                FrameOutcome::Continue
            }
            "session_reconnect" => {
                let payload: WelcomePayload = match serde_json::from_value(envelope.payload) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "malformed session_reconnect payload");
                        return FrameOutcome::Ignore;
                    }
                };
                match payload.session.reconnect_url {
                    Some(url) => match url::Url::parse(&url) {
                        Ok(parsed) if parsed.scheme() == "wss" => {
                            info!(%url, "received session_reconnect");
                            FrameOutcome::Reconnect(url)
                        }
                        Ok(_) | Err(_) => {
                            warn!(%url, "session_reconnect carried a non-wss URL, ignoring");
                            FrameOutcome::Ignore
                        }
                    },
                    None => {
                        warn!("session_reconnect without reconnect_url");
                        FrameOutcome::Ignore
                    }
                }
            }
            "revocation" => {
                warn!("eventsub subscription revoked");
                FrameOutcome::Ignore
            }
            other => {
                debug!(message_type = %other, "unhandled eventsub message type");
                FrameOutcome::Ignore
            }
        }
    }
}

enum FrameOutcome {
    Continue,
    Ignore,
    Reconnect(String),
}

enum ReadLoopOutcome {
    Reconnect(String),
    StaleOrClosed,
    Stopped,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    metadata: Metadata,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    message_id: String,
    message_type: String,
    #[serde(default)]
    subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WelcomePayload {
    session: SessionInfo,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    id: String,
    #[serde(default)]
    reconnect_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_is_seventy_seconds() {
        assert_eq!(IDLE_TIMEOUT, Duration::from_secs(70));
    }

    #[tokio::test]
    async fn stop_flag_is_observed() {
        let (session, _rx) = WsSession::new();
        assert!(!session.is_stopped());
        session.stop();
        assert!(session.is_stopped());
    }
}
