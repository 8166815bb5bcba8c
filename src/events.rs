//! Cross-component event bus. Token Lifecycle, the
//! WebSocket Session, and the Subscription Reconciler never hold
//! direct references to each other; they publish typed events here
//! and the Identity Supervisor's controller loop routes them.

#[derive(Debug, Clone)]
pub enum IdentityEvent {
    /// Fired by Token Lifecycle after a successful refresh or device
    /// flow completion. Consumers (Subscription Reconciler) must use
    /// the new access token on their next Helix call.
    CredentialsChanged { access_token: String },

    /// Fired by any component that observes a 401. Consumed by Token
    /// Lifecycle, which decides whether to refresh or provision.
    TokenInvalid,

    /// Fired by the Subscription Reconciler on a 403 scope diff.
    /// Token Lifecycle treats the current token as invalid and
    /// re-provisions.
    SubscriptionsMissing,
}
