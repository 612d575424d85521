//! Login validation.
//!
//! An [`Auth`] implementation receives the login request together with an
//! [`AuthCompletion`]. The completion is consumed when used, so it can
//! deliver at most one outcome, and dropping it without completing delivers
//! [`AuthFailure::Abandoned`]. The waiting side therefore always receives
//! exactly one [`AuthOutcome`] through its [`AuthPending`].

use super::types::PlayerId;
use crate::capability::{Capability, CapabilityId};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// A login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub player: PlayerId,
    pub name: String,
    pub password: String,
    pub client_version: u16,
}

/// Details of a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedPlayer {
    /// Name the player is known by, which may differ from the requested one
    pub name: String,
    pub squad: Option<String>,
    pub demo: bool,
}

/// Why a login was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("bad password")]
    BadPassword,
    #[error("unknown player")]
    UnknownPlayer,
    #[error("player is banned: {0}")]
    Banned(String),
    #[error("authentication unavailable: {0}")]
    Unavailable(String),
    /// The authenticator dropped the request without answering
    #[error("authentication abandoned")]
    Abandoned,
}

/// Result of one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(AuthenticatedPlayer),
    Failed(AuthFailure),
}

impl AuthOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthOutcome::Authenticated(_))
    }
}

/// Validates login attempts.
pub trait Auth: Send + Sync {
    /// Starts validating `request`. The outcome is delivered through
    /// `completion`, possibly after this call returns.
    fn authenticate(&self, request: LoginRequest, completion: AuthCompletion);
}

impl Capability for dyn Auth {
    const ID: CapabilityId = CapabilityId::new("auth");
}

/// Single-use handle through which an authenticator reports its outcome.
#[derive(Debug)]
pub struct AuthCompletion {
    sender: Option<oneshot::Sender<AuthOutcome>>,
}

impl AuthCompletion {
    /// Creates a completion and the future that observes it.
    pub fn channel() -> (AuthCompletion, AuthPending) {
        let (sender, receiver) = oneshot::channel();
        (
            AuthCompletion {
                sender: Some(sender),
            },
            AuthPending { receiver },
        )
    }

    /// Delivers the outcome. Returns `false` if nobody is waiting for it
    /// any more.
    pub fn complete(mut self, outcome: AuthOutcome) -> bool {
        match self.sender.take() {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Whether the waiting side has lost interest.
    pub fn is_abandoned_by_caller(&self) -> bool {
        self.sender.as_ref().map_or(true, |sender| sender.is_closed())
    }
}

impl Drop for AuthCompletion {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(AuthOutcome::Failed(AuthFailure::Abandoned));
        }
    }
}

/// Resolves to the outcome of one login attempt.
#[derive(Debug)]
pub struct AuthPending {
    receiver: oneshot::Receiver<AuthOutcome>,
}

impl Future for AuthPending {
    type Output = AuthOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(AuthOutcome::Failed(AuthFailure::Abandoned)))
    }
}
