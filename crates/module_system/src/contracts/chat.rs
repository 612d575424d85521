//! Chat message transport.

use super::types::{ArenaId, PlayerId};
use crate::capability::{Capability, CapabilityId};
use std::sync::Arc;

/// Receives chat messages of one type from a player.
pub type ChatHandler = Arc<dyn Fn(PlayerId, &str) + Send + Sync>;

/// Routes chat messages between players and the modules handling them.
pub trait ChatNet: Send + Sync {
    /// Subscribes `handler` to messages of `message_type`.
    fn add_handler(&self, message_type: &str, handler: ChatHandler);

    /// Removes a handler added earlier. Handlers are compared by identity.
    fn remove_handler(&self, message_type: &str, handler: &ChatHandler);

    fn send_to_one(&self, player: PlayerId, message: &str);

    /// Sends to everybody in `arena` except `except`.
    fn send_to_arena(&self, arena: ArenaId, except: Option<PlayerId>, message: &str);

    fn send_to_set(&self, players: &[PlayerId], message: &str);
}

impl Capability for dyn ChatNet {
    const ID: CapabilityId = CapabilityId::new("chatnet");
}
