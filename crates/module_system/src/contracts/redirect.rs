//! Moving players to other zones or arenas.

use super::types::PlayerId;
use crate::capability::{Capability, CapabilityId};
use std::net::SocketAddr;

/// Where to send a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectTarget {
    /// A named destination from the redirect configuration
    Alias(String),
    /// A raw zone address, optionally into a specific arena
    Address {
        address: SocketAddr,
        arena_type: i16,
        arena_name: Option<String>,
    },
    /// An arena change within the current zone
    Arena(String),
}

pub trait Redirect: Send + Sync {
    /// Sends a protocol-level redirect. Returns `false` if the target could
    /// not be resolved.
    fn redirect(&self, player: PlayerId, target: &RedirectTarget) -> bool;
}

impl Capability for dyn Redirect {
    const ID: CapabilityId = CapabilityId::new("redirect");
}
