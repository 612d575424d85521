//! Points awarded for kills.
//!
//! Kill points are an advisor capability: every registered implementation is
//! consulted and their awards add up.

use super::types::{ArenaId, PlayerId};
use crate::capability::{Capability, CapabilityId};
use crate::context::Broker;
use crate::error::RegistryError;

/// What happened in one kill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillContext {
    pub arena: ArenaId,
    pub killer: PlayerId,
    pub killed: PlayerId,
    /// Bounty carried by the killed player
    pub bounty: i32,
    /// Flags carried by the killed player
    pub flags: u32,
}

/// Points, and possibly a prize, awarded for a kill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillReward {
    pub points: i32,
    pub prize: Option<i16>,
}

pub trait KillPoints: Send + Sync {
    fn kill_points(&self, kill: &KillContext) -> KillReward;
}

impl Capability for dyn KillPoints {
    const ID: CapabilityId = CapabilityId::new("kill-points");
}

/// Consults every kill-points advisor in priority order. Points add up; the
/// first advisor that names a prize decides it.
pub fn award_kill(broker: &Broker, kill: &KillContext) -> Result<KillReward, RegistryError> {
    let advisors = broker.get_advisors::<dyn KillPoints>()?;
    let reward = advisors
        .iter()
        .map(|advisor| advisor.kill_points(kill))
        .fold(KillReward::default(), |total, reward| KillReward {
            points: total.points.saturating_add(reward.points),
            prize: total.prize.or(reward.prize),
        });
    Ok(reward)
}
