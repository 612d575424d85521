//! Player display banners.

use super::types::PlayerId;
use crate::capability::{Capability, CapabilityId};
use crate::context::Broker;
use crate::error::RegistryError;

/// Size of a banner bitmap in bytes.
pub const BANNER_SIZE: usize = 96;

/// A player's display banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner(pub [u8; BANNER_SIZE]);

impl Default for Banner {
    fn default() -> Self {
        Banner([0; BANNER_SIZE])
    }
}

/// Stores banners and broadcasts them to other players.
pub trait Banners: Send + Sync {
    fn get_banner(&self, player: PlayerId) -> Option<Banner>;

    /// Replaces a player's banner. `from_player` is false when the banner
    /// was set by the server rather than uploaded by the client.
    fn set_banner(&self, player: PlayerId, banner: Banner, from_player: bool);

    /// Broadcasts the player's banner if the player is eligible to show one.
    /// Returns whether it was sent.
    fn check_and_send_banner(&self, player: PlayerId) -> bool;
}

impl Capability for dyn Banners {
    const ID: CapabilityId = CapabilityId::new("banners");
}

/// Decides whether a player may display a banner.
pub trait BannerAdvisor: Send + Sync {
    fn banner_allowed(&self, player: PlayerId) -> bool;
}

impl Capability for dyn BannerAdvisor {
    const ID: CapabilityId = CapabilityId::new("banner-advisor");
}

/// Asks every banner advisor, in priority order, whether `player` may show a
/// banner. Any refusal wins; with no advisors registered the answer is yes.
pub fn banner_allowed(broker: &Broker, player: PlayerId) -> Result<bool, RegistryError> {
    let advisors = broker.get_advisors::<dyn BannerAdvisor>()?;
    let allowed = advisors.iter().all(|advisor| advisor.banner_allowed(player));
    Ok(allowed)
}
