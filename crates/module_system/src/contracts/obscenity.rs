use crate::capability::{Capability, CapabilityId};

/// Filters offensive words out of player text.
pub trait ObscenityFilter: Send + Sync {
    /// Replaces offensive words in place. Returns whether anything was
    /// replaced.
    fn filter(&self, text: &mut String) -> bool;
}

impl Capability for dyn ObscenityFilter {
    const ID: CapabilityId = CapabilityId::new("obscenity");
}
