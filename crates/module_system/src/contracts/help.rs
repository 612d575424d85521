use crate::capability::{Capability, CapabilityId};

/// Exposes the configured help command.
pub trait Help: Send + Sync {
    /// Name of the help command, without the leading `?`.
    fn help_command(&self) -> &str;
}

impl Capability for dyn Help {
    const ID: CapabilityId = CapabilityId::new("help");
}
