use crate::capability::{Capability, CapabilityId};
use std::io;

/// Control over the active log sink.
pub trait LogFile: Send + Sync {
    fn flush(&self) -> io::Result<()>;

    /// Closes and reopens the sink, e.g. after log rotation.
    fn reopen(&self) -> io::Result<()>;
}

impl Capability for dyn LogFile {
    const ID: CapabilityId = CapabilityId::new("log-file");
}
