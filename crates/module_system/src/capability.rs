//! Capability identities and the per-registration reference counter.
//!
//! Every contract a module can publish is keyed by a stable name rather than
//! by its Rust type. The contract's trait object implements [`Capability`]
//! and carries that name, so registries can be queried with nothing more
//! than the type:
//!
//! ```rust
//! use module_system::{Capability, CapabilityId};
//!
//! pub trait Greeter: Send + Sync {
//!     fn greet(&self, who: &str) -> String;
//! }
//!
//! impl Capability for dyn Greeter {
//!     const ID: CapabilityId = CapabilityId::new("greeter");
//! }
//! ```

use crate::error::RegistryError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Stable identity of a capability contract.
///
/// Only one version of a contract may exist per identity; modules built
/// against a different shape of the same contract must use a new name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityId(&'static str);

impl CapabilityId {
    /// Creates an identity from a static name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the identity as a string slice.
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A contract that can be published through the registries.
///
/// Implemented for the contract's trait object (`dyn Trait`), which ties the
/// identity to the Rust type used for lookups.
pub trait Capability: Send + Sync + 'static {
    /// The identity this contract is registered under.
    const ID: CapabilityId;
}

/// Outstanding-reference bookkeeping shared by one registration and every
/// reference handed out for it.
///
/// `acquire` only happens while the owning registry holds the registration's
/// shard lock, which is what makes the `retire` check race-free.
#[derive(Debug, Default)]
pub(crate) struct RefCount {
    refs: AtomicUsize,
    retired: AtomicBool,
}

impl RefCount {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Takes one reference unless the registration has been retired.
    pub(crate) fn acquire(&self) -> bool {
        if self.retired.load(Ordering::Acquire) {
            return false;
        }
        self.refs.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Gives back one reference.
    pub(crate) fn release(&self, id: CapabilityId) -> Result<usize, RegistryError> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| RegistryError::ReferenceUnderflow(id))
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Marks the registration as going away. Fails with the live count if
    /// any reference is outstanding.
    pub(crate) fn retire(&self) -> Result<(), usize> {
        let refs = self.refs.load(Ordering::Acquire);
        if refs > 0 {
            return Err(refs);
        }
        self.retired.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn restore(&self) {
        self.retired.store(false, Ordering::Release);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}
