use crate::capability::{Capability, CapabilityId};

/// Random number source shared by game modules.
pub trait Prng: Send + Sync {
    /// Fills `buf` from a cryptographically secure source. Returns `false`
    /// if no secure source is available.
    fn fill_secure(&self, buf: &mut [u8]) -> bool;

    /// Fills `buf` from the fast generator.
    fn fill_fast(&self, buf: &mut [u8]);

    /// A value in `[0, bound)`; `0` when `bound` is `0`.
    fn below(&self, bound: u32) -> u32;

    fn next_u32(&self) -> u32;

    /// A value in `[0, 1)`.
    fn uniform(&self) -> f64;
}

impl Capability for dyn Prng {
    const ID: CapabilityId = CapabilityId::new("prng");
}
