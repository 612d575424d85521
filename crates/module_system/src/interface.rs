//! Exclusive capability registry.
//!
//! Maps a [`CapabilityId`] to its single active implementation. Lookups are
//! the hot path: every module servicing a request calls [`InterfaceRegistry::get`]
//! and later releases the reference, while registration only happens at
//! load and unload boundaries. Entries live in a sharded concurrent map and
//! each carries its own atomic reference count, so a lookup holds one shard
//! read lock for a handful of instructions and never awaits.
//!
//! The registry stores a weak view of each implementation. The strong handle
//! stays with the publishing module's context, so ownership of the instance
//! never moves into the registry.

use crate::capability::{Capability, CapabilityId, RefCount};
use crate::error::RegistryError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Identifies one registration so that only its creator can remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceToken {
    id: CapabilityId,
    serial: u64,
}

impl InterfaceToken {
    /// The capability this token was issued for.
    pub fn capability(&self) -> CapabilityId {
        self.id
    }
}

struct InterfaceEntry {
    id: CapabilityId,
    serial: u64,
    owner: String,
    /// A `Weak<T>` for the registered contract type
    instance: Box<dyn Any + Send + Sync>,
    refs: RefCount,
}

/// Registry of exclusive capabilities.
pub struct InterfaceRegistry {
    entries: DashMap<CapabilityId, Arc<InterfaceEntry>>,
    next_serial: AtomicU64,
}

impl InterfaceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Publishes `instance` as the implementation of `T`.
    ///
    /// The registry keeps only a weak handle; the caller must keep `instance`
    /// alive for as long as the registration should resolve.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] when `T` already has an active
    /// implementation.
    pub fn register<T>(&self, instance: &Arc<T>, owner: &str) -> Result<InterfaceToken, RegistryError>
    where
        T: Capability + ?Sized,
    {
        match self.entries.entry(T::ID) {
            Entry::Occupied(existing) => Err(RegistryError::Duplicate {
                id: T::ID,
                owner: existing.get().owner.clone(),
            }),
            Entry::Vacant(slot) => {
                let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                slot.insert(Arc::new(InterfaceEntry {
                    id: T::ID,
                    serial,
                    owner: owner.to_string(),
                    instance: Box::new(Arc::downgrade(instance)),
                    refs: RefCount::new(),
                }));
                debug!("Module {} registered interface {}", owner, T::ID);
                Ok(InterfaceToken { id: T::ID, serial })
            }
        }
    }

    /// Removes a registration.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Busy`] while references are outstanding, or
    /// [`RegistryError::UnknownToken`] if the token is stale.
    pub fn unregister(&self, token: &InterfaceToken) -> Result<(), RegistryError> {
        match self.entries.entry(token.id) {
            Entry::Occupied(entry) if entry.get().serial == token.serial => {
                entry
                    .get()
                    .refs
                    .retire()
                    .map_err(|refs| RegistryError::Busy { id: token.id, refs })?;
                let (_, removed) = entry.remove_entry();
                debug!("Module {} unregistered interface {}", removed.owner, token.id);
                Ok(())
            }
            _ => Err(RegistryError::UnknownToken(token.id)),
        }
    }

    /// Looks up the current implementation of `T` and takes a reference on
    /// it. The reference must be released (or dropped) before the owning
    /// module can be unloaded.
    pub fn get<T>(&self) -> Result<InterfaceRef<T>, RegistryError>
    where
        T: Capability + ?Sized,
    {
        let entry = self.entries.get(&T::ID).ok_or(RegistryError::NotFound(T::ID))?;
        let weak = entry
            .instance
            .downcast_ref::<Weak<T>>()
            .ok_or(RegistryError::TypeMismatch(T::ID))?;
        let instance = weak.upgrade().ok_or(RegistryError::NotFound(T::ID))?;
        if !entry.refs.acquire() {
            return Err(RegistryError::NotFound(T::ID));
        }

        Ok(InterfaceRef {
            instance,
            entry: Arc::clone(entry.value()),
            released: false,
        })
    }

    /// Gives back a reference obtained from [`InterfaceRegistry::get`].
    pub fn release<T>(&self, reference: InterfaceRef<T>) -> Result<(), RegistryError>
    where
        T: Capability + ?Sized,
    {
        reference.release()
    }

    /// Outstanding reference count of a registration, if it is still present.
    pub fn outstanding(&self, token: &InterfaceToken) -> Option<usize> {
        self.entries
            .get(&token.id)
            .filter(|entry| entry.serial == token.serial)
            .map(|entry| entry.refs.outstanding())
    }

    /// Outstanding reference count of whatever currently provides `id`.
    pub fn outstanding_of(&self, id: CapabilityId) -> Option<usize> {
        self.entries.get(&id).map(|entry| entry.refs.outstanding())
    }

    /// Name of the module that currently provides `id`.
    pub fn owner_of(&self, id: CapabilityId) -> Option<String> {
        self.entries.get(&id).map(|entry| entry.owner.clone())
    }

    /// Whether `id` currently has a registration.
    pub fn contains(&self, id: CapabilityId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hides a registration from lookups if it has no outstanding references.
    ///
    /// Taken under the shard write lock, so no lookup can slip in between
    /// the count check and the flag.
    pub(crate) fn retire(&self, token: &InterfaceToken) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(&token.id)
            .filter(|entry| entry.serial == token.serial)
            .ok_or(RegistryError::UnknownToken(token.id))?;
        entry
            .refs
            .retire()
            .map_err(|refs| RegistryError::Busy { id: token.id, refs })
    }

    /// Undoes [`InterfaceRegistry::retire`].
    pub(crate) fn restore(&self, token: &InterfaceToken) {
        if let Some(entry) = self.entries.get(&token.id) {
            if entry.serial == token.serial {
                entry.refs.restore();
            }
        }
    }

    /// Removes a registration regardless of its count. Returns the number of
    /// references that were still outstanding.
    pub(crate) fn force_remove(&self, token: &InterfaceToken) -> Option<usize> {
        let (_, entry) = self
            .entries
            .remove_if(&token.id, |_, entry| entry.serial == token.serial)?;
        entry.refs.retire().err().or(Some(0))
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("registrations", &self.entries.len())
            .finish()
    }
}

/// A counted reference to an exclusive capability.
///
/// Dereferences to the implementation. Dropping the reference releases it;
/// [`InterfaceRef::release`] does the same and reports the result.
pub struct InterfaceRef<T: ?Sized> {
    instance: Arc<T>,
    entry: Arc<InterfaceEntry>,
    released: bool,
}

impl<T: ?Sized> InterfaceRef<T> {
    /// The capability this reference was obtained for.
    pub fn capability(&self) -> CapabilityId {
        self.entry.id
    }

    /// The module providing the implementation.
    pub fn owner(&self) -> &str {
        &self.entry.owner
    }

    /// Releases the reference.
    pub fn release(mut self) -> Result<(), RegistryError> {
        self.released = true;
        self.entry.refs.release(self.entry.id).map(|_| ())
    }
}

impl<T: ?Sized> Deref for InterfaceRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.instance
    }
}

impl<T: ?Sized> Drop for InterfaceRef<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.entry.refs.release(self.entry.id) {
            warn!("Dropping reference to {}: {}", self.entry.id, e);
        }
    }
}

impl<T: ?Sized> fmt::Debug for InterfaceRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceRef")
            .field("capability", &self.entry.id)
            .field("owner", &self.entry.owner)
            .finish()
    }
}
