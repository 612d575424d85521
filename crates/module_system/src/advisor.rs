//! Non-exclusive capability registry.
//!
//! Several modules may publish an implementation of the same advisor
//! capability; consumers consult all of them. Each identity maps to an
//! immutable, priority-sorted list that is replaced wholesale on every
//! register/unregister. [`AdvisorRegistry::get_advisors`] hands out a
//! snapshot of that list, so a consumer iterates without holding any lock and
//! a concurrent change can only make its view stale, never inconsistent.
//!
//! Ordering is ascending priority, ties broken by registration order.

use crate::capability::{Capability, CapabilityId, RefCount};
use crate::error::RegistryError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Identifies one advisor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvisorToken {
    id: CapabilityId,
    seq: u64,
}

impl AdvisorToken {
    /// The capability this token was issued for.
    pub fn capability(&self) -> CapabilityId {
        self.id
    }
}

struct AdvisorEntry {
    id: CapabilityId,
    seq: u64,
    priority: i32,
    owner: String,
    /// A `Weak<T>` for the registered contract type
    instance: Box<dyn Any + Send + Sync>,
    refs: RefCount,
}

type AdvisorList = Arc<[Arc<AdvisorEntry>]>;

/// Registry of advisor capabilities.
pub struct AdvisorRegistry {
    lists: DashMap<CapabilityId, AdvisorList>,
    next_seq: AtomicU64,
}

impl AdvisorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            lists: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Adds `instance` to the advisors of `T`. Lower priorities are consulted
    /// first.
    pub fn register<T>(&self, instance: &Arc<T>, owner: &str, priority: i32) -> AdvisorToken
    where
        T: Capability + ?Sized,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(AdvisorEntry {
            id: T::ID,
            seq,
            priority,
            owner: owner.to_string(),
            instance: Box::new(Arc::downgrade(instance)),
            refs: RefCount::new(),
        });

        let mut list = self.lists.entry(T::ID).or_insert_with(|| Arc::from(Vec::new()));
        let mut entries = list.to_vec();
        entries.push(entry);
        entries.sort_by_key(|entry| (entry.priority, entry.seq));
        *list = entries.into();

        debug!(
            "Module {} registered advisor {} with priority {}",
            owner,
            T::ID,
            priority
        );
        AdvisorToken { id: T::ID, seq }
    }

    /// Removes an advisor registration.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Busy`] while a snapshot containing it is alive, or
    /// [`RegistryError::UnknownToken`] if the token is stale.
    pub fn unregister(&self, token: &AdvisorToken) -> Result<(), RegistryError> {
        match self.lists.entry(token.id) {
            Entry::Occupied(mut list) => {
                let entry = list
                    .get()
                    .iter()
                    .find(|entry| entry.seq == token.seq)
                    .cloned()
                    .ok_or(RegistryError::UnknownToken(token.id))?;
                entry
                    .refs
                    .retire()
                    .map_err(|refs| RegistryError::Busy { id: token.id, refs })?;

                let remaining: Vec<_> = list
                    .get()
                    .iter()
                    .filter(|other| other.seq != token.seq)
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    list.remove();
                } else {
                    list.insert(remaining.into());
                }
                debug!("Module {} unregistered advisor {}", entry.owner, token.id);
                Ok(())
            }
            Entry::Vacant(_) => Err(RegistryError::UnknownToken(token.id)),
        }
    }

    /// Returns a snapshot of every live advisor of `T`, in consultation
    /// order. Each advisor in the snapshot holds one outstanding reference
    /// until the snapshot is released or dropped.
    ///
    /// # Errors
    ///
    /// [`RegistryError::TypeMismatch`] if an advisor was registered under the
    /// same identity with a different type.
    pub fn get_advisors<T>(&self) -> Result<AdvisorSnapshot<T>, RegistryError>
    where
        T: Capability + ?Sized,
    {
        let mut snapshot = AdvisorSnapshot {
            id: T::ID,
            items: Vec::new(),
            released: false,
        };
        let Some(list) = self.lists.get(&T::ID) else {
            return Ok(snapshot);
        };

        snapshot.items.reserve(list.len());
        for entry in list.iter() {
            let weak = entry
                .instance
                .downcast_ref::<Weak<T>>()
                .ok_or(RegistryError::TypeMismatch(T::ID))?;
            let Some(instance) = weak.upgrade() else {
                continue;
            };
            if entry.refs.acquire() {
                snapshot.items.push(AdvisorItem {
                    instance,
                    entry: Arc::clone(entry),
                });
            }
        }
        Ok(snapshot)
    }

    /// Gives back every reference held by a snapshot.
    pub fn release<T>(&self, snapshot: AdvisorSnapshot<T>) -> Result<(), RegistryError>
    where
        T: Capability + ?Sized,
    {
        snapshot.release()
    }

    /// Outstanding reference count of a registration, if still present.
    pub fn outstanding(&self, token: &AdvisorToken) -> Option<usize> {
        self.find(token).map(|entry| entry.refs.outstanding())
    }

    /// Number of advisors registered under `id`.
    pub fn count(&self, id: CapabilityId) -> usize {
        self.lists.get(&id).map_or(0, |list| list.len())
    }

    /// Number of identities with at least one advisor.
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    /// Whether no advisor is registered.
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    fn find(&self, token: &AdvisorToken) -> Option<Arc<AdvisorEntry>> {
        self.lists
            .get(&token.id)?
            .iter()
            .find(|entry| entry.seq == token.seq)
            .cloned()
    }

    /// Hides an advisor from new snapshots if it has no outstanding
    /// references. Runs under the list's shard write lock.
    pub(crate) fn retire(&self, token: &AdvisorToken) -> Result<(), RegistryError> {
        let list = self
            .lists
            .get_mut(&token.id)
            .ok_or(RegistryError::UnknownToken(token.id))?;
        let entry = list
            .iter()
            .find(|entry| entry.seq == token.seq)
            .ok_or(RegistryError::UnknownToken(token.id))?;
        entry
            .refs
            .retire()
            .map_err(|refs| RegistryError::Busy { id: token.id, refs })
    }

    /// Undoes [`AdvisorRegistry::retire`].
    pub(crate) fn restore(&self, token: &AdvisorToken) {
        if let Some(entry) = self.find(token) {
            entry.refs.restore();
        }
    }

    /// Removes an advisor regardless of its count. Returns the number of
    /// references that were still outstanding.
    pub(crate) fn force_remove(&self, token: &AdvisorToken) -> Option<usize> {
        match self.lists.entry(token.id) {
            Entry::Occupied(mut list) => {
                let entry = list
                    .get()
                    .iter()
                    .find(|entry| entry.seq == token.seq)
                    .cloned()?;
                let remaining: Vec<_> = list
                    .get()
                    .iter()
                    .filter(|other| other.seq != token.seq)
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    list.remove();
                } else {
                    list.insert(remaining.into());
                }
                entry.refs.retire().err().or(Some(0))
            }
            Entry::Vacant(_) => None,
        }
    }
}

impl Default for AdvisorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AdvisorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvisorRegistry")
            .field("capabilities", &self.lists.len())
            .finish()
    }
}

struct AdvisorItem<T: ?Sized> {
    instance: Arc<T>,
    entry: Arc<AdvisorEntry>,
}

/// An immutable, ordered view of the advisors of one capability.
pub struct AdvisorSnapshot<T: ?Sized> {
    id: CapabilityId,
    items: Vec<AdvisorItem<T>>,
    released: bool,
}

impl<T: ?Sized> AdvisorSnapshot<T> {
    /// The capability the snapshot was taken for.
    pub fn capability(&self) -> CapabilityId {
        self.id
    }

    /// Advisors in consultation order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter().map(|item| &*item.instance)
    }

    /// Advisors paired with their priority and owning module.
    pub fn entries(&self) -> impl Iterator<Item = (i32, &str, &T)> + '_ {
        self.items
            .iter()
            .map(|item| (item.entry.priority, item.entry.owner.as_str(), &*item.instance))
    }

    /// Registration tokens in consultation order; two snapshots with equal
    /// tokens saw the same list.
    pub fn tokens(&self) -> Vec<AdvisorToken> {
        self.items
            .iter()
            .map(|item| AdvisorToken {
                id: item.entry.id,
                seq: item.entry.seq,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Releases every reference held by the snapshot.
    pub fn release(mut self) -> Result<(), RegistryError> {
        self.released = true;
        let mut result = Ok(());
        for item in &self.items {
            if let Err(e) = item.entry.refs.release(item.entry.id) {
                result = Err(e);
            }
        }
        result
    }
}

impl<T: ?Sized> Drop for AdvisorSnapshot<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        for item in &self.items {
            if let Err(e) = item.entry.refs.release(item.entry.id) {
                warn!("Dropping advisor snapshot for {}: {}", self.id, e);
            }
        }
    }
}

impl<T: ?Sized> fmt::Debug for AdvisorSnapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvisorSnapshot")
            .field("capability", &self.id)
            .field("advisors", &self.items.len())
            .finish()
    }
}
