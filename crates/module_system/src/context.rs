//! The broker shared by every module, and the per-module view of it.
//!
//! The host builds one [`Broker`] at startup and hands it to the loader.
//! Each loaded module receives its own [`ModuleContext`], which fills in the
//! owner of every registration and remembers what the module published so
//! the loader can take it down again in reverse order.

use crate::advisor::{AdvisorRegistry, AdvisorSnapshot, AdvisorToken};
use crate::capability::{Capability, CapabilityId};
use crate::error::{ModuleError, RegistryError};
use crate::interface::{InterfaceRef, InterfaceRegistry, InterfaceToken};
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, warn};

/// Holds the interface and advisor registries.
#[derive(Debug, Default)]
pub struct Broker {
    interfaces: InterfaceRegistry,
    advisors: AdvisorRegistry,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interfaces(&self) -> &InterfaceRegistry {
        &self.interfaces
    }

    pub fn advisors(&self) -> &AdvisorRegistry {
        &self.advisors
    }

    /// Shorthand for [`InterfaceRegistry::get`].
    pub fn get_interface<T>(&self) -> Result<InterfaceRef<T>, RegistryError>
    where
        T: Capability + ?Sized,
    {
        self.interfaces.get::<T>()
    }

    /// Shorthand for [`AdvisorRegistry::get_advisors`].
    pub fn get_advisors<T>(&self) -> Result<AdvisorSnapshot<T>, RegistryError>
    where
        T: Capability + ?Sized,
    {
        self.advisors.get_advisors::<T>()
    }
}

/// A registration made by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationToken {
    Interface(InterfaceToken),
    Advisor(AdvisorToken),
}

impl RegistrationToken {
    pub fn capability(&self) -> CapabilityId {
        match self {
            RegistrationToken::Interface(token) => token.capability(),
            RegistrationToken::Advisor(token) => token.capability(),
        }
    }
}

struct Registration {
    token: RegistrationToken,
    /// The strong `Arc<T>` the registry only holds weakly
    _instance: Box<dyn Any + Send + Sync>,
}

/// A module's view of the broker.
pub struct ModuleContext {
    module: String,
    broker: Arc<Broker>,
    registrations: Mutex<Vec<Registration>>,
}

impl ModuleContext {
    pub(crate) fn new(module: &str, broker: Arc<Broker>) -> Self {
        Self {
            module: module.to_string(),
            broker,
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Name of the module this context belongs to.
    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Publishes an exclusive capability owned by this module.
    pub fn register_interface<T>(&self, instance: Arc<T>) -> Result<InterfaceToken, ModuleError>
    where
        T: Capability + ?Sized,
    {
        let token = self.broker.interfaces.register::<T>(&instance, &self.module)?;
        self.record(RegistrationToken::Interface(token), Box::new(instance));
        Ok(token)
    }

    /// Withdraws an exclusive capability before teardown.
    pub fn unregister_interface(&self, token: &InterfaceToken) -> Result<(), ModuleError> {
        self.broker.interfaces.unregister(token)?;
        self.forget(RegistrationToken::Interface(*token));
        Ok(())
    }

    /// Publishes an advisor owned by this module.
    pub fn register_advisor<T>(&self, instance: Arc<T>, priority: i32) -> AdvisorToken
    where
        T: Capability + ?Sized,
    {
        let token = self.broker.advisors.register::<T>(&instance, &self.module, priority);
        self.record(RegistrationToken::Advisor(token), Box::new(instance));
        token
    }

    /// Withdraws an advisor before teardown.
    pub fn unregister_advisor(&self, token: &AdvisorToken) -> Result<(), ModuleError> {
        self.broker.advisors.unregister(token)?;
        self.forget(RegistrationToken::Advisor(*token));
        Ok(())
    }

    /// Looks up an exclusive capability published by any module.
    pub fn get_interface<T>(&self) -> Result<InterfaceRef<T>, RegistryError>
    where
        T: Capability + ?Sized,
    {
        self.broker.get_interface::<T>()
    }

    /// Snapshot of the advisors of `T` published by any module.
    pub fn get_advisors<T>(&self) -> Result<AdvisorSnapshot<T>, RegistryError>
    where
        T: Capability + ?Sized,
    {
        self.broker.get_advisors::<T>()
    }

    /// Registrations made by this module, in registration order.
    pub fn registrations(&self) -> Vec<RegistrationToken> {
        self.lock().iter().map(|r| r.token).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, token: RegistrationToken, instance: Box<dyn Any + Send + Sync>) {
        self.lock().push(Registration {
            token,
            _instance: instance,
        });
    }

    fn forget(&self, token: RegistrationToken) {
        self.lock().retain(|r| r.token != token);
    }

    /// Hides every registration of this module from new lookups. Either all
    /// of them are retired or none is.
    ///
    /// Returns the first busy capability and its outstanding count.
    pub(crate) fn retire_registrations(&self) -> Result<(), (CapabilityId, usize)> {
        let tokens = self.registrations();
        for (index, token) in tokens.iter().enumerate() {
            let result = match token {
                RegistrationToken::Interface(t) => self.broker.interfaces.retire(t),
                RegistrationToken::Advisor(t) => self.broker.advisors.retire(t),
            };
            let refs = match result {
                Ok(()) => continue,
                Err(RegistryError::Busy { refs, .. }) => refs,
                Err(e) => {
                    // Registration vanished underneath us; nothing to hold back.
                    warn!("Module {}: {}", self.module, e);
                    continue;
                }
            };
            for retired in &tokens[..index] {
                self.restore_one(retired);
            }
            return Err((token.capability(), refs));
        }
        Ok(())
    }

    /// Undoes [`ModuleContext::retire_registrations`].
    pub(crate) fn restore_registrations(&self) {
        for token in self.registrations() {
            self.restore_one(&token);
        }
    }

    fn restore_one(&self, token: &RegistrationToken) {
        match token {
            RegistrationToken::Interface(t) => self.broker.interfaces.restore(t),
            RegistrationToken::Advisor(t) => self.broker.advisors.restore(t),
        }
    }

    /// Removes every registration in reverse order and drops the published
    /// instances. Registrations must have been retired first.
    pub(crate) fn remove_registrations(&self) {
        let registrations = std::mem::take(&mut *self.lock());
        for registration in registrations.iter().rev() {
            let result = match &registration.token {
                RegistrationToken::Interface(t) => self.broker.interfaces.unregister(t),
                RegistrationToken::Advisor(t) => self.broker.advisors.unregister(t),
            };
            if let Err(e) = result {
                error!("Module {}: failed to unregister: {}", self.module, e);
                self.force_remove_one(&registration.token);
            }
        }
    }

    /// Removes every registration in reverse order regardless of outstanding
    /// references. Used when unwinding a failed load.
    pub(crate) fn force_remove_registrations(&self) {
        let registrations = std::mem::take(&mut *self.lock());
        for registration in registrations.iter().rev() {
            self.force_remove_one(&registration.token);
        }
    }

    fn force_remove_one(&self, token: &RegistrationToken) {
        let leaked = match token {
            RegistrationToken::Interface(t) => self.broker.interfaces.force_remove(t),
            RegistrationToken::Advisor(t) => self.broker.advisors.force_remove(t),
        };
        if let Some(refs) = leaked.filter(|refs| *refs > 0) {
            error!(
                "Module {}: removed {} with {} references still outstanding",
                self.module,
                token.capability(),
                refs
            );
        }
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module", &self.module)
            .field("registrations", &self.lock().len())
            .finish()
    }
}
