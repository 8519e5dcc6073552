use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{MacError, Result};

/// A device known to the broker, with its backend readiness.
#[derive(Debug)]
pub struct RegisteredService {
    id: String,
    ready: AtomicBool,
}

impl RegisteredService {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ready: AtomicBool::new(false),
        }
    }

    /// Device identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the backend has signalled readiness and is still connected.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Device identifier to service entry, shared by the broker loop and
/// device handles.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Arc<RegisteredService>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn services(&self) -> MutexGuard<'_, HashMap<String, Arc<RegisteredService>>> {
        // Entries are replaced whole, so a poisoned map is still consistent.
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a device, not ready. Fails if the identifier is already present.
    pub fn register(&self, id: &str) -> Result<Arc<RegisteredService>> {
        let mut services = self.services();
        if services.contains_key(id) {
            return Err(MacError::AlreadyRegistered(id.to_string()));
        }
        let service = Arc::new(RegisteredService::new(id));
        services.insert(id.to_string(), Arc::clone(&service));
        debug!(deveui = id, "service registered");
        Ok(service)
    }

    /// Mark a device's backend ready. Unknown identifiers are logged and ignored.
    pub fn mark_ready(&self, id: &str) -> bool {
        let services = self.services();
        match services.get(id) {
            Some(service) => {
                if !service.ready.swap(true, Ordering::AcqRel) {
                    info!(deveui = id, "backend ready");
                }
                true
            }
            None => {
                warn!(deveui = id, "ready signal from unregistered service");
                false
            }
        }
    }

    /// Mark a device's backend gone. Unknown identifiers are ignored.
    pub fn mark_disconnected(&self, id: &str) -> bool {
        let services = self.services();
        match services.get(id) {
            Some(service) => {
                if service.ready.swap(false, Ordering::AcqRel) {
                    info!(deveui = id, "backend disconnected");
                }
                true
            }
            None => false,
        }
    }

    /// Remove a device. Returns the removed entry, if any.
    pub fn deregister(&self, id: &str) -> Option<Arc<RegisteredService>> {
        let removed = self.services().remove(id);
        if let Some(service) = &removed {
            service.ready.store(false, Ordering::Release);
            debug!(deveui = id, "service deregistered");
        }
        removed
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<RegisteredService>> {
        self.services().get(id).cloned()
    }

    /// Whether the device is registered and ready.
    pub fn is_ready(&self, id: &str) -> bool {
        self.services().get(id).is_some_and(|s| s.is_ready())
    }

    pub fn len(&self) -> usize {
        self.services().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services().is_empty()
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services().keys().cloned().collect();
        ids.sort();
        ids
    }
}
