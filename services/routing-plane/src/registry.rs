//! Capability registry: router-type name → scheduler/driver implementation.
//!
//! Registered explicitly at startup and owned by the coordinator, replacing
//! dynamic by-string plugin loading. A failed lookup is memoized as absent so
//! unresolvable references fail fast without repeated resolution attempts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::capabilities::{DeviceManager, RouterDriver, RouterScheduler, RoutersNotifier};

/// Errors resolving capabilities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("no scheduler registered for router type {0:?}")]
    SchedulerNotFound(String),

    #[error("no driver registered for router type {0:?}")]
    DriverNotFound(String),
}

/// Registry of pluggable collaborators, keyed by router-type name (schedulers
/// and drivers) or agent type (notifiers).
#[derive(Default)]
pub struct CapabilityRegistry {
    // None caches a failed resolution.
    schedulers: RwLock<HashMap<String, Option<Arc<dyn RouterScheduler>>>>,
    drivers: RwLock<HashMap<String, Option<Arc<dyn RouterDriver>>>>,
    device_managers: RwLock<Vec<Arc<dyn DeviceManager>>>,
    notifiers: RwLock<HashMap<String, Arc<dyn RoutersNotifier>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_scheduler(&self, router_type: &str, scheduler: Arc<dyn RouterScheduler>) {
        self.schedulers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(router_type.to_string(), Some(scheduler));
    }

    pub fn register_driver(&self, router_type: &str, driver: Arc<dyn RouterDriver>) {
        self.drivers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(router_type.to_string(), Some(driver));
    }

    pub fn register_device_manager(&self, manager: Arc<dyn DeviceManager>) {
        self.device_managers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(manager);
    }

    pub fn register_notifier(&self, agent_type: &str, notifier: Arc<dyn RoutersNotifier>) {
        self.notifiers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_type.to_string(), notifier);
    }

    /// Scheduler for a router type. Memoizes absence.
    pub fn scheduler(&self, router_type: &str) -> Result<Arc<dyn RouterScheduler>, CapabilityError> {
        let mut map = self.schedulers.write().unwrap_or_else(|e| e.into_inner());
        match map.get(router_type) {
            Some(Some(scheduler)) => Ok(Arc::clone(scheduler)),
            Some(None) => Err(CapabilityError::SchedulerNotFound(router_type.to_string())),
            None => {
                debug!(router_type, "Caching absent scheduler");
                map.insert(router_type.to_string(), None);
                Err(CapabilityError::SchedulerNotFound(router_type.to_string()))
            }
        }
    }

    /// Driver for a router type. Memoizes absence.
    pub fn driver(&self, router_type: &str) -> Result<Arc<dyn RouterDriver>, CapabilityError> {
        let mut map = self.drivers.write().unwrap_or_else(|e| e.into_inner());
        match map.get(router_type) {
            Some(Some(driver)) => Ok(Arc::clone(driver)),
            Some(None) => Err(CapabilityError::DriverNotFound(router_type.to_string())),
            None => {
                debug!(router_type, "Caching absent driver");
                map.insert(router_type.to_string(), None);
                Err(CapabilityError::DriverNotFound(router_type.to_string()))
            }
        }
    }

    /// All registered device managers.
    pub fn device_managers(&self) -> Vec<Arc<dyn DeviceManager>> {
        self.device_managers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// All registered notifiers, with their agent types.
    pub fn notifiers(&self) -> Vec<(String, Arc<dyn RoutersNotifier>)> {
        self.notifiers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Clears every registration and memoized absence (test hook).
    pub fn reset(&self) {
        self.schedulers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.drivers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.device_managers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.notifiers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
