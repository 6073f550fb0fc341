//! Pluggable collaborator capabilities.
//!
//! Scheduler and driver implementations are selected per router type through
//! the [`CapabilityRegistry`](crate::registry::CapabilityRegistry). Driver and
//! notifier calls are fire-and-forget: failures are logged by the caller,
//! never rolled back.

use async_trait::async_trait;

use netfab_id::{DeviceId, RouterId, TemplateId};

use crate::model::{HostingDevice, RouterBinding, RouterType};
use crate::store::{BindingStore, StoreError};

/// Chooses hosting devices for routers of one router type.
#[async_trait]
pub trait RouterScheduler: Send + Sync {
    /// Ranked candidate devices able to host the router; empty when no
    /// running device qualifies.
    async fn select_hosting_devices(
        &self,
        store: &BindingStore,
        binding: &RouterBinding,
        router_type: &RouterType,
        slots_needed: u32,
    ) -> Result<Vec<DeviceId>, StoreError>;

    /// Approves removal of a router from its device. Returning false leaves
    /// the binding untouched; the caller must retry.
    async fn unschedule(
        &self,
        store: &BindingStore,
        binding: &RouterBinding,
    ) -> Result<bool, StoreError>;
}

/// Lifecycle hooks fired after scheduling state changes commit.
#[async_trait]
pub trait RouterDriver: Send + Sync {
    async fn on_router_created(&self, binding: &RouterBinding) {
        let _ = binding;
    }

    async fn on_router_updated(&self, binding: &RouterBinding) {
        let _ = binding;
    }

    async fn on_router_deleted(&self, binding: &RouterBinding) {
        let _ = binding;
    }

    async fn on_router_scheduled(&self, binding: &RouterBinding, device: &HostingDevice);

    async fn on_router_unscheduled(&self, binding: &RouterBinding, device: &HostingDevice);
}

/// External manager of hosting-device inventory.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Signals that scheduling failed for lack of capacity on devices of a
    /// template, so more capacity can be provisioned out of band.
    async fn report_capacity_shortage(&self, template_id: &TemplateId, slots_needed: u32);

    /// Device details, when this manager tracks them.
    async fn get_device_info(&self, device_id: &DeviceId) -> Option<HostingDevice> {
        let _ = device_id;
        None
    }
}

/// Downstream listener notified of router scheduling changes.
///
/// One registration per agent type; the reconciler batches per-tick updates
/// into a single call per listener.
#[async_trait]
pub trait RoutersNotifier: Send + Sync {
    async fn routers_updated(&self, router_ids: &[RouterId], operation: &str);

    async fn router_deleted(&self, router_id: &RouterId);
}
