//! Scheduling coordinator for router-to-appliance placement.
//!
//! The coordinator drives each router binding through
//! Unscheduled → PendingSelection → Bound | Failed-NoCapacity:
//! - PendingSelection asks the router type's scheduler capability for ranked
//!   candidate devices.
//! - Binding reserves slots and records the assignment in one store
//!   transaction.
//! - The no-capacity path re-backlogs auto-schedulable routers and reports a
//!   shortage to the device manager.
//!
//! All mutating entry points serialize on one scheduling mutex. The
//! `*_locked` variants take the guarded backlog state as proof of lock so the
//! reconciler tick can reenter without deadlocking on itself.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use netfab_id::{DeviceId, RequestId, RouterId};

use crate::model::{RouterBinding, RouterRole, RouterType};
use crate::registry::{CapabilityError, CapabilityRegistry};
use crate::store::{BindingStore, StoreError};
use crate::translog::{TransactionLog, TxnKind};

/// Errors surfaced by scheduling operations.
///
/// Capacity shortages are not errors: they resolve locally through the
/// backlog and are reported as `Ok(false)`.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// In-memory set of routers awaiting a scheduling attempt.
///
/// A cache over the store, guarded by the scheduling mutex; `needs_resync`
/// forces one wholesale rebuild from the store (first use, or explicit
/// invalidation).
struct BacklogState {
    routers: HashSet<RouterId>,
    needs_resync: bool,
}

/// Statistics from one backlog reconciliation tick.
#[derive(Debug, Default, Clone)]
pub struct BacklogStats {
    pub processed: usize,
    pub scheduled: usize,
    pub failed: usize,
}

/// The scheduling coordinator.
pub struct SchedulingCoordinator {
    store: Arc<BindingStore>,
    registry: Arc<CapabilityRegistry>,
    translog: Arc<TransactionLog>,
    namespace_router_type: String,
    backlog: Mutex<BacklogState>,
}

impl SchedulingCoordinator {
    pub fn new(
        store: Arc<BindingStore>,
        registry: Arc<CapabilityRegistry>,
        translog: Arc<TransactionLog>,
        namespace_router_type: &str,
    ) -> Self {
        Self {
            store,
            registry,
            translog,
            namespace_router_type: namespace_router_type.to_string(),
            backlog: Mutex::new(BacklogState {
                routers: HashSet::new(),
                needs_resync: true,
            }),
        }
    }

    pub fn store(&self) -> &Arc<BindingStore> {
        &self.store
    }

    // =========================================================================
    // Router lifecycle
    // =========================================================================

    /// Creates a router binding and backlogs it so the first scheduling
    /// attempt happens asynchronously.
    pub async fn create_router(&self, binding: RouterBinding) -> Result<(), ScheduleError> {
        let rtype = self.store.router_type(&binding.router_type_id)?;
        self.store.insert_binding(&binding)?;
        self.translog.record(
            &binding.router_id,
            TxnKind::RouterCreated,
            Some(RequestId::new()),
            Some(&rtype.name),
        );
        match self.registry.driver(&rtype.name) {
            Ok(driver) => driver.on_router_created(&binding).await,
            Err(e) => debug!(error = %e, "No driver to notify of router creation"),
        }
        if binding.auto_schedule && !binding.is_scheduled() {
            let mut backlog = self.backlog.lock().await;
            self.backlog_insert(&mut backlog, binding.router_id);
        }
        Ok(())
    }

    /// Fires post-commit update notifications for a router.
    pub async fn update_router(&self, router_id: &RouterId) -> Result<(), ScheduleError> {
        let binding = self.store.binding(router_id)?;
        let rtype = self.store.router_type(&binding.router_type_id)?;
        match self.registry.driver(&rtype.name) {
            Ok(driver) => driver.on_router_updated(&binding).await,
            Err(e) => debug!(error = %e, "No driver to notify of router update"),
        }
        for (_, notifier) in self.registry.notifiers() {
            notifier.routers_updated(&[*router_id], "update_router").await;
        }
        Ok(())
    }

    /// Deletes a router binding, unscheduling it first when hosted.
    ///
    /// When the delete itself fails the router is put back in the backlog so
    /// it gets re-hosted, and the original error is surfaced to the caller.
    pub async fn delete_router(&self, router_id: &RouterId) -> Result<(), ScheduleError> {
        let mut backlog = self.backlog.lock().await;
        let binding = self.store.binding(router_id)?;
        let rtype = self.store.router_type(&binding.router_type_id)?;

        for (_, notifier) in self.registry.notifiers() {
            notifier.router_deleted(router_id).await;
        }

        let was_hosted = binding.is_scheduled();
        if was_hosted {
            debug!(router_id = %router_id, "Unscheduling router before delete");
            self.unschedule_router_locked(&mut backlog, router_id).await?;
        }
        // conditionally remove router from backlog just to be sure
        backlog.routers.remove(router_id);

        match self.store.delete_binding(router_id) {
            Ok(()) => {
                self.translog
                    .record(router_id, TxnKind::RouterDeleted, None, None);
                match self.registry.driver(&rtype.name) {
                    Ok(driver) => driver.on_router_deleted(&binding).await,
                    Err(e) => debug!(error = %e, "No driver to notify of router deletion"),
                }
                Ok(())
            }
            Err(e) => {
                error!(
                    router_id = %router_id,
                    error = %e,
                    "Deletion of router failed. It will be re-hosted."
                );
                if was_hosted || binding.auto_schedule {
                    self.backlog_insert(&mut backlog, *router_id);
                    self.translog
                        .record(router_id, TxnKind::DeleteFailed, None, None);
                }
                Err(e.into())
            }
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Schedules a router onto a hosting device.
    ///
    /// Returns true iff the router ends up scheduled.
    pub async fn schedule_router(&self, router_id: &RouterId) -> Result<bool, ScheduleError> {
        let mut backlog = self.backlog.lock().await;
        self.schedule_router_locked(&mut backlog, router_id).await
    }

    async fn schedule_router_locked(
        &self,
        backlog: &mut BacklogState,
        router_id: &RouterId,
    ) -> Result<bool, ScheduleError> {
        let binding = self.store.binding(router_id)?;
        if binding.is_scheduled() {
            return Ok(true);
        }
        let rtype = self.store.router_type(&binding.router_type_id)?;
        info!(router_id = %router_id, "Attempting to schedule router");

        let scheduler = match self.registry.scheduler(&rtype.name) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                // Unsupported router type, not a transient condition: abort
                // without backlogging.
                warn!(
                    router_id = %router_id,
                    router_type = %rtype.name,
                    "Aborting scheduling, no scheduler for router type"
                );
                self.translog.record(
                    router_id,
                    TxnKind::SchedulerMissing,
                    None,
                    Some(&rtype.name),
                );
                return Err(e.into());
            }
        };

        let slots = binding.effective_slot_need(&rtype);
        let candidates = scheduler
            .select_hosting_devices(&self.store, &binding, &rtype, slots)
            .await?;
        let Some(device_id) = candidates.first().copied() else {
            debug!(
                router_id = %router_id,
                "No running hosting device can host router"
            );
            self.fail_no_capacity(backlog, &binding, &rtype, slots, TxnKind::NoCandidate)
                .await;
            return Ok(false);
        };

        let exclusive = !binding.share_hosting_device;
        let acquired =
            self.store
                .bind_router(router_id, &device_id, &binding.tenant_id, slots, exclusive)?;
        if !acquired {
            debug!(
                router_id = %router_id,
                device_id = %device_id,
                "Could not allocate slots for router in hosting device"
            );
            self.fail_no_capacity(backlog, &binding, &rtype, slots, TxnKind::NoCapacity)
                .await;
            return Ok(false);
        }

        backlog.routers.remove(router_id);
        self.translog.record(
            router_id,
            TxnKind::Scheduled,
            None,
            Some(&device_id.to_string()),
        );
        info!(
            router_id = %router_id,
            device_id = %device_id,
            "Successfully scheduled router to hosting device"
        );

        // Post-commit driver hook; failures are logged, never rolled back.
        match self.store.device(&device_id) {
            Ok(device) => {
                let mut bound = binding.clone();
                bound.hosting_device_id = Some(device_id);
                match self.registry.driver(&rtype.name) {
                    Ok(driver) => driver.on_router_scheduled(&bound, &device).await,
                    Err(e) => debug!(error = %e, "No driver to notify of scheduling"),
                }
            }
            Err(e) => warn!(
                device_id = %device_id,
                error = %e,
                "Scheduled device vanished before driver notification"
            ),
        }
        Ok(true)
    }

    async fn fail_no_capacity(
        &self,
        backlog: &mut BacklogState,
        binding: &RouterBinding,
        rtype: &RouterType,
        slots: u32,
        kind: TxnKind,
    ) {
        if binding.auto_schedule {
            self.backlog_insert(backlog, binding.router_id);
        }
        self.translog
            .record(&binding.router_id, kind, None, Some(&rtype.name));
        // Inform the device manager so it can take appropriate measures,
        // e.g. spin up more hosting-device VMs. Fire-and-forget.
        for manager in self.registry.device_managers() {
            manager
                .report_capacity_shortage(&rtype.template_id, slots)
                .await;
        }
    }

    /// Removes a router from its hosting device.
    ///
    /// Returns false when the router is not hosted or the scheduler refused;
    /// the binding is left untouched in the refusal case and the caller must
    /// retry.
    pub async fn unschedule_router(&self, router_id: &RouterId) -> Result<bool, ScheduleError> {
        let mut backlog = self.backlog.lock().await;
        self.unschedule_router_locked(&mut backlog, router_id).await
    }

    async fn unschedule_router_locked(
        &self,
        _backlog: &mut BacklogState,
        router_id: &RouterId,
    ) -> Result<bool, ScheduleError> {
        let binding = self.store.binding(router_id)?;
        let Some(device_id) = binding.hosting_device_id else {
            return Ok(false);
        };
        let rtype = self.store.router_type(&binding.router_type_id)?;
        info!(router_id = %router_id, "Attempting to un-schedule router");

        let scheduler = self.registry.scheduler(&rtype.name)?;
        if !scheduler.unschedule(&self.store, &binding).await? {
            return Ok(false);
        }

        // Slot need of the effective (current) router type.
        let slots = binding.effective_slot_need(&rtype);
        let released = self.store.unbind_router(router_id, &device_id, slots)?;
        if !released {
            warn!(
                router_id = %router_id,
                device_id = %device_id,
                "No outstanding slot allocation while un-scheduling"
            );
        }
        self.translog.record(
            router_id,
            TxnKind::Unscheduled,
            None,
            Some(&device_id.to_string()),
        );

        match self.store.device(&device_id) {
            Ok(device) => match self.registry.driver(&rtype.name) {
                Ok(driver) => driver.on_router_unscheduled(&binding, &device).await,
                Err(e) => debug!(error = %e, "No driver to notify of un-scheduling"),
            },
            Err(e) => warn!(
                device_id = %device_id,
                error = %e,
                "Device vanished before un-scheduling notification"
            ),
        }
        info!(
            router_id = %router_id,
            device_id = %device_id,
            "Successfully un-scheduled router from hosting device"
        );
        Ok(true)
    }

    /// Clears assignments for routers hosted on dead devices. Auto-schedulable
    /// routers are re-backlogged; the rest stay unscheduled until manually
    /// rebound. Returns the affected router ids.
    pub async fn handle_dead_devices(
        &self,
        device_ids: &[DeviceId],
    ) -> Result<Vec<RouterId>, ScheduleError> {
        let mut backlog = self.backlog.lock().await;
        info!(
            devices = device_ids.len(),
            "Processing affected routers in dead hosting devices"
        );
        let affected = self.store.clear_dead_devices(device_ids)?;
        let mut routers = Vec::with_capacity(affected.len());
        for binding in &affected {
            let device = binding.hosting_device_id.map(|d| d.to_string());
            self.translog.record(
                &binding.router_id,
                TxnKind::DeviceDead,
                None,
                device.as_deref(),
            );
            if binding.auto_schedule {
                self.backlog_insert(&mut backlog, binding.router_id);
            } else {
                info!(
                    router_id = %binding.router_id,
                    "Router left unscheduled until manually rebound"
                );
            }
            routers.push(binding.router_id);
        }
        Ok(routers)
    }

    // =========================================================================
    // Backlog
    // =========================================================================

    /// Backlogs a router for a renewed scheduling attempt later.
    ///
    /// Re-reads the binding so a router scheduled while the caller waited for
    /// the lock is not re-added.
    pub async fn backlog_router(&self, router_id: &RouterId) -> Result<(), ScheduleError> {
        let mut backlog = self.backlog.lock().await;
        let binding = self.store.binding(router_id)?;
        if binding.is_scheduled() {
            return Ok(());
        }
        self.backlog_insert(&mut backlog, *router_id);
        Ok(())
    }

    /// Removes a router from the backlog.
    pub async fn remove_router_from_backlog(&self, router_id: &RouterId) {
        let mut backlog = self.backlog.lock().await;
        if backlog.routers.remove(router_id) {
            self.translog
                .record(router_id, TxnKind::BacklogRemoved, None, None);
            info!(router_id = %router_id, "Router removed from backlog");
        }
    }

    /// Forces a full backlog resync from the store on the next tick.
    pub async fn invalidate_backlog(&self) {
        let mut backlog = self.backlog.lock().await;
        backlog.needs_resync = true;
    }

    /// Whether a router is currently backlogged.
    pub async fn backlog_contains(&self, router_id: &RouterId) -> bool {
        self.backlog.lock().await.routers.contains(router_id)
    }

    /// Number of backlogged routers.
    pub async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.routers.len()
    }

    fn backlog_insert(&self, backlog: &mut BacklogState, router_id: RouterId) {
        if backlog.routers.insert(router_id) {
            self.translog
                .record(&router_id, TxnKind::Backlogged, None, None);
            info!(
                router_id = %router_id,
                "Backlogging router for renewed scheduling attempt later"
            );
        }
    }

    /// One reconciliation tick: resync the backlog if stale, then retry a
    /// snapshot of it, isolating per-router failures. Routers that became
    /// scheduled are announced once per registered listener after the loop.
    ///
    /// Routers added to the backlog mid-tick are picked up on the next tick,
    /// never this one.
    pub async fn process_backlog(&self) -> Result<BacklogStats, ScheduleError> {
        let mut backlog = self.backlog.lock().await;
        if backlog.needs_resync {
            self.resync_backlog_locked(&mut backlog)?;
        }
        let mut stats = BacklogStats::default();
        if backlog.routers.is_empty() {
            return Ok(stats);
        }
        info!(
            backlogged = backlog.routers.len(),
            "Processing router scheduling backlog"
        );

        let snapshot: Vec<RouterId> = backlog.routers.iter().copied().collect();
        let mut scheduled = Vec::new();
        for router_id in snapshot {
            stats.processed += 1;
            match self.schedule_router_locked(&mut backlog, &router_id).await {
                Ok(true) => {
                    stats.scheduled += 1;
                    scheduled.push(router_id);
                }
                Ok(false) => {}
                Err(e) => {
                    // One failing router must not abort the tick.
                    stats.failed += 1;
                    warn!(
                        router_id = %router_id,
                        error = %e,
                        "Failed to schedule backlogged router"
                    );
                }
            }
        }

        if !scheduled.is_empty() {
            // One batched notification per listener class, so downstream
            // fan-out is amortized across the tick.
            for (agent_type, notifier) in self.registry.notifiers() {
                notifier.routers_updated(&scheduled, "schedule").await;
                debug!(
                    agent_type = %agent_type,
                    routers = scheduled.len(),
                    "Notified listener of scheduled routers"
                );
            }
        }
        Ok(stats)
    }

    fn resync_backlog_locked(&self, backlog: &mut BacklogState) -> Result<(), ScheduleError> {
        info!("Synchronizing router scheduling backlog");
        let namespace_type = self
            .store
            .router_type_by_name(&self.namespace_router_type)?
            .map(|t| t.id);
        let ids = self
            .store
            .unscheduled_auto_candidates(namespace_type.as_ref(), &[RouterRole::Global])?;
        backlog.routers = ids.into_iter().collect();
        backlog.needs_resync = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    use netfab_id::{TemplateId, TenantId};

    use crate::builtin::CapacityScheduler;
    use crate::capabilities::{DeviceManager, RouterDriver, RoutersNotifier};
    use crate::model::{DeviceTemplate, HostingDevice, RouterType};

    struct Harness {
        store: Arc<BindingStore>,
        registry: Arc<CapabilityRegistry>,
        translog: Arc<TransactionLog>,
        coordinator: SchedulingCoordinator,
        rtype: RouterType,
        template: DeviceTemplate,
        tenant: TenantId,
    }

    fn harness(slot_need: u32, slot_capacity: u32) -> Harness {
        let store = Arc::new(BindingStore::open_in_memory().unwrap());
        let template = DeviceTemplate {
            id: TemplateId::new(),
            name: "asr-template".to_string(),
            slot_capacity,
        };
        store.insert_template(&template).unwrap();
        let rtype = RouterType {
            id: netfab_id::RouterTypeId::new(),
            name: "appliance_router".to_string(),
            description: String::new(),
            template_id: template.id,
            slot_need,
        };
        store.insert_router_type(&rtype).unwrap();

        let registry = Arc::new(CapabilityRegistry::new());
        registry.register_scheduler(&rtype.name, Arc::new(CapacityScheduler));

        let translog = Arc::new(TransactionLog::new(true, 200, 50));
        let coordinator = SchedulingCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&translog),
            "namespace_router",
        );
        Harness {
            store,
            registry,
            translog,
            coordinator,
            rtype,
            template,
            tenant: TenantId::new(),
        }
    }

    fn add_device(h: &Harness) -> HostingDevice {
        let device = HostingDevice {
            id: DeviceId::new(),
            template_id: h.template.id,
            mgmt_ip: "10.0.100.5".to_string(),
            admin_up: true,
            tenant_bound: None,
        };
        h.store.insert_device(&device).unwrap();
        device
    }

    fn add_router(h: &Harness) -> RouterId {
        let binding = RouterBinding::new(RouterId::new(), h.rtype.id, h.tenant);
        h.store.insert_binding(&binding).unwrap();
        binding.router_id
    }

    #[derive(Default)]
    struct RecordingDeviceManager {
        shortages: StdMutex<Vec<(TemplateId, u32)>>,
    }

    #[async_trait]
    impl DeviceManager for RecordingDeviceManager {
        async fn report_capacity_shortage(&self, template_id: &TemplateId, slots_needed: u32) {
            self.shortages
                .lock()
                .unwrap()
                .push((*template_id, slots_needed));
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        updates: StdMutex<Vec<(Vec<RouterId>, String)>>,
        deleted: StdMutex<Vec<RouterId>>,
    }

    #[async_trait]
    impl RoutersNotifier for RecordingNotifier {
        async fn routers_updated(&self, router_ids: &[RouterId], operation: &str) {
            self.updates
                .lock()
                .unwrap()
                .push((router_ids.to_vec(), operation.to_string()));
        }

        async fn router_deleted(&self, router_id: &RouterId) {
            self.deleted.lock().unwrap().push(*router_id);
        }
    }

    /// Driver that sabotages deletes by removing the binding row during the
    /// un-scheduling hook, simulating a concurrent delete downstream.
    struct BindingStealingDriver {
        store: Arc<BindingStore>,
    }

    #[async_trait]
    impl RouterDriver for BindingStealingDriver {
        async fn on_router_scheduled(&self, _binding: &RouterBinding, _device: &HostingDevice) {}

        async fn on_router_unscheduled(&self, binding: &RouterBinding, _device: &HostingDevice) {
            self.store.delete_binding(&binding.router_id).unwrap();
        }
    }

    #[tokio::test]
    async fn test_schedule_end_to_end_with_capacity_exhaustion() {
        let h = harness(3, 3);
        let device = add_device(&h);
        let first = add_router(&h);
        let second = add_router(&h);

        assert!(h.coordinator.schedule_router(&first).await.unwrap());
        assert_eq!(h.store.device_consumed(&device.id).unwrap(), 3);
        // Shared scheduling leaves the device unbound.
        assert!(h.store.device(&device.id).unwrap().tenant_bound.is_none());

        assert!(!h.coordinator.schedule_router(&second).await.unwrap());
        assert!(h.coordinator.backlog_contains(&second).await);
        assert!(!h.coordinator.backlog_contains(&first).await);
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent_for_scheduled_router() {
        let h = harness(1, 4);
        add_device(&h);
        let router = add_router(&h);
        assert!(h.coordinator.schedule_router(&router).await.unwrap());
        assert!(h.coordinator.schedule_router(&router).await.unwrap());
        assert_eq!(
            h.store
                .device_consumed(&h.store.binding(&router).unwrap().hosting_device_id.unwrap())
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_scheduler_is_typed_error_without_backlog() {
        let h = harness(1, 4);
        add_device(&h);
        h.registry.reset();
        let router = add_router(&h);

        let result = h.coordinator.schedule_router(&router).await;
        assert!(matches!(
            result,
            Err(ScheduleError::Capability(
                CapabilityError::SchedulerNotFound(_)
            ))
        ));
        assert!(!h.coordinator.backlog_contains(&router).await);
    }

    #[tokio::test]
    async fn test_no_candidate_reports_shortage_and_backlogs() {
        let h = harness(2, 4);
        // No devices at all.
        let manager = Arc::new(RecordingDeviceManager::default());
        h.registry.register_device_manager(manager.clone());
        let router = add_router(&h);

        assert!(!h.coordinator.schedule_router(&router).await.unwrap());
        assert!(h.coordinator.backlog_contains(&router).await);
        let shortages = manager.shortages.lock().unwrap();
        assert_eq!(shortages.as_slice(), &[(h.template.id, 2)]);
    }

    #[tokio::test]
    async fn test_non_auto_schedule_router_is_not_backlogged() {
        let h = harness(2, 4);
        let manager = Arc::new(RecordingDeviceManager::default());
        h.registry.register_device_manager(manager.clone());
        let binding = RouterBinding::new(RouterId::new(), h.rtype.id, h.tenant).manual();
        h.store.insert_binding(&binding).unwrap();

        assert!(!h
            .coordinator
            .schedule_router(&binding.router_id)
            .await
            .unwrap());
        assert!(!h.coordinator.backlog_contains(&binding.router_id).await);
        // The shortage is still reported.
        assert_eq!(manager.shortages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unschedule_releases_slots() {
        let h = harness(3, 3);
        let device = add_device(&h);
        let router = add_router(&h);
        assert!(h.coordinator.schedule_router(&router).await.unwrap());

        assert!(h.coordinator.unschedule_router(&router).await.unwrap());
        assert_eq!(h.store.device_consumed(&device.id).unwrap(), 0);
        assert!(h.store.binding(&router).unwrap().hosting_device_id.is_none());

        // Un-scheduling an unhosted router is a no-op failure.
        assert!(!h.coordinator.unschedule_router(&router).await.unwrap());
    }

    #[tokio::test]
    async fn test_process_backlog_resyncs_and_schedules() {
        let h = harness(1, 2);
        add_device(&h);
        let first = add_router(&h);
        let second = add_router(&h);
        let third = add_router(&h);

        let notifier = Arc::new(RecordingNotifier::default());
        h.registry.register_notifier("cfg-agent", notifier.clone());

        // The first tick resyncs from the store, schedules what fits, and
        // leaves the rest backlogged.
        let stats = h.coordinator.process_backlog().await.unwrap();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.scheduled, 2);
        assert_eq!(h.coordinator.backlog_len().await, 1);

        // One batched notification for the tick.
        let updates = notifier.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0.len(), 2);
        assert_eq!(updates[0].1, "schedule");
        drop(updates);

        // Backlog membership invariant: every unscheduled auto-schedule
        // router is in the backlog after the tick.
        for router in [first, second, third] {
            let binding = h.store.binding(&router).unwrap();
            assert_eq!(
                binding.hosting_device_id.is_none(),
                h.coordinator.backlog_contains(&router).await
            );
        }
    }

    #[tokio::test]
    async fn test_process_backlog_isolates_failures() {
        let h = harness(1, 2);
        add_device(&h);
        let good = add_router(&h);

        // A router of a type nobody registered a scheduler for.
        let orphan_type = RouterType {
            id: netfab_id::RouterTypeId::new(),
            name: "unsupported_router".to_string(),
            description: String::new(),
            template_id: h.template.id,
            slot_need: 1,
        };
        h.store.insert_router_type(&orphan_type).unwrap();
        let orphan = RouterBinding::new(RouterId::new(), orphan_type.id, h.tenant);
        h.store.insert_binding(&orphan).unwrap();

        let stats = h.coordinator.process_backlog().await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.failed, 1);
        assert!(h.store.binding(&good).unwrap().is_scheduled());
    }

    #[tokio::test]
    async fn test_backlog_resync_is_idempotent() {
        let h = harness(1, 0);
        let router = add_router(&h);

        h.coordinator.process_backlog().await.unwrap();
        assert!(h.coordinator.backlog_contains(&router).await);

        h.coordinator.invalidate_backlog().await;
        h.coordinator.process_backlog().await.unwrap();
        assert!(h.coordinator.backlog_contains(&router).await);
        assert_eq!(h.coordinator.backlog_len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_router_notifies_and_removes() {
        let h = harness(1, 2);
        add_device(&h);
        let router = add_router(&h);
        assert!(h.coordinator.schedule_router(&router).await.unwrap());

        let notifier = Arc::new(RecordingNotifier::default());
        h.registry.register_notifier("cfg-agent", notifier.clone());

        h.coordinator.delete_router(&router).await.unwrap();
        assert!(matches!(
            h.store.binding(&router),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(notifier.deleted.lock().unwrap().as_slice(), &[router]);
        assert!(!h.coordinator.backlog_contains(&router).await);
    }

    #[tokio::test]
    async fn test_delete_failure_rebacklogs_and_surfaces_error() {
        let h = harness(1, 2);
        add_device(&h);
        let router = add_router(&h);
        assert!(h.coordinator.schedule_router(&router).await.unwrap());

        h.registry.register_driver(
            &h.rtype.name,
            Arc::new(BindingStealingDriver {
                store: Arc::clone(&h.store),
            }),
        );

        let result = h.coordinator.delete_router(&router).await;
        assert!(matches!(
            result,
            Err(ScheduleError::Store(StoreError::NotFound(_)))
        ));
        // Compensation: the router is backlogged so it gets re-hosted.
        assert!(h.coordinator.backlog_contains(&router).await);
    }

    #[tokio::test]
    async fn test_handle_dead_devices_rebacklogs_auto_routers() {
        let h = harness(1, 4);
        let device = add_device(&h);
        let auto = add_router(&h);
        let manual_binding = RouterBinding::new(RouterId::new(), h.rtype.id, h.tenant).manual();
        h.store.insert_binding(&manual_binding).unwrap();

        assert!(h.coordinator.schedule_router(&auto).await.unwrap());
        assert!(h
            .store
            .bind_router(&manual_binding.router_id, &device.id, &h.tenant, 1, false)
            .unwrap());

        let affected = h.coordinator.handle_dead_devices(&[device.id]).await.unwrap();
        assert_eq!(affected.len(), 2);
        assert!(h.coordinator.backlog_contains(&auto).await);
        assert!(!h.coordinator.backlog_contains(&manual_binding.router_id).await);
        assert!(h.store.binding(&auto).unwrap().hosting_device_id.is_none());
        assert_eq!(h.store.device_consumed(&device.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backlog_add_and_remove() {
        let h = harness(1, 2);
        let router = add_router(&h);

        h.coordinator.backlog_router(&router).await.unwrap();
        assert!(h.coordinator.backlog_contains(&router).await);

        h.coordinator.remove_router_from_backlog(&router).await;
        assert!(!h.coordinator.backlog_contains(&router).await);

        // A scheduled router is never re-added.
        add_device(&h);
        assert!(h.coordinator.schedule_router(&router).await.unwrap());
        h.coordinator.backlog_router(&router).await.unwrap();
        assert!(!h.coordinator.backlog_contains(&router).await);
    }

    #[tokio::test]
    async fn test_update_router_notifies_listeners() {
        let h = harness(1, 2);
        let router = add_router(&h);
        let notifier = Arc::new(RecordingNotifier::default());
        h.registry.register_notifier("cfg-agent", notifier.clone());

        h.coordinator.update_router(&router).await.unwrap();
        let updates = notifier.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0.as_slice(), &[router]);
        assert_eq!(updates[0].1, "update_router");
    }

    #[tokio::test]
    async fn test_create_router_backlogs_for_async_scheduling() {
        let h = harness(1, 2);
        let binding = RouterBinding::new(RouterId::new(), h.rtype.id, h.tenant);
        let router = binding.router_id;
        h.coordinator.create_router(binding).await.unwrap();

        assert!(h.coordinator.backlog_contains(&router).await);
        assert!(!h.translog.records_for(&router).is_empty());
    }

    #[tokio::test]
    async fn test_transaction_log_traces_scheduling_path() {
        let h = harness(1, 1);
        add_device(&h);
        let first = add_router(&h);
        let second = add_router(&h);

        assert!(h.coordinator.schedule_router(&first).await.unwrap());
        assert!(!h.coordinator.schedule_router(&second).await.unwrap());

        let kinds: Vec<TxnKind> = h
            .translog
            .records_for(&second)
            .iter()
            .map(|r| r.kind)
            .collect();
        assert!(kinds.contains(&TxnKind::Backlogged));
        assert!(kinds.contains(&TxnKind::NoCandidate));
        let rendered = h.translog.render(&first).unwrap();
        assert!(rendered.contains("scheduled"));
    }
}
