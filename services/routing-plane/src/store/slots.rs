//! Slot-based capacity accounting for hosting devices.
//!
//! Core ownership rule: a device's exclusive `tenant_bound` exists if and
//! only if its consumed capacity is non-zero and was acquired exclusively.
//! Releasing the last slot clears the binding (ownership follows the last
//! occupant).

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use netfab_id::{DeviceId, RouterId, TenantId};

use super::{BindingStore, StoreError};

/// Acquires `slots` on a device for a router inside an open transaction.
///
/// Returns false (leaving the transaction's slot state untouched) when the
/// device is exclusively bound to another tenant, when an exclusive acquire
/// would move in on another tenant's allocations, or when capacity is
/// insufficient. No partial allocation is ever made.
pub(crate) fn acquire_in_tx(
    tx: &Connection,
    device_id: &DeviceId,
    router_id: &RouterId,
    tenant_id: &TenantId,
    slots: u32,
    exclusive: bool,
) -> Result<bool, StoreError> {
    let device_str = device_id.to_string();
    let tenant_str = tenant_id.to_string();

    let row = tx
        .query_row(
            "SELECT d.tenant_bound, t.slot_capacity
             FROM hosting_devices d
             JOIN device_templates t ON t.id = d.template_id
             WHERE d.id = ?1",
            params![device_str],
            |r| Ok((r.get::<_, Option<String>>(0)?, r.get::<_, u32>(1)?)),
        )
        .optional()?;
    let Some((tenant_bound, capacity)) = row else {
        return Err(StoreError::NotFound(format!("hosting device {device_id}")));
    };

    if let Some(bound) = &tenant_bound {
        if *bound != tenant_str {
            debug!(
                device_id = %device_id,
                router_id = %router_id,
                "Device exclusively bound to another tenant"
            );
            return Ok(false);
        }
    } else if exclusive {
        // An exclusive owner cannot move in on top of other tenants' routers.
        let foreign: u32 = tx.query_row(
            "SELECT COUNT(*) FROM slot_allocations a
             JOIN router_bindings b ON b.router_id = a.router_id
             WHERE a.device_id = ?1 AND b.tenant_id != ?2",
            params![device_str, tenant_str],
            |r| r.get(0),
        )?;
        if foreign > 0 {
            debug!(
                device_id = %device_id,
                router_id = %router_id,
                "Exclusive acquire refused, device already shared by other tenants"
            );
            return Ok(false);
        }
    }

    let consumed = consumed_in_tx(tx, device_id)?;
    if consumed + slots > capacity {
        debug!(
            device_id = %device_id,
            router_id = %router_id,
            consumed,
            requested = slots,
            capacity,
            "Insufficient slot capacity"
        );
        return Ok(false);
    }

    tx.execute(
        "INSERT INTO slot_allocations (device_id, router_id, num_allocated)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(device_id, router_id)
         DO UPDATE SET num_allocated = num_allocated + excluded.num_allocated",
        params![device_str, router_id.to_string(), slots],
    )?;
    if exclusive && tenant_bound.is_none() {
        tx.execute(
            "UPDATE hosting_devices SET tenant_bound = ?2 WHERE id = ?1",
            params![device_str, tenant_str],
        )?;
    }
    Ok(true)
}

/// Releases `slots` previously acquired by a router.
///
/// Returns false when no allocation exists or the amount exceeds what the
/// router holds (double-release protection); cleanup paths treat that as an
/// idempotent no-op, not an error. Clears the device's tenant binding when
/// consumption reaches zero.
pub(crate) fn release_in_tx(
    tx: &Connection,
    device_id: &DeviceId,
    router_id: &RouterId,
    slots: u32,
) -> Result<bool, StoreError> {
    let device_str = device_id.to_string();
    let router_str = router_id.to_string();

    let held: Option<u32> = tx
        .query_row(
            "SELECT num_allocated FROM slot_allocations
             WHERE device_id = ?1 AND router_id = ?2",
            params![device_str, router_str],
            |r| r.get(0),
        )
        .optional()?;
    let Some(held) = held else {
        debug!(
            device_id = %device_id,
            router_id = %router_id,
            "Release with no outstanding allocation"
        );
        return Ok(false);
    };
    if slots > held {
        debug!(
            device_id = %device_id,
            router_id = %router_id,
            held,
            requested = slots,
            "Release exceeds outstanding allocation"
        );
        return Ok(false);
    }

    if slots == held {
        tx.execute(
            "DELETE FROM slot_allocations WHERE device_id = ?1 AND router_id = ?2",
            params![device_str, router_str],
        )?;
    } else {
        tx.execute(
            "UPDATE slot_allocations SET num_allocated = num_allocated - ?3
             WHERE device_id = ?1 AND router_id = ?2",
            params![device_str, router_str, slots],
        )?;
    }

    if consumed_in_tx(tx, device_id)? == 0 {
        tx.execute(
            "UPDATE hosting_devices SET tenant_bound = NULL WHERE id = ?1",
            params![device_str],
        )?;
    }
    Ok(true)
}

pub(crate) fn consumed_in_tx(tx: &Connection, device_id: &DeviceId) -> Result<u32, StoreError> {
    let consumed = tx.query_row(
        "SELECT COALESCE(SUM(num_allocated), 0) FROM slot_allocations WHERE device_id = ?1",
        params![device_id.to_string()],
        |r| r.get::<_, u32>(0),
    )?;
    Ok(consumed)
}

/// Standalone allocator view over a [`BindingStore`], for callers managing
/// capacity without touching binding assignments.
pub struct SlotAllocator<'a> {
    store: &'a BindingStore,
}

impl<'a> SlotAllocator<'a> {
    pub fn new(store: &'a BindingStore) -> Self {
        Self { store }
    }

    /// Acquires slots in its own transaction.
    pub fn acquire(
        &self,
        device_id: &DeviceId,
        router_id: &RouterId,
        tenant_id: &TenantId,
        slots: u32,
        exclusive: bool,
    ) -> Result<bool, StoreError> {
        self.store
            .with_tx(|tx| acquire_in_tx(tx, device_id, router_id, tenant_id, slots, exclusive))
    }

    /// Releases slots in its own transaction.
    pub fn release(
        &self,
        device_id: &DeviceId,
        router_id: &RouterId,
        slots: u32,
    ) -> Result<bool, StoreError> {
        self.store
            .with_tx(|tx| release_in_tx(tx, device_id, router_id, slots))
    }

    /// Current consumption on a device.
    pub fn consumed(&self, device_id: &DeviceId) -> Result<u32, StoreError> {
        self.store.device_consumed(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceTemplate, HostingDevice, RouterBinding, RouterType};
    use netfab_id::{RouterTypeId, TemplateId};

    struct Fixture {
        store: BindingStore,
        device: DeviceId,
        rtype: RouterType,
    }

    fn fixture(slot_capacity: u32) -> Fixture {
        let store = BindingStore::open_in_memory().unwrap();
        let template = DeviceTemplate {
            id: TemplateId::new(),
            name: "asr-template".to_string(),
            slot_capacity,
        };
        store.insert_template(&template).unwrap();
        let rtype = RouterType {
            id: RouterTypeId::new(),
            name: "appliance_router".to_string(),
            description: String::new(),
            template_id: template.id,
            slot_need: 1,
        };
        store.insert_router_type(&rtype).unwrap();
        let device = HostingDevice {
            id: DeviceId::new(),
            template_id: template.id,
            mgmt_ip: "10.0.100.5".to_string(),
            admin_up: true,
            tenant_bound: None,
        };
        store.insert_device(&device).unwrap();
        Fixture {
            device: device.id,
            store,
            rtype,
        }
    }

    fn router(f: &Fixture, tenant: TenantId) -> RouterId {
        let binding = RouterBinding::new(RouterId::new(), f.rtype.id, tenant);
        f.store.insert_binding(&binding).unwrap();
        binding.router_id
    }

    #[test]
    fn test_acquire_and_release_roundtrip() {
        let f = fixture(3);
        let tenant = TenantId::new();
        let r = router(&f, tenant);
        let allocator = SlotAllocator::new(&f.store);

        assert!(allocator.acquire(&f.device, &r, &tenant, 2, false).unwrap());
        assert_eq!(allocator.consumed(&f.device).unwrap(), 2);
        assert!(allocator.release(&f.device, &r, 2).unwrap());
        assert_eq!(allocator.consumed(&f.device).unwrap(), 0);
    }

    #[test]
    fn test_acquire_over_capacity_fails_without_partial_allocation() {
        let f = fixture(3);
        let tenant = TenantId::new();
        let r = router(&f, tenant);
        let allocator = SlotAllocator::new(&f.store);

        assert!(!allocator.acquire(&f.device, &r, &tenant, 4, false).unwrap());
        assert_eq!(allocator.consumed(&f.device).unwrap(), 0);

        assert!(allocator.acquire(&f.device, &r, &tenant, 3, false).unwrap());
        assert!(!allocator
            .acquire(&f.device, &router(&f, tenant), &tenant, 1, false)
            .unwrap());
        assert_eq!(allocator.consumed(&f.device).unwrap(), 3);
    }

    #[test]
    fn test_exclusive_acquire_sets_and_release_clears_binding() {
        let f = fixture(3);
        let tenant = TenantId::new();
        let r = router(&f, tenant);
        let allocator = SlotAllocator::new(&f.store);

        assert!(allocator.acquire(&f.device, &r, &tenant, 3, true).unwrap());
        assert_eq!(
            f.store.device(&f.device).unwrap().tenant_bound,
            Some(tenant)
        );

        assert!(allocator.release(&f.device, &r, 3).unwrap());
        let device = f.store.device(&f.device).unwrap();
        assert!(device.tenant_bound.is_none());
        assert_eq!(allocator.consumed(&f.device).unwrap(), 0);
    }

    #[test]
    fn test_exclusive_binding_blocks_other_tenants() {
        let f = fixture(6);
        let owner = TenantId::new();
        let intruder = TenantId::new();
        let allocator = SlotAllocator::new(&f.store);

        let r1 = router(&f, owner);
        assert!(allocator.acquire(&f.device, &r1, &owner, 2, true).unwrap());

        // Capacity remains, but the device belongs to `owner` now.
        let r2 = router(&f, intruder);
        assert!(!allocator
            .acquire(&f.device, &r2, &intruder, 1, false)
            .unwrap());
        assert!(!allocator
            .acquire(&f.device, &r2, &intruder, 1, true)
            .unwrap());
        assert_eq!(allocator.consumed(&f.device).unwrap(), 2);
    }

    #[test]
    fn test_exclusive_acquire_refused_on_shared_device() {
        let f = fixture(6);
        let sharer = TenantId::new();
        let claimer = TenantId::new();
        let allocator = SlotAllocator::new(&f.store);

        let r1 = router(&f, sharer);
        assert!(allocator.acquire(&f.device, &r1, &sharer, 1, false).unwrap());
        assert!(f.store.device(&f.device).unwrap().tenant_bound.is_none());

        // Another tenant cannot claim exclusive ownership over a device that
        // already hosts someone else's router.
        let r2 = router(&f, claimer);
        assert!(!allocator.acquire(&f.device, &r2, &claimer, 1, true).unwrap());
    }

    #[test]
    fn test_competing_exclusive_acquires_respect_capacity() {
        let f = fixture(3);
        let t1 = TenantId::new();
        let t2 = TenantId::new();
        let allocator = SlotAllocator::new(&f.store);

        let r1 = router(&f, t1);
        let r2 = router(&f, t2);
        let first = allocator.acquire(&f.device, &r1, &t1, 2, true).unwrap();
        let second = allocator.acquire(&f.device, &r2, &t2, 2, true).unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(f.store.device(&f.device).unwrap().tenant_bound, Some(t1));
    }

    #[test]
    fn test_release_protects_against_double_release() {
        let f = fixture(4);
        let tenant = TenantId::new();
        let r = router(&f, tenant);
        let allocator = SlotAllocator::new(&f.store);

        assert!(allocator.acquire(&f.device, &r, &tenant, 2, false).unwrap());
        assert!(!allocator.release(&f.device, &r, 3).unwrap());
        assert!(allocator.release(&f.device, &r, 2).unwrap());
        assert!(!allocator.release(&f.device, &r, 2).unwrap());
        assert_eq!(allocator.consumed(&f.device).unwrap(), 0);
    }

    #[test]
    fn test_release_on_untouched_device_is_noop_failure() {
        let f = fixture(4);
        let tenant = TenantId::new();
        let r = router(&f, tenant);
        let allocator = SlotAllocator::new(&f.store);

        assert!(!allocator.release(&f.device, &r, 1).unwrap());
    }

    #[test]
    fn test_partial_release_keeps_binding() {
        let f = fixture(4);
        let tenant = TenantId::new();
        let r = router(&f, tenant);
        let allocator = SlotAllocator::new(&f.store);

        assert!(allocator.acquire(&f.device, &r, &tenant, 3, true).unwrap());
        assert!(allocator.release(&f.device, &r, 1).unwrap());
        assert_eq!(allocator.consumed(&f.device).unwrap(), 2);
        assert_eq!(f.store.device(&f.device).unwrap().tenant_bound, Some(tenant));
    }

    #[test]
    fn test_acquire_on_missing_device_is_not_found() {
        let f = fixture(4);
        let tenant = TenantId::new();
        let r = router(&f, tenant);
        let allocator = SlotAllocator::new(&f.store);

        let result = allocator.acquire(&DeviceId::new(), &r, &tenant, 1, false);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
