//! SQLite-backed store for router bindings, hosting devices, and slot
//! allocations.
//!
//! This is the authoritative state of the scheduling subsystem. The in-memory
//! backlog is a cache that can always be rebuilt from here. Every mutation
//! that spans rows (slot acquisition plus binding assignment, dead-device
//! cleanup) runs inside one transaction; splitting those writes is the main
//! correctness hazard of the subsystem.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::debug;

use netfab_id::{DeviceId, RouterId, RouterTypeId, TemplateId, TenantId};

use crate::model::{DeviceTemplate, HostingDevice, RouterBinding, RouterRole, RouterType};

mod slots;

pub use slots::SlotAllocator;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// "Should not happen" conditions from query invariants: rows that fail
    /// to decode, bindings referencing missing rows.
    #[error("store inconsistency: {0}")]
    Inconsistent(String),
}

/// SQLite store guarding one connection.
pub struct BindingStore {
    conn: Mutex<Connection>,
}

impl BindingStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS router_types (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                template_id TEXT NOT NULL,
                slot_need INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS device_templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                slot_capacity INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hosting_devices (
                id TEXT PRIMARY KEY,
                template_id TEXT NOT NULL REFERENCES device_templates(id),
                mgmt_ip TEXT NOT NULL DEFAULT '',
                admin_up INTEGER NOT NULL DEFAULT 1,
                tenant_bound TEXT
            );

            CREATE TABLE IF NOT EXISTS slot_allocations (
                device_id TEXT NOT NULL REFERENCES hosting_devices(id),
                router_id TEXT NOT NULL,
                num_allocated INTEGER NOT NULL,
                PRIMARY KEY (device_id, router_id)
            );

            CREATE TABLE IF NOT EXISTS router_bindings (
                router_id TEXT PRIMARY KEY,
                router_type_id TEXT NOT NULL REFERENCES router_types(id),
                tenant_id TEXT NOT NULL,
                hosting_device_id TEXT REFERENCES hosting_devices(id),
                auto_schedule INTEGER NOT NULL DEFAULT 1,
                share_hosting_device INTEGER NOT NULL DEFAULT 1,
                role TEXT NOT NULL DEFAULT 'plain',
                inflated_slot_need INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_bindings_device
                ON router_bindings(hosting_device_id);
            "#,
        )?;

        debug!("Binding store schema initialized");
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` inside one immediate transaction; commits on `Ok`, rolls
    /// back on `Err`.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // =========================================================================
    // Router types
    // =========================================================================

    pub fn insert_router_type(&self, rtype: &RouterType) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO router_types (id, name, description, template_id, slot_need)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                rtype.id.to_string(),
                rtype.name,
                rtype.description,
                rtype.template_id.to_string(),
                rtype.slot_need,
            ],
        )?;
        Ok(())
    }

    pub fn router_type(&self, id: &RouterTypeId) -> Result<RouterType, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, name, description, template_id, slot_need
                 FROM router_types WHERE id = ?1",
                params![id.to_string()],
                RouterTypeRow::from_sql_row,
            )
            .optional()?;
        match row {
            Some(row) => row.into_model(),
            None => Err(StoreError::NotFound(format!("router type {id}"))),
        }
    }

    pub fn router_type_by_name(&self, name: &str) -> Result<Option<RouterType>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, name, description, template_id, slot_need
                 FROM router_types WHERE name = ?1",
                params![name],
                RouterTypeRow::from_sql_row,
            )
            .optional()?;
        row.map(RouterTypeRow::into_model).transpose()
    }

    // =========================================================================
    // Device templates and hosting devices
    // =========================================================================

    pub fn insert_template(&self, template: &DeviceTemplate) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO device_templates (id, name, slot_capacity) VALUES (?1, ?2, ?3)",
            params![
                template.id.to_string(),
                template.name,
                template.slot_capacity
            ],
        )?;
        Ok(())
    }

    pub fn template(&self, id: &TemplateId) -> Result<DeviceTemplate, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, name, slot_capacity FROM device_templates WHERE id = ?1",
                params![id.to_string()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, u32>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id_str, name, slot_capacity)) => Ok(DeviceTemplate {
                id: parse_id(&id_str)?,
                name,
                slot_capacity,
            }),
            None => Err(StoreError::NotFound(format!("device template {id}"))),
        }
    }

    pub fn insert_device(&self, device: &HostingDevice) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO hosting_devices (id, template_id, mgmt_ip, admin_up, tenant_bound)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                device.id.to_string(),
                device.template_id.to_string(),
                device.mgmt_ip,
                device.admin_up,
                device.tenant_bound.as_ref().map(|t| t.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn device(&self, id: &DeviceId) -> Result<HostingDevice, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, template_id, mgmt_ip, admin_up, tenant_bound
                 FROM hosting_devices WHERE id = ?1",
                params![id.to_string()],
                DeviceRow::from_sql_row,
            )
            .optional()?;
        match row {
            Some(row) => row.into_model(),
            None => Err(StoreError::NotFound(format!("hosting device {id}"))),
        }
    }

    /// Slot capacity of a device, from its template.
    pub fn device_capacity(&self, id: &DeviceId) -> Result<u32, StoreError> {
        let capacity = self
            .conn()
            .query_row(
                "SELECT t.slot_capacity FROM hosting_devices d
                 JOIN device_templates t ON t.id = d.template_id
                 WHERE d.id = ?1",
                params![id.to_string()],
                |r| r.get::<_, u32>(0),
            )
            .optional()?;
        capacity.ok_or_else(|| StoreError::NotFound(format!("hosting device {id}")))
    }

    /// Sum of outstanding slot allocations on a device.
    pub fn device_consumed(&self, id: &DeviceId) -> Result<u32, StoreError> {
        let consumed = self.conn().query_row(
            "SELECT COALESCE(SUM(num_allocated), 0) FROM slot_allocations WHERE device_id = ?1",
            params![id.to_string()],
            |r| r.get::<_, u32>(0),
        )?;
        Ok(consumed)
    }

    /// Admin-up devices of a template with at least `needed` free slots and
    /// no exclusive binding to another tenant, ranked by free capacity
    /// descending with the device id as a deterministic tiebreak.
    pub fn candidate_devices(
        &self,
        template_id: &TemplateId,
        tenant_id: &TenantId,
        needed: u32,
    ) -> Result<Vec<DeviceId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT d.id,
                    t.slot_capacity - COALESCE(SUM(a.num_allocated), 0) AS free_slots
             FROM hosting_devices d
             JOIN device_templates t ON t.id = d.template_id
             LEFT JOIN slot_allocations a ON a.device_id = d.id
             WHERE d.template_id = ?1
               AND d.admin_up = 1
               AND (d.tenant_bound IS NULL OR d.tenant_bound = ?2)
             GROUP BY d.id, t.slot_capacity
             HAVING free_slots >= ?3
             ORDER BY free_slots DESC, d.id ASC",
        )?;
        let ids = stmt
            .query_map(
                params![template_id.to_string(), tenant_id.to_string(), needed],
                |r| r.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        ids.iter().map(|s| parse_id(s)).collect()
    }

    // =========================================================================
    // Router bindings
    // =========================================================================

    pub fn insert_binding(&self, binding: &RouterBinding) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO router_bindings
             (router_id, router_type_id, tenant_id, hosting_device_id,
              auto_schedule, share_hosting_device, role, inflated_slot_need)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                binding.router_id.to_string(),
                binding.router_type_id.to_string(),
                binding.tenant_id.to_string(),
                binding.hosting_device_id.as_ref().map(|d| d.to_string()),
                binding.auto_schedule,
                binding.share_hosting_device,
                binding.role.as_str(),
                binding.inflated_slot_need,
            ],
        )?;
        Ok(())
    }

    pub fn binding(&self, router_id: &RouterId) -> Result<RouterBinding, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT router_id, router_type_id, tenant_id, hosting_device_id,
                        auto_schedule, share_hosting_device, role, inflated_slot_need
                 FROM router_bindings WHERE router_id = ?1",
                params![router_id.to_string()],
                BindingRow::from_sql_row,
            )
            .optional()?;
        match row {
            Some(row) => row.into_model(),
            None => Err(StoreError::NotFound(format!("router binding {router_id}"))),
        }
    }

    pub fn delete_binding(&self, router_id: &RouterId) -> Result<(), StoreError> {
        let deleted = self.conn().execute(
            "DELETE FROM router_bindings WHERE router_id = ?1",
            params![router_id.to_string()],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("router binding {router_id}")));
        }
        Ok(())
    }

    /// Acquires slots on a device and records the assignment on the binding
    /// row in ONE transaction. Returns false (no state change) when the
    /// allocation is refused.
    pub fn bind_router(
        &self,
        router_id: &RouterId,
        device_id: &DeviceId,
        tenant_id: &TenantId,
        slots: u32,
        exclusive: bool,
    ) -> Result<bool, StoreError> {
        self.with_tx(|tx| {
            if !slots::acquire_in_tx(tx, device_id, router_id, tenant_id, slots, exclusive)? {
                return Ok(false);
            }
            let updated = tx.execute(
                "UPDATE router_bindings SET hosting_device_id = ?2 WHERE router_id = ?1",
                params![router_id.to_string(), device_id.to_string()],
            )?;
            if updated == 0 {
                return Err(StoreError::Inconsistent(format!(
                    "no binding row for router {router_id} while assigning device"
                )));
            }
            Ok(true)
        })
    }

    /// Releases slots and clears the binding's assignment in ONE transaction.
    ///
    /// The assignment is cleared even when no allocation was outstanding, so
    /// cleanup stays idempotent; the returned bool reports whether slots were
    /// actually released.
    pub fn unbind_router(
        &self,
        router_id: &RouterId,
        device_id: &DeviceId,
        slots: u32,
    ) -> Result<bool, StoreError> {
        self.with_tx(|tx| {
            let released = slots::release_in_tx(tx, device_id, router_id, slots)?;
            tx.execute(
                "UPDATE router_bindings SET hosting_device_id = NULL WHERE router_id = ?1",
                params![router_id.to_string()],
            )?;
            Ok(released)
        })
    }

    /// Unscheduled auto-schedule bindings eligible for the backlog, excluding
    /// a router type (namespace routers) and a set of roles.
    pub fn unscheduled_auto_candidates(
        &self,
        exclude_type: Option<&RouterTypeId>,
        exclude_roles: &[RouterRole],
    ) -> Result<Vec<RouterId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT router_id, router_type_id, role FROM router_bindings
             WHERE hosting_device_id IS NULL AND auto_schedule = 1",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let excluded_type = exclude_type.map(|t| t.to_string());
        let mut ids = Vec::new();
        for (router_id, type_id, role) in rows {
            if excluded_type.as_deref() == Some(type_id.as_str()) {
                continue;
            }
            let role = RouterRole::from_str(&role).ok_or_else(|| {
                StoreError::Inconsistent(format!("unknown role {role:?} on router {router_id}"))
            })?;
            if exclude_roles.contains(&role) {
                continue;
            }
            ids.push(parse_id(&router_id)?);
        }
        Ok(ids)
    }

    /// Bindings currently assigned to a device.
    pub fn bindings_on_device(&self, device_id: &DeviceId) -> Result<Vec<RouterBinding>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT router_id, router_type_id, tenant_id, hosting_device_id,
                    auto_schedule, share_hosting_device, role, inflated_slot_need
             FROM router_bindings WHERE hosting_device_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![device_id.to_string()], BindingRow::from_sql_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        rows.into_iter().map(BindingRow::into_model).collect()
    }

    /// Clears assignments and allocations for a set of dead devices in one
    /// transaction. Returns the affected bindings as they were before the
    /// clear, so the caller can decide which routers to re-backlog.
    pub fn clear_dead_devices(
        &self,
        device_ids: &[DeviceId],
    ) -> Result<Vec<RouterBinding>, StoreError> {
        self.with_tx(|tx| {
            let mut affected = Vec::new();
            for device_id in device_ids {
                let device_str = device_id.to_string();
                let mut stmt = tx.prepare(
                    "SELECT router_id, router_type_id, tenant_id, hosting_device_id,
                            auto_schedule, share_hosting_device, role, inflated_slot_need
                     FROM router_bindings WHERE hosting_device_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![device_str], BindingRow::from_sql_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                drop(stmt);
                for row in rows {
                    affected.push(row.into_model()?);
                }
                tx.execute(
                    "UPDATE router_bindings SET hosting_device_id = NULL
                     WHERE hosting_device_id = ?1",
                    params![device_str],
                )?;
                tx.execute(
                    "DELETE FROM slot_allocations WHERE device_id = ?1",
                    params![device_str],
                )?;
                tx.execute(
                    "UPDATE hosting_devices SET tenant_bound = NULL WHERE id = ?1",
                    params![device_str],
                )?;
            }
            Ok(affected)
        })
    }
}

fn parse_id<T>(s: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e| StoreError::Inconsistent(format!("malformed id {s:?}: {e}")))
}

// =============================================================================
// Row Types
// =============================================================================

struct RouterTypeRow {
    id: String,
    name: String,
    description: String,
    template_id: String,
    slot_need: u32,
}

impl RouterTypeRow {
    fn from_sql_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            description: r.get(2)?,
            template_id: r.get(3)?,
            slot_need: r.get(4)?,
        })
    }

    fn into_model(self) -> Result<RouterType, StoreError> {
        Ok(RouterType {
            id: parse_id(&self.id)?,
            name: self.name,
            description: self.description,
            template_id: parse_id(&self.template_id)?,
            slot_need: self.slot_need,
        })
    }
}

struct DeviceRow {
    id: String,
    template_id: String,
    mgmt_ip: String,
    admin_up: bool,
    tenant_bound: Option<String>,
}

impl DeviceRow {
    fn from_sql_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            template_id: r.get(1)?,
            mgmt_ip: r.get(2)?,
            admin_up: r.get(3)?,
            tenant_bound: r.get(4)?,
        })
    }

    fn into_model(self) -> Result<HostingDevice, StoreError> {
        Ok(HostingDevice {
            id: parse_id(&self.id)?,
            template_id: parse_id(&self.template_id)?,
            mgmt_ip: self.mgmt_ip,
            admin_up: self.admin_up,
            tenant_bound: self.tenant_bound.as_deref().map(parse_id).transpose()?,
        })
    }
}

struct BindingRow {
    router_id: String,
    router_type_id: String,
    tenant_id: String,
    hosting_device_id: Option<String>,
    auto_schedule: bool,
    share_hosting_device: bool,
    role: String,
    inflated_slot_need: u32,
}

impl BindingRow {
    fn from_sql_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            router_id: r.get(0)?,
            router_type_id: r.get(1)?,
            tenant_id: r.get(2)?,
            hosting_device_id: r.get(3)?,
            auto_schedule: r.get(4)?,
            share_hosting_device: r.get(5)?,
            role: r.get(6)?,
            inflated_slot_need: r.get(7)?,
        })
    }

    fn into_model(self) -> Result<RouterBinding, StoreError> {
        let role = RouterRole::from_str(&self.role).ok_or_else(|| {
            StoreError::Inconsistent(format!(
                "unknown role {:?} on router {}",
                self.role, self.router_id
            ))
        })?;
        Ok(RouterBinding {
            router_id: parse_id(&self.router_id)?,
            router_type_id: parse_id(&self.router_type_id)?,
            tenant_id: parse_id(&self.tenant_id)?,
            hosting_device_id: self.hosting_device_id.as_deref().map(parse_id).transpose()?,
            auto_schedule: self.auto_schedule,
            share_hosting_device: self.share_hosting_device,
            role,
            inflated_slot_need: self.inflated_slot_need,
        })
    }
}
