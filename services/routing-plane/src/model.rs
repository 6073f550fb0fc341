//! Domain types for routers, router types, and hosting devices.

use netfab_id::{DeviceId, RouterId, RouterTypeId, TemplateId, TenantId};
use serde::{Deserialize, Serialize};

/// Role a router plays in the routed topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterRole {
    /// Ordinary tenant router.
    Plain,
    /// Tenant-facing logical router whose forwarding lives elsewhere.
    Logical,
    /// Device-global router; never auto-scheduled.
    Global,
}

impl RouterRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Logical => "logical",
            Self::Global => "global",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "plain" => Some(Self::Plain),
            "logical" => Some(Self::Logical),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

/// A named policy bundle determining how routers of this type are hosted.
///
/// Scheduler and driver implementations are resolved from the capability
/// registry by the type's name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterType {
    pub id: RouterTypeId,
    pub name: String,
    pub description: String,
    /// Device template this type's routers are hosted on.
    pub template_id: TemplateId,
    /// Slots one router of this type consumes.
    pub slot_need: u32,
}

/// A hosting-device template; defines the capacity of devices stamped
/// from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTemplate {
    pub id: TemplateId,
    pub name: String,
    pub slot_capacity: u32,
}

/// A physical or virtual routing appliance.
///
/// Slot consumption is derived from outstanding allocations and never stored
/// on the device row. `tenant_bound` is set while the device is exclusively
/// owned; it is cleared when consumption returns to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostingDevice {
    pub id: DeviceId,
    pub template_id: TemplateId,
    pub mgmt_ip: String,
    pub admin_up: bool,
    pub tenant_bound: Option<TenantId>,
}

/// The scheduling record for one router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterBinding {
    pub router_id: RouterId,
    pub router_type_id: RouterTypeId,
    pub tenant_id: TenantId,
    pub hosting_device_id: Option<DeviceId>,
    pub auto_schedule: bool,
    pub share_hosting_device: bool,
    pub role: RouterRole,
    /// Overrides the router type's slot need when non-zero (router migration
    /// between types with different needs).
    pub inflated_slot_need: u32,
}

impl RouterBinding {
    /// Creates a binding with the defaults new routers get: unscheduled,
    /// auto-schedulable, sharing its hosting device.
    pub fn new(router_id: RouterId, router_type_id: RouterTypeId, tenant_id: TenantId) -> Self {
        Self {
            router_id,
            router_type_id,
            tenant_id,
            hosting_device_id: None,
            auto_schedule: true,
            share_hosting_device: true,
            role: RouterRole::Plain,
            inflated_slot_need: 0,
        }
    }

    pub fn with_role(mut self, role: RouterRole) -> Self {
        self.role = role;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.share_hosting_device = false;
        self
    }

    pub fn manual(mut self) -> Self {
        self.auto_schedule = false;
        self
    }

    /// Slots this router consumes: the inflated override when set, else the
    /// router type's declared need.
    pub fn effective_slot_need(&self, router_type: &RouterType) -> u32 {
        if self.inflated_slot_need > 0 {
            self.inflated_slot_need
        } else {
            router_type.slot_need
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.hosting_device_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RouterRole::Plain, "plain")]
    #[case(RouterRole::Logical, "logical")]
    #[case(RouterRole::Global, "global")]
    fn test_role_roundtrip(#[case] role: RouterRole, #[case] s: &str) {
        assert_eq!(role.as_str(), s);
        assert_eq!(RouterRole::from_str(s), Some(role));
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        assert_eq!(RouterRole::from_str("bogus"), None);
    }

    #[test]
    fn test_effective_slot_need_prefers_inflated() {
        let rtype = RouterType {
            id: RouterTypeId::new(),
            name: "appliance_router".to_string(),
            description: String::new(),
            template_id: TemplateId::new(),
            slot_need: 3,
        };
        let mut binding =
            RouterBinding::new(RouterId::new(), rtype.id, TenantId::new());
        assert_eq!(binding.effective_slot_need(&rtype), 3);
        binding.inflated_slot_need = 5;
        assert_eq!(binding.effective_slot_need(&rtype), 5);
    }

    #[test]
    fn test_new_binding_defaults() {
        let binding = RouterBinding::new(RouterId::new(), RouterTypeId::new(), TenantId::new());
        assert!(binding.auto_schedule);
        assert!(binding.share_hosting_device);
        assert!(!binding.is_scheduled());
        assert_eq!(binding.role, RouterRole::Plain);
    }
}
