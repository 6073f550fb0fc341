//! Built-in capability implementations.
//!
//! These cover the common case of appliance-hosted routers: a capacity-ranked
//! scheduler, a driver that keeps per-device CLI configuration in sync, and
//! logging device-manager/notifier stand-ins for deployments where the real
//! collaborators live out of process.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use netfab_clicfg::{DeviceParams, RunningConfig};
use netfab_id::{DeviceId, RouterId, TemplateId};

use crate::capabilities::{DeviceManager, RouterDriver, RouterScheduler, RoutersNotifier};
use crate::model::{HostingDevice, RouterBinding, RouterType};
use crate::store::{BindingStore, StoreError};

/// Schedules routers onto the least-loaded admin-up device of the router
/// type's template. Ranking is free capacity descending with the device id
/// as a deterministic tiebreak.
#[derive(Debug, Default)]
pub struct CapacityScheduler;

#[async_trait]
impl RouterScheduler for CapacityScheduler {
    async fn select_hosting_devices(
        &self,
        store: &BindingStore,
        binding: &RouterBinding,
        router_type: &RouterType,
        slots_needed: u32,
    ) -> Result<Vec<DeviceId>, StoreError> {
        let candidates =
            store.candidate_devices(&router_type.template_id, &binding.tenant_id, slots_needed)?;
        debug!(
            router_id = %binding.router_id,
            candidates = candidates.len(),
            "Ranked hosting-device candidates"
        );
        Ok(candidates)
    }

    async fn unschedule(
        &self,
        _store: &BindingStore,
        _binding: &RouterBinding,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }
}

/// Netmask used for appliance management interfaces.
const MGMT_NETMASK: &str = "255.255.255.0";

/// Management interface name on the appliances this driver speaks to.
const MGMT_INTERFACE: &str = "GigabitEthernet0";

/// User the configuration sessions authenticate as.
const CFG_USERNAME: &str = "netfab";

/// Driver that mirrors scheduling changes into per-device running
/// configuration through the CLI configuration engine.
pub struct ApplianceConfigDriver {
    sessions: Mutex<HashMap<DeviceId, RunningConfig>>,
}

impl ApplianceConfigDriver {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// VRF name carrying one router's forwarding state on a device.
    fn vrf_name(router_id: &RouterId) -> String {
        let ulid = router_id.ulid().to_string().to_lowercase();
        format!("nrouter-{}", &ulid[ulid.len().saturating_sub(8)..])
    }

    fn wrap_commands(commands: &[String]) -> String {
        let mut snippet = String::from("<config>\n<cli-config-data>\n");
        for command in commands {
            snippet.push_str(&format!("<cmd>{command}</cmd>\n"));
        }
        snippet.push_str("</cli-config-data>\n</config>\n");
        snippet
    }

    /// Rendered running configuration of a device session, if one exists.
    pub async fn running_config(&self, device_id: &DeviceId) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions.get(device_id).map(RunningConfig::get_config)
    }
}

impl Default for ApplianceConfigDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouterDriver for ApplianceConfigDriver {
    async fn on_router_scheduled(&self, binding: &RouterBinding, device: &HostingDevice) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(device.id).or_insert_with(|| {
            RunningConfig::new(DeviceParams::new(
                &device.mgmt_ip,
                MGMT_NETMASK,
                MGMT_INTERFACE,
                CFG_USERNAME,
            ))
        });
        let vrf = Self::vrf_name(&binding.router_id);
        let snippet = Self::wrap_commands(&[
            format!("vrf definition {vrf}"),
            "address-family ipv4".to_string(),
            "exit-address-family".to_string(),
            "address-family ipv6".to_string(),
            "exit-address-family".to_string(),
        ]);
        if session.edit_config(&snippet) {
            info!(
                router_id = %binding.router_id,
                device_id = %device.id,
                vrf = %vrf,
                "Pushed router configuration"
            );
        } else {
            warn!(
                router_id = %binding.router_id,
                device_id = %device.id,
                "Router configuration push applied nothing"
            );
        }
    }

    async fn on_router_unscheduled(&self, binding: &RouterBinding, device: &HostingDevice) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&device.id) else {
            debug!(device_id = %device.id, "No configuration session for device");
            return;
        };
        let vrf = Self::vrf_name(&binding.router_id);
        let snippet = Self::wrap_commands(&[format!("no vrf definition {vrf}")]);
        if session.edit_config(&snippet) {
            info!(
                router_id = %binding.router_id,
                device_id = %device.id,
                vrf = %vrf,
                "Removed router configuration"
            );
        }
    }
}

/// Device manager that only logs shortages; real provisioning happens in an
/// external inventory service.
#[derive(Debug, Default)]
pub struct LoggingDeviceManager;

#[async_trait]
impl DeviceManager for LoggingDeviceManager {
    async fn report_capacity_shortage(&self, template_id: &TemplateId, slots_needed: u32) {
        warn!(
            template_id = %template_id,
            slots_needed,
            "Hosting-device capacity shortage reported"
        );
    }
}

/// Notifier that logs batched router updates.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl RoutersNotifier for LoggingNotifier {
    async fn routers_updated(&self, router_ids: &[RouterId], operation: &str) {
        info!(routers = router_ids.len(), operation, "Routers updated");
    }

    async fn router_deleted(&self, router_id: &RouterId) {
        info!(router_id = %router_id, "Router deleted");
    }
}
