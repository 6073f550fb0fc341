//! Per-device running-configuration session.

use chrono::{DateTime, Utc};

use crate::interpreter::CommandInterpreter;
use crate::tree::ConfigTree;

/// Identity of the device a session talks to.
#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub host_ip: String,
    pub netmask: String,
    pub mgmt_interface: String,
    pub username: String,
}

impl DeviceParams {
    pub fn new(host_ip: &str, netmask: &str, mgmt_interface: &str, username: &str) -> Self {
        Self {
            host_ip: host_ip.to_string(),
            netmask: netmask.to_string(),
            mgmt_interface: mgmt_interface.to_string(),
            username: username.to_string(),
        }
    }
}

/// The running configuration of one device session.
///
/// Owns the session's [`ConfigTree`], seeds the factory-default management
/// configuration on construction, and tracks the last change for the
/// rendered banner.
#[derive(Debug)]
pub struct RunningConfig {
    params: DeviceParams,
    interpreter: CommandInterpreter,
    tree: ConfigTree,
    last_change: Option<DateTime<Utc>>,
}

impl RunningConfig {
    pub fn new(params: DeviceParams) -> Self {
        let mut session = Self {
            params,
            interpreter: CommandInterpreter::new(),
            tree: ConfigTree::new(),
            last_change: None,
        };
        session.set_default_config();
        session
    }

    /// Seeds the management VRF and management interface configuration every
    /// appliance ships with. Each chunk is one command batch so nested lines
    /// land under their block.
    fn set_default_config(&mut self) {
        let mgmt_interface = format!("interface {}", self.params.mgmt_interface);
        let mgmt_address = format!(
            "ip address {} {}",
            self.params.host_ip, self.params.netmask
        );
        let command_chunks: [&[&str]; 2] = [
            &[
                "vrf definition Mgmt-intf",
                "address-family ipv4",
                "exit-address-family",
                "address-family ipv6",
                "exit-address-family",
            ],
            &[
                mgmt_interface.as_str(),
                "vrf forwarding Mgmt-intf",
                mgmt_address.as_str(),
                "negotiation auto",
            ],
        ];
        for commands in command_chunks {
            self.interpreter.apply_commands(&mut self.tree, commands);
        }
    }

    /// Applies a submitted configuration snippet.
    ///
    /// Returns true when the snippet changed the configuration.
    pub fn edit_config(&mut self, snippet: &str) -> bool {
        let changed = self.interpreter.apply(&mut self.tree, snippet);
        if changed {
            self.last_change = Some(Utc::now());
        }
        changed
    }

    /// Renders the configuration with the change banner.
    pub fn get_config(&self) -> String {
        let ts = self.last_change.unwrap_or_else(Utc::now);
        let banner = format!(
            "! Last configuration change at {} UTC {} by {}\n!\n",
            ts.format("%H:%M:%S"),
            ts.format("%a %b %d %Y"),
            self.params.username,
        );
        banner + &self.tree.render()
    }

    /// Read access to the underlying tree.
    pub fn tree(&self) -> &ConfigTree {
        &self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> DeviceParams {
        DeviceParams::new("10.0.100.5", "255.255.255.0", "GigabitEthernet0", "stack")
    }

    #[test]
    fn test_default_config_is_seeded() {
        let session = RunningConfig::new(test_params());
        let tree = session.tree();
        assert!(tree.contains(&["vrf", "definition", "Mgmt-intf", "address-family", "ipv4"]));
        assert!(tree.contains(&["vrf", "definition", "Mgmt-intf", "address-family", "ipv6"]));
        assert!(tree.contains(&["interface", "GigabitEthernet0", "vrf", "forwarding", "Mgmt-intf"]));
        assert!(tree.contains(&[
            "interface",
            "GigabitEthernet0",
            "ip",
            "address",
            "10.0.100.5",
            "255.255.255.0"
        ]));
    }

    #[test]
    fn test_get_config_banner_names_user() {
        let session = RunningConfig::new(test_params());
        let text = session.get_config();
        assert!(text.starts_with("! Last configuration change at "));
        assert!(text.contains(" by stack\n"));
        assert!(text.contains("interface GigabitEthernet0\n"));
    }

    #[test]
    fn test_edit_config_applies_and_stamps() {
        let mut session = RunningConfig::new(test_params());
        assert!(session.last_change.is_none());
        let changed = session.edit_config(
            "<config>\n<cmd>interface Gi3</cmd>\n<cmd>negotiation auto</cmd>\n</config>\n",
        );
        assert!(changed);
        assert!(session.last_change.is_some());
        assert!(session.tree().contains(&["interface", "Gi3", "negotiation", "auto"]));
    }

    #[test]
    fn test_edit_config_with_no_commands_leaves_stamp() {
        let mut session = RunningConfig::new(test_params());
        assert!(!session.edit_config("<config>\n</config>\n"));
        assert!(session.last_change.is_none());
    }
}
