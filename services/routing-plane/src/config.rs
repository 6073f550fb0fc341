use std::time::Duration;

use anyhow::Result;

/// Default seconds between renewed scheduling attempts of backlogged routers.
const DEFAULT_BACKLOG_INTERVAL_SECS: u64 = 10;

/// Default bounds for the transaction log.
const DEFAULT_TXN_MAX_PARENT_RECORDS: usize = 200;
const DEFAULT_TXN_MAX_CHILD_RECORDS: usize = 50;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub log_level: String,
    /// Interval between backlog reconciliation ticks.
    pub backlog_interval: Duration,
    /// Router type assigned to routers created without one.
    pub default_router_type: String,
    /// Router type representing legacy namespace routers; excluded from
    /// appliance scheduling.
    pub namespace_router_type: String,
    /// Router type for hardware-hosted routers.
    pub hardware_router_type: String,
    pub txn_log_enabled: bool,
    pub txn_max_parent_records: usize,
    pub txn_max_child_records: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_path =
            std::env::var("NETFAB_DB_PATH").unwrap_or_else(|_| "routing-plane.db".to_string());

        let log_level = std::env::var("NETFAB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let backlog_interval = Duration::from_secs(
            std::env::var("NETFAB_BACKLOG_INTERVAL_SECS")
                .map(|v| v.parse())
                .unwrap_or(Ok(DEFAULT_BACKLOG_INTERVAL_SECS))?,
        );

        let default_router_type = std::env::var("NETFAB_DEFAULT_ROUTER_TYPE")
            .unwrap_or_else(|_| "appliance_router".to_string());

        let namespace_router_type = std::env::var("NETFAB_NAMESPACE_ROUTER_TYPE")
            .unwrap_or_else(|_| "namespace_router".to_string());

        let hardware_router_type = std::env::var("NETFAB_HARDWARE_ROUTER_TYPE")
            .unwrap_or_else(|_| "hardware_router".to_string());

        let txn_log_enabled = std::env::var("NETFAB_TXN_LOG_ENABLED")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let txn_max_parent_records = std::env::var("NETFAB_TXN_MAX_PARENT_RECORDS")
            .map(|v| v.parse())
            .unwrap_or(Ok(DEFAULT_TXN_MAX_PARENT_RECORDS))?;

        let txn_max_child_records = std::env::var("NETFAB_TXN_MAX_CHILD_RECORDS")
            .map(|v| v.parse())
            .unwrap_or(Ok(DEFAULT_TXN_MAX_CHILD_RECORDS))?;

        Ok(Self {
            db_path,
            log_level,
            backlog_interval,
            default_router_type,
            namespace_router_type,
            hardware_router_type,
            txn_log_enabled,
            txn_max_parent_records,
            txn_max_child_records,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "routing-plane.db".to_string(),
            log_level: "info".to_string(),
            backlog_interval: Duration::from_secs(DEFAULT_BACKLOG_INTERVAL_SECS),
            default_router_type: "appliance_router".to_string(),
            namespace_router_type: "namespace_router".to_string(),
            hardware_router_type: "hardware_router".to_string(),
            txn_log_enabled: false,
            txn_max_parent_records: DEFAULT_TXN_MAX_PARENT_RECORDS,
            txn_max_child_records: DEFAULT_TXN_MAX_CHILD_RECORDS,
        }
    }
}
