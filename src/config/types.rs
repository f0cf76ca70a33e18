use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::{
    CONNECT_TIMEOUT, DEFAULT_SAMPLE_RATE_MS, RECONNECT_DELAY_INITIAL, RECONNECT_DELAY_MAX,
    SCAN_TIMEOUT, WATCHDOG_TIMEOUT,
};

/**
 * Tunables for the link layer. The defaults are the values the device is
 * specified against; the config file exists so field diagnostics can tighten
 * or relax them without a rebuild.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkConfig {
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub watchdog_ms: u64,
    pub reconnect_delay_initial_ms: u64,
    pub reconnect_delay_max_ms: u64,
    pub default_sample_rate_ms: u32,
    pub simulate: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            scan_timeout_ms: SCAN_TIMEOUT,
            connect_timeout_ms: CONNECT_TIMEOUT,
            watchdog_ms: WATCHDOG_TIMEOUT,
            reconnect_delay_initial_ms: RECONNECT_DELAY_INITIAL,
            reconnect_delay_max_ms: RECONNECT_DELAY_MAX,
            default_sample_rate_ms: DEFAULT_SAMPLE_RATE_MS,
            simulate: false,
        }
    }
}

impl LinkConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn reconnect_delay_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_initial_ms)
    }

    pub fn reconnect_delay_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_max_ms)
    }
}
