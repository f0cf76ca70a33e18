use std::time::SystemTime;
use uuid::Uuid;

/**
 * Opaque transport identity of a peripheral. Stable for the lifetime of the
 * scan cycle that produced it.
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected { device_name: String },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: String,
    pub rssi_dbm: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ready,
    NotReady,
    Pong,
    Tared,
    RateConfirmed(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Reading(i32),
    Status(StatusKind),
    DeviceInfo(String),
}

/// One force measurement, timed relative to the start of its recording window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceSample {
    pub elapsed_seconds: f64,
    pub force_kg: f64,
}

/**
 * The finished artifact of one recording window. Produced once by
 * `stop_recording` and owned by the caller afterwards; never created with an
 * empty sample buffer.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub id: Uuid,
    pub started_at: SystemTime,
    pub peak_force_kg: f64,
    pub average_force_kg: f64,
    pub duration_seconds: f64,
    pub samples: Vec<ForceSample>,
}
