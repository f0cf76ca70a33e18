//! The transport contract shared by the real BLE binding and the simulator.
//!
//! Platform BLE stacks deliver duck-typed delegate callbacks; both bindings
//! instead run as a spawned task that consumes `TransportCommand`s and emits
//! an enumerated `TransportEvent` stream through one inbound channel. The
//! link task stays transport-agnostic and the simulator satisfies the exact
//! same contract.

use futures::channel::mpsc::{Receiver, Sender};

use crate::device::types::{DeviceId, DiscoveredDevice};

pub mod ble;
pub mod sim;

/// Why a scan could not start. Fatal until the user remediates externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailure {
    PoweredOff,
    Unauthorized,
    Unsupported,
}

impl ScanFailure {
    pub fn message(&self) -> &'static str {
        match self {
            ScanFailure::PoweredOff => "bluetooth is powered off",
            ScanFailure::Unauthorized => "bluetooth access not authorized",
            ScanFailure::Unsupported => "bluetooth is not available",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The transport no longer holds the peripheral for this identity.
    UnknownDevice,
    /// Connected at the transport level, but the notify/write characteristic
    /// pair was not found.
    NotRecognized,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Confirmation of a disconnect this side asked for.
    Requested,
    /// The link dropped on its own (out of range, device powered down).
    Unsolicited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Write(Vec<u8>),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Discovered(DiscoveredDevice),
    ScanFailed(ScanFailure),
    /// Emitted only after the notify + write characteristics are verified.
    Connected { name: String },
    ConnectFailed(ConnectFailure),
    Disconnected { reason: DisconnectReason },
    Notification(Vec<u8>),
    WriteCompleted,
}

/// The two channel ends a binding hands to the link task.
pub struct TransportHandle {
    pub commands: Sender<TransportCommand>,
    pub events: Receiver<TransportEvent>,
}
