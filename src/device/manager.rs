use std::time::Duration;
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::channel::oneshot;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::types::LinkConfig;
use crate::device::codec::{parse, FrameBuffer};
use crate::device::command::Command;
use crate::device::constants::RAW_COUNTS_PER_KG;
use crate::device::recorder::SessionRecorder;
use crate::device::types::{ConnectionState, DeviceId, DiscoveredDevice, ProtocolMessage, Recording, StatusKind};
use crate::transport::{ConnectFailure, DisconnectReason, TransportCommand, TransportEvent, TransportHandle};

#[derive(Debug)]
enum LinkCommand {
    StartScanning,
    StopScanning,
    Connect(DeviceId),
    Disconnect,
    StartRecording,
    StopRecording(oneshot::Sender<Option<Recording>>),
    SendPing,
    SendTare,
    SetSampleRate(u32),
}

/**
 * Handle to a running link task. Cheap to clone; all clones talk to the same
 * task. Operations are serialized through the task's command channel, reads
 * return the most recently fully processed snapshot.
 */
#[derive(Clone)]
pub struct GripLink {
    commands: Sender<LinkCommand>,
    state: watch::Receiver<ConnectionState>,
    devices: watch::Receiver<Vec<DiscoveredDevice>>,
    force: watch::Receiver<f64>,
    recording: watch::Receiver<bool>,
    firmware: watch::Receiver<Option<String>>,
    sensor_ready: watch::Receiver<bool>,
}

impl GripLink {
    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.borrow().clone()
    }

    pub fn current_force(&self) -> f64 {
        *self.force.borrow()
    }

    pub fn is_recording(&self) -> bool {
        *self.recording.borrow()
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.firmware.borrow().clone()
    }

    pub fn sensor_ready(&self) -> bool {
        *self.sensor_ready.borrow()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn watch_discovered_devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.devices.clone()
    }

    pub fn watch_current_force(&self) -> watch::Receiver<f64> {
        self.force.clone()
    }

    pub async fn start_scanning(&self) {
        self.send(LinkCommand::StartScanning).await;
    }

    pub async fn stop_scanning(&self) {
        self.send(LinkCommand::StopScanning).await;
    }

    pub async fn connect(&self, id: DeviceId) {
        self.send(LinkCommand::Connect(id)).await;
    }

    pub async fn disconnect(&self) {
        self.send(LinkCommand::Disconnect).await;
    }

    pub async fn start_recording(&self) {
        self.send(LinkCommand::StartRecording).await;
    }

    /// Closes the recording window and hands the artifact to the caller.
    pub async fn stop_recording(&self) -> Option<Recording> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(LinkCommand::StopRecording(reply_tx)).await;
        reply_rx.await.unwrap_or(None)
    }

    pub async fn send_ping(&self) {
        self.send(LinkCommand::SendPing).await;
    }

    pub async fn send_tare(&self) {
        self.send(LinkCommand::SendTare).await;
    }

    pub async fn set_sample_rate(&self, ms: u32) {
        self.send(LinkCommand::SetSampleRate(ms)).await;
    }

    async fn send(&self, command: LinkCommand) {
        let mut sender = self.commands.clone();
        if let Err(err) = sender.send(command).await {
            warn!("Link task is gone, command dropped: {:?}", err);
        }
    }
}

/// Spawns the link task over the given transport and returns its handle.
pub fn spawn_link(
    config: LinkConfig,
    transport: TransportHandle,
    cancel: CancellationToken,
) -> (GripLink, JoinHandle<()>) {
    let (command_tx, command_rx) = channel::<LinkCommand>(32);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (devices_tx, devices_rx) = watch::channel(Vec::new());
    let (force_tx, force_rx) = watch::channel(0.0);
    let (recording_tx, recording_rx) = watch::channel(false);
    let (firmware_tx, firmware_rx) = watch::channel(None);
    let (sensor_ready_tx, sensor_ready_rx) = watch::channel(false);

    let task = LinkTask {
        config,
        transport_tx: transport.commands,
        state: ConnectionState::Disconnected,
        state_tx,
        devices_tx,
        force_tx,
        recording_tx,
        firmware_tx,
        sensor_ready_tx,
        frame: FrameBuffer::new(),
        recorder: SessionRecorder::new(),
        discovered: Vec::new(),
        target: None,
        scan_deadline: None,
        connect_deadline: None,
        watchdog_deadline: None,
        reconnect_at: None,
        backoff: Duration::ZERO,
        reconnecting: false,
        fallback_scan: false,
        awaiting_pong: false,
    };

    let handle = spawn(task.run(cancel, command_rx, transport.events));

    let link = GripLink {
        commands: command_tx,
        state: state_rx,
        devices: devices_rx,
        force: force_rx,
        recording: recording_rx,
        firmware: firmware_rx,
        sensor_ready: sensor_ready_rx,
    };

    (link, handle)
}

struct LinkTask {
    config: LinkConfig,
    transport_tx: Sender<TransportCommand>,

    // published state; `state` mirrors what is in `state_tx`
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    devices_tx: watch::Sender<Vec<DiscoveredDevice>>,
    force_tx: watch::Sender<f64>,
    recording_tx: watch::Sender<bool>,
    firmware_tx: watch::Sender<Option<String>>,
    sensor_ready_tx: watch::Sender<bool>,

    frame: FrameBuffer,
    recorder: SessionRecorder,
    discovered: Vec<DiscoveredDevice>,

    // identity bound by the current connect attempt / connection
    target: Option<DeviceId>,

    scan_deadline: Option<Instant>,
    connect_deadline: Option<Instant>,
    watchdog_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    backoff: Duration,
    // true while a connect attempt is automatic rather than user-initiated
    reconnecting: bool,
    // true while scanning only to rediscover the bound identity
    fallback_scan: bool,
    awaiting_pong: bool,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

impl LinkTask {
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut commands: Receiver<LinkCommand>,
        mut events: Receiver<TransportEvent>,
    ) {
        'mainloop: loop {
            let deadline = self.next_deadline();

            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                _ = sleep_until_opt(deadline) => {
                    self.on_deadline(Instant::now()).await;
                },
                command = commands.next() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break 'mainloop, // every handle was dropped
                },
                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Transport task is gone, shutting down link task");
                        break 'mainloop;
                    },
                },
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.scan_deadline, self.connect_deadline, self.watchdog_deadline, self.reconnect_at]
            .into_iter()
            .flatten()
            .min()
    }

    async fn transport(&mut self, command: TransportCommand) {
        if let Err(err) = self.transport_tx.send(command).await {
            warn!("Failed to send command to transport: {:?}", err);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state: {:?} -> {:?}", self.state, state);
            self.state = state.clone();
            self.state_tx.send_replace(state);
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    fn publish_devices(&mut self) {
        self.devices_tx.send_replace(self.discovered.clone());
    }

    async fn handle_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::StartScanning => self.start_scanning().await,
            LinkCommand::StopScanning => self.stop_scanning().await,
            LinkCommand::Connect(id) => self.connect(id).await,
            LinkCommand::Disconnect => self.disconnect().await,
            LinkCommand::StartRecording => {
                if self.is_connected() {
                    self.recorder.start(Instant::now());
                    self.recording_tx.send_replace(self.recorder.is_recording());
                } else {
                    info!("start_recording ignored: not connected");
                }
            },
            LinkCommand::StopRecording(reply) => {
                let recording = self.recorder.stop(Instant::now());
                self.recording_tx.send_replace(false);
                // the caller may have gone away; the artifact is theirs to lose
                let _ = reply.send(recording);
            },
            LinkCommand::SendPing => self.write_command(Command::Ping).await,
            LinkCommand::SendTare => self.write_command(Command::Tare).await,
            LinkCommand::SetSampleRate(ms) => self.write_command(Command::SetRate(ms)).await,
        }
    }

    async fn start_scanning(&mut self) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Error { .. } => {},
            _ => {
                warn!("start_scanning ignored in state {:?}", self.state);
                return;
            },
        }

        info!("Scanning for devices...");
        self.discovered.clear();
        self.publish_devices();
        self.fallback_scan = false;
        self.set_state(ConnectionState::Scanning);
        self.scan_deadline = Some(Instant::now() + self.config.scan_timeout());
        self.transport(TransportCommand::StartScan).await;
    }

    async fn stop_scanning(&mut self) {
        if !matches!(self.state, ConnectionState::Scanning) {
            debug!("stop_scanning ignored in state {:?}", self.state);
            return;
        }

        self.scan_deadline = None;
        self.transport(TransportCommand::StopScan).await;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn connect(&mut self, id: DeviceId) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected { .. }) {
            warn!("connect ignored in state {:?}", self.state);
            return;
        }

        if !self.discovered.iter().any(|device| device.id == id) {
            warn!("connect ignored: {} was not discovered in this scan cycle", id);
            return;
        }

        self.scan_deadline = None;
        self.transport(TransportCommand::StopScan).await;
        self.backoff = self.config.reconnect_delay_initial();
        self.begin_connect(id, false).await;
    }

    async fn begin_connect(&mut self, id: DeviceId, reconnecting: bool) {
        info!("Connecting to {}...", id);
        self.target = Some(id.clone());
        self.reconnecting = reconnecting;
        self.reconnect_at = None;
        self.connect_deadline = Some(Instant::now() + self.config.connect_timeout());
        self.set_state(ConnectionState::Connecting);
        self.transport(TransportCommand::Connect(id)).await;
    }

    async fn disconnect(&mut self) {
        let had_link = !matches!(self.state, ConnectionState::Disconnected);

        self.scan_deadline = None;
        self.connect_deadline = None;
        self.watchdog_deadline = None;
        self.reconnect_at = None;
        self.reconnecting = false;
        self.fallback_scan = false;
        self.awaiting_pong = false;
        self.target = None;
        self.frame.clear();
        self.recorder.abandon();
        self.recording_tx.send_replace(false);
        self.force_tx.send_replace(0.0);
        self.firmware_tx.send_replace(None);
        self.sensor_ready_tx.send_replace(false);

        if had_link {
            info!("Disconnecting");
            self.transport(TransportCommand::Disconnect).await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn write_command(&mut self, command: Command) {
        if !self.is_connected() {
            info!("{:?} ignored: not connected", command);
            return;
        }

        self.transport(TransportCommand::Write(command.encode())).await;
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered(device) => self.on_discovered(device).await,
            TransportEvent::ScanFailed(failure) => {
                self.scan_deadline = None;
                if self.fallback_scan {
                    // reconnection stays invisible; retry the bound identity later
                    self.fallback_scan = false;
                    self.schedule_reconnect(Instant::now());
                } else {
                    warn!("Scan failed: {}", failure.message());
                    self.set_state(ConnectionState::Error { message: failure.message().to_string() });
                }
            },
            TransportEvent::Connected { name } => self.on_connected(name),
            TransportEvent::ConnectFailed(failure) => self.on_connect_failed(failure).await,
            TransportEvent::Disconnected { reason } => self.on_disconnected(reason),
            TransportEvent::Notification(bytes) => {
                for line in self.frame.push(&bytes) {
                    if let Some(message) = parse(&line) {
                        self.apply_message(message);
                    }
                }
            },
            TransportEvent::WriteCompleted => {
                debug!("Write completed");
            },
        }
    }

    async fn on_discovered(&mut self, device: DiscoveredDevice) {
        if self.fallback_scan {
            if Some(&device.id) == self.target.as_ref() {
                info!("Bound device {} reappeared, reconnecting", device.id);
                self.scan_deadline = None;
                self.fallback_scan = false;
                self.transport(TransportCommand::StopScan).await;
                self.begin_connect(device.id, true).await;
            }
            return;
        }

        if !matches!(self.state, ConnectionState::Scanning) {
            return;
        }

        debug!("Discovered {} ({}, {}dBm)", device.name, device.id, device.rssi_dbm);
        match self.discovered.iter_mut().find(|existing| existing.id == device.id) {
            Some(existing) => *existing = device,
            None => self.discovered.push(device),
        }
        self.publish_devices();
    }

    fn on_connected(&mut self, name: String) {
        if !matches!(self.state, ConnectionState::Connecting) {
            warn!("Unexpected transport connection in state {:?}", self.state);
            return;
        }

        info!("Connected to {}", name);
        self.scan_deadline = None;
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.reconnecting = false;
        self.fallback_scan = false;
        self.backoff = self.config.reconnect_delay_initial();
        self.frame.clear();
        self.awaiting_pong = false;
        self.watchdog_deadline = Some(Instant::now() + self.config.watchdog_timeout());
        self.set_state(ConnectionState::Connected { device_name: name });
    }

    async fn on_connect_failed(&mut self, failure: ConnectFailure) {
        self.connect_deadline = None;

        if self.reconnecting {
            match failure {
                ConnectFailure::UnknownDevice => {
                    // the old handle is stale; rediscover the bound identity
                    info!("Bound device is gone, falling back to a fresh scan");
                    self.fallback_scan = true;
                    self.scan_deadline = Some(Instant::now() + self.config.scan_timeout());
                    self.transport(TransportCommand::StartScan).await;
                },
                failure => {
                    debug!("Reconnect attempt failed: {:?}", failure);
                    self.schedule_reconnect(Instant::now());
                },
            }
            return;
        }

        let message = match failure {
            ConnectFailure::NotRecognized => "device not recognized".to_string(),
            ConnectFailure::UnknownDevice => "device no longer available".to_string(),
            ConnectFailure::Failed(message) => message,
        };
        warn!("Connection failed: {}", message);
        self.target = None;
        self.set_state(ConnectionState::Error { message });
    }

    fn on_disconnected(&mut self, reason: DisconnectReason) {
        match reason {
            DisconnectReason::Requested => {
                debug!("Transport confirmed disconnect");
            },
            DisconnectReason::Unsolicited => {
                if !self.is_connected() || self.target.is_none() {
                    return;
                }

                warn!("Connection lost, starting automatic reconnection");
                self.watchdog_deadline = None;
                self.awaiting_pong = false;
                self.frame.clear();
                self.force_tx.send_replace(0.0);
                self.sensor_ready_tx.send_replace(false);
                self.firmware_tx.send_replace(None);
                // the recording window, if any, stays open; samples resume
                // once the link is back
                self.set_state(ConnectionState::Connecting);
                self.schedule_reconnect(Instant::now());
            },
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.backoff.is_zero() {
            self.backoff = self.config.reconnect_delay_initial();
        }
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.config.reconnect_delay_max());
        self.reconnect_at = Some(now + delay);
        info!("Next reconnection attempt in {:?}", delay);
    }

    fn apply_message(&mut self, message: ProtocolMessage) {
        match message {
            ProtocolMessage::Reading(raw) => {
                let force_kg = (raw as f64 / RAW_COUNTS_PER_KG).max(0.0);
                self.force_tx.send_replace(force_kg);

                let now = Instant::now();
                self.awaiting_pong = false;
                if self.is_connected() {
                    self.watchdog_deadline = Some(now + self.config.watchdog_timeout());
                }
                self.recorder.record(now, force_kg);
            },
            ProtocolMessage::Status(StatusKind::Ready) => {
                self.sensor_ready_tx.send_replace(true);
            },
            ProtocolMessage::Status(StatusKind::NotReady) => {
                self.sensor_ready_tx.send_replace(false);
            },
            ProtocolMessage::Status(StatusKind::Pong) => {
                debug!("Pong received");
                self.awaiting_pong = false;
            },
            ProtocolMessage::Status(StatusKind::Tared) => {
                info!("Tare acknowledged");
            },
            ProtocolMessage::Status(StatusKind::RateConfirmed(ms)) => {
                // fire-and-forget; sample timestamps come from the wall clock
                info!("Sample rate acknowledged: {}ms", ms);
            },
            ProtocolMessage::DeviceInfo(version) => {
                info!("Device firmware: {}", version);
                self.firmware_tx.send_replace(Some(version));
            },
        }
    }

    async fn on_deadline(&mut self, now: Instant) {
        if self.scan_deadline.is_some_and(|deadline| deadline <= now) {
            self.scan_deadline = None;
            self.on_scan_timeout(now).await;
        }

        if self.connect_deadline.is_some_and(|deadline| deadline <= now) {
            self.connect_deadline = None;
            self.on_connect_timeout(now).await;
        }

        if self.reconnect_at.is_some_and(|deadline| deadline <= now) {
            self.reconnect_at = None;
            if let Some(target) = self.target.clone() {
                self.begin_connect(target, true).await;
            }
        }

        if self.watchdog_deadline.is_some_and(|deadline| deadline <= now) {
            self.watchdog_deadline = None;
            self.on_watchdog(now).await;
        }
    }

    async fn on_scan_timeout(&mut self, now: Instant) {
        if self.fallback_scan {
            // could not rediscover the bound identity; go back to direct retries
            self.fallback_scan = false;
            self.transport(TransportCommand::StopScan).await;
            self.schedule_reconnect(now);
            return;
        }

        if self.discovered.is_empty() {
            warn!("Scan timed out without discovering a device");
            self.transport(TransportCommand::StopScan).await;
            self.set_state(ConnectionState::Error { message: "no device found".to_string() });
        }
        // with a non-empty set the scan keeps running; the caller decides
        // when to connect or stop
    }

    async fn on_connect_timeout(&mut self, now: Instant) {
        warn!("Connection attempt timed out");
        self.transport(TransportCommand::Disconnect).await;

        if self.reconnecting {
            self.schedule_reconnect(now);
        } else {
            self.target = None;
            self.set_state(ConnectionState::Error { message: "timeout".to_string() });
        }
    }

    async fn on_watchdog(&mut self, now: Instant) {
        if !self.is_connected() {
            return;
        }

        if self.awaiting_pong {
            // suspected stale link; actual failure detection stays with the
            // transport's disconnect callback
            warn!("Link may be stale: no reading or pong for {:?}", self.config.watchdog_timeout());
        } else {
            debug!("No reading for {:?}, pinging", self.config.watchdog_timeout());
            self.awaiting_pong = true;
            self.transport(TransportCommand::Write(Command::Ping.encode())).await;
        }

        self.watchdog_deadline = Some(now + self.config.watchdog_timeout());
    }
}
