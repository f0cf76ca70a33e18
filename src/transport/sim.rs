use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::device::constants::{DEFAULT_SAMPLE_RATE_MS, RAW_COUNTS_PER_KG};
use crate::device::types::{DeviceId, DiscoveredDevice};
use crate::transport::{
    ConnectFailure, DisconnectReason, TransportCommand, TransportEvent, TransportHandle,
};

/// How long (milliseconds) the simulated scan takes to surface its devices.
const SIM_SCAN_DELAY: u64 = 1_500;

/// How long (milliseconds) the simulated connection handshake takes.
const SIM_CONNECT_DELAY: u64 = 500;

const SIM_FIRMWARE: &str = "1.2.0";

fn sim_devices() -> Vec<DiscoveredDevice> {
    vec![
        DiscoveredDevice {
            id: DeviceId("SIM:71:C4:02".to_string()),
            name: "GripFit Pro".to_string(),
            rssi_dbm: -48,
        },
        DiscoveredDevice {
            id: DeviceId("SIM:9E:11:5A".to_string()),
            name: "GripFit Pro".to_string(),
            rssi_dbm: -67,
        },
        DiscoveredDevice {
            id: DeviceId("SIM:3B:D8:77".to_string()),
            name: "GripFit".to_string(),
            rssi_dbm: -81,
        },
    ]
}

/**
 * Spawns the simulated transport. It satisfies the same externally observable
 * contract and event ordering as the btleplug binding, so the link task (and
 * everything above it) cannot tell the two apart.
 */
pub fn spawn_sim_transport(cancel: CancellationToken) -> (TransportHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = channel::<TransportCommand>(16);
    let (event_tx, event_rx) = channel::<TransportEvent>(64);

    let handle = spawn(sim_transport_task(cancel, command_rx, event_tx));

    (TransportHandle { commands: command_tx, events: event_rx }, handle)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

struct SimTransport {
    events: Sender<TransportEvent>,
    // pending scan reveal / connect confirmation
    reveal_at: Option<Instant>,
    connecting: Option<(Instant, DeviceId)>,
    connected: Option<DeviceId>,
    sample_period: Duration,
    next_sample_at: Option<Instant>,
    profile: SqueezeProfile,
}

async fn sim_transport_task(
    cancel: CancellationToken,
    mut commands: Receiver<TransportCommand>,
    events: Sender<TransportEvent>,
) {
    let mut sim = SimTransport {
        events,
        reveal_at: None,
        connecting: None,
        connected: None,
        sample_period: Duration::from_millis(DEFAULT_SAMPLE_RATE_MS as u64),
        next_sample_at: None,
        profile: SqueezeProfile::new(),
    };

    'mainloop: loop {
        let deadline = sim.next_deadline();

        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            command = commands.next() => match command {
                Some(command) => sim.handle_command(command).await,
                None => break 'mainloop, // the link task is gone
            },
            _ = sleep_until_opt(deadline) => {
                sim.on_deadline(Instant::now()).await;
            },
        }
    }
}

impl SimTransport {
    fn next_deadline(&self) -> Option<Instant> {
        [
            self.reveal_at,
            self.connecting.as_ref().map(|(at, _)| *at),
            self.next_sample_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn emit(&mut self, event: TransportEvent) {
        if let Err(err) = self.events.send(event).await {
            warn!("Failed to deliver transport event: {:?}", err);
        }
    }

    async fn notify(&mut self, line: String) {
        self.emit(TransportEvent::Notification(line.into_bytes())).await;
    }

    async fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::StartScan => {
                info!("Simulated scan started");
                self.reveal_at = Some(Instant::now() + Duration::from_millis(SIM_SCAN_DELAY));
            },
            TransportCommand::StopScan => {
                self.reveal_at = None;
            },
            TransportCommand::Connect(id) => {
                if sim_devices().iter().any(|device| device.id == id) {
                    self.connecting = Some((
                        Instant::now() + Duration::from_millis(SIM_CONNECT_DELAY),
                        id,
                    ));
                } else {
                    self.emit(TransportEvent::ConnectFailed(ConnectFailure::UnknownDevice)).await;
                }
            },
            TransportCommand::Write(bytes) => self.handle_write(bytes).await,
            TransportCommand::Disconnect => {
                self.reveal_at = None;
                self.connecting = None;
                if self.connected.take().is_some() {
                    info!("Simulated device disconnected");
                    self.next_sample_at = None;
                    self.emit(TransportEvent::Disconnected { reason: DisconnectReason::Requested }).await;
                }
            },
        }
    }

    /// No real device latency needs emulation, so commands acknowledge
    /// immediately with the matching status message.
    async fn handle_write(&mut self, bytes: Vec<u8>) {
        if self.connected.is_none() {
            debug!("Simulated write ignored: not connected");
            return;
        }

        let text = String::from_utf8_lossy(&bytes);
        let line = text.trim_end_matches('\n').to_string();
        self.emit(TransportEvent::WriteCompleted).await;

        match line.as_str() {
            "CMD:PING" => self.notify("S:PONG\n".to_string()).await,
            "CMD:TARE" => self.notify("S:TARED\n".to_string()).await,
            "CMD:INFO" => self.notify(format!("D:GRIPFIT,{}\n", SIM_FIRMWARE)).await,
            line => match line.strip_prefix("CMD:RATE:") {
                Some(ms) => match ms.parse::<u64>() {
                    Ok(ms) if ms > 0 => {
                        self.sample_period = Duration::from_millis(ms);
                        self.notify(format!("S:RATE:{}\n", ms)).await;
                    },
                    _ => warn!("Simulated device received a bad rate: {:?}", line),
                },
                None => warn!("Simulated device received an unknown command: {:?}", line),
            },
        }
    }

    async fn on_deadline(&mut self, now: Instant) {
        if self.reveal_at.is_some_and(|at| at <= now) {
            self.reveal_at = None;
            for device in sim_devices() {
                self.emit(TransportEvent::Discovered(device)).await;
            }
        }

        if self.connecting.as_ref().is_some_and(|(at, _)| *at <= now) {
            let (_, id) = self.connecting.take().unwrap();
            let name = sim_devices()
                .iter()
                .find(|device| device.id == id)
                .map(|device| device.name.clone())
                .unwrap_or_else(|| "GripFit".to_string());

            info!("Simulated device {} connected", id);
            self.connected = Some(id);
            self.profile = SqueezeProfile::new();
            self.next_sample_at = Some(now + self.sample_period);

            self.emit(TransportEvent::Connected { name }).await;
            // sent once per fresh connection, like the real device
            self.notify(format!("D:GRIPFIT,{}\n", SIM_FIRMWARE)).await;
            self.notify("S:READY\n".to_string()).await;
        }

        if self.next_sample_at.is_some_and(|at| at <= now) {
            self.next_sample_at = Some(now + self.sample_period);
            let force_kg = self.profile.advance(self.sample_period);
            let raw = (force_kg * RAW_COUNTS_PER_KG).round() as i32;
            self.notify(format!("R:{}\n", raw)).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SqueezePhase {
    Idle,
    RampUp,
    Hold,
    RampDown,
    Rest,
}

/**
 * Generates a force curve statistically indistinguishable from a real grip
 * squeeze: idle, ramp up to a randomized peak, hold it with a little tremor,
 * release, rest, repeat with a fresh peak. Pure stepped state, so the shape
 * can be tested without timers.
 */
pub struct SqueezeProfile {
    phase: SqueezePhase,
    elapsed: Duration,
    phase_duration: Duration,
    peak_kg: f64,
}

impl SqueezeProfile {
    pub fn new() -> Self {
        SqueezeProfile {
            phase: SqueezePhase::Idle,
            elapsed: Duration::ZERO,
            phase_duration: Duration::from_millis(1_000),
            peak_kg: 0.0,
        }
    }

    /// Steps the generator forward by `dt` and returns the current force.
    pub fn advance(&mut self, dt: Duration) -> f64 {
        self.elapsed += dt;
        if self.elapsed >= self.phase_duration {
            self.next_phase();
        }

        let mut rng = rand::thread_rng();
        let progress = self.elapsed.as_secs_f64() / self.phase_duration.as_secs_f64();

        let force = match self.phase {
            SqueezePhase::Idle | SqueezePhase::Rest => rng.gen_range(0.0..0.3),
            SqueezePhase::RampUp => self.peak_kg * progress + rng.gen_range(-0.5..0.5),
            SqueezePhase::Hold => self.peak_kg + rng.gen_range(-0.02..0.02) * self.peak_kg,
            SqueezePhase::RampDown => self.peak_kg * (1.0 - progress) + rng.gen_range(-0.3..0.3),
        };

        force.max(0.0)
    }

    fn next_phase(&mut self) {
        let mut rng = rand::thread_rng();
        self.elapsed = Duration::ZERO;

        let (phase, duration) = match self.phase {
            SqueezePhase::Idle | SqueezePhase::Rest => {
                self.peak_kg = rng.gen_range(25.0..60.0);
                (SqueezePhase::RampUp, Duration::from_millis(500))
            },
            SqueezePhase::RampUp => {
                let hold_ms: u64 = rng.gen_range(2_000..3_000);
                (SqueezePhase::Hold, Duration::from_millis(hold_ms))
            },
            SqueezePhase::Hold => (SqueezePhase::RampDown, Duration::from_millis(1_000)),
            SqueezePhase::RampDown => {
                let rest_ms: u64 = rng.gen_range(1_500..3_000);
                (SqueezePhase::Rest, Duration::from_millis(rest_ms))
            },
        };

        self.phase = phase;
        self.phase_duration = duration;
    }
}

impl Default for SqueezeProfile {
    fn default() -> Self {
        SqueezeProfile::new()
    }
}
