use std::collections::HashMap;
use std::pin::Pin;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::stream::Stream;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{make_gripfit_service_uuid, WRITE_DEADLINE};
use crate::device::types::{DeviceId, DiscoveredDevice};
use crate::error::DeviceError;
use crate::transport::{
    ConnectFailure, DisconnectReason, ScanFailure, TransportCommand, TransportEvent,
    TransportHandle,
};

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// Spawns the btleplug-backed transport task.
pub fn spawn_ble_transport(cancel: CancellationToken) -> (TransportHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = channel::<TransportCommand>(16);
    let (event_tx, event_rx) = channel::<TransportEvent>(64);

    let handle = spawn(ble_transport_task(cancel, command_rx, event_tx));

    (TransportHandle { commands: command_tx, events: event_rx }, handle)
}

struct ActiveLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_cancel: CancellationToken,
    notify_task: JoinHandle<Result<(), DeviceError>>,
}

struct BleTransport {
    cancel: CancellationToken,
    events: Sender<TransportEvent>,
    adapter: Option<Adapter>,
    // every peripheral seen during the current scan cycle
    peripherals: HashMap<DeviceId, Peripheral>,
    link: Option<ActiveLink>,
    disconnect_requested: bool,
}

async fn next_central_event(stream: &mut Option<CentralEvents>) -> CentralEvent {
    match stream {
        Some(stream) => match stream.next().await {
            Some(event) => event,
            None => futures::future::pending().await,
        },
        None => futures::future::pending().await,
    }
}

async fn ble_transport_task(
    cancel: CancellationToken,
    mut commands: Receiver<TransportCommand>,
    events: Sender<TransportEvent>,
) {
    let mut transport = BleTransport {
        cancel: cancel.clone(),
        events,
        adapter: None,
        peripherals: HashMap::new(),
        link: None,
        disconnect_requested: false,
    };
    let mut central_events: Option<CentralEvents> = None;

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            command = commands.next() => match command {
                Some(command) => transport.handle_command(command, &mut central_events).await,
                None => break 'mainloop, // the link task is gone
            },
            event = next_central_event(&mut central_events) => {
                transport.handle_central_event(event).await;
            },
        }
    }

    transport.teardown().await;
}

impl BleTransport {
    async fn emit(&mut self, event: TransportEvent) {
        if let Err(err) = self.events.send(event).await {
            warn!("Failed to deliver transport event: {:?}", err);
        }
    }

    async fn handle_command(
        &mut self,
        command: TransportCommand,
        central_events: &mut Option<CentralEvents>,
    ) {
        match command {
            TransportCommand::StartScan => self.start_scan(central_events).await,
            TransportCommand::StopScan => self.stop_scan().await,
            TransportCommand::Connect(id) => self.connect(id).await,
            TransportCommand::Write(bytes) => self.write(bytes).await,
            TransportCommand::Disconnect => self.disconnect().await,
        }
    }

    async fn ensure_adapter(&mut self) -> Result<Adapter, DeviceError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(DeviceError::NoAdapter)?;
        info!(
            "Using adapter {}",
            adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()),
        );
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn start_scan(&mut self, central_events: &mut Option<CentralEvents>) {
        let adapter = match self.ensure_adapter().await {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!("No usable bluetooth adapter: {:?}", err);
                self.emit(TransportEvent::ScanFailed(ScanFailure::Unsupported)).await;
                return;
            },
        };

        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOff) => {
                self.emit(TransportEvent::ScanFailed(ScanFailure::PoweredOff)).await;
                return;
            },
            Ok(_) => {},
            Err(err) => {
                // not every platform reports a state; scanning will tell
                debug!("Could not query adapter state: {:?}", err);
            },
        }

        if central_events.is_none() {
            match adapter.events().await {
                Ok(stream) => *central_events = Some(stream),
                Err(err) => {
                    warn!("Failed to subscribe to adapter events: {:?}", err);
                    self.emit(TransportEvent::ScanFailed(ScanFailure::Unsupported)).await;
                    return;
                },
            }
        }

        self.peripherals.clear();

        let filter = ScanFilter { services: vec![make_gripfit_service_uuid()] };
        info!("Scanning...");
        if let Err(err) = adapter.start_scan(filter).await {
            warn!("Scanning failed: {:?}", err);
            let failure = match err {
                btleplug::Error::PermissionDenied => ScanFailure::Unauthorized,
                _ => ScanFailure::Unsupported,
            };
            self.emit(TransportEvent::ScanFailed(failure)).await;
        }
    }

    async fn stop_scan(&mut self) {
        if let Some(adapter) = &self.adapter {
            if let Err(err) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {:?}", err);
            }
        }
    }

    async fn handle_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                self.on_device_seen(id).await;
            },
            CentralEvent::DeviceDisconnected(id) => {
                self.on_device_disconnected(id).await;
            },
            _ => {},
        }
    }

    async fn on_device_seen(&mut self, id: PeripheralId) {
        let adapter = match &self.adapter {
            Some(adapter) => adapter.clone(),
            None => return,
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripheral: {:?}", err);
                return;
            },
        };

        let properties = match peripheral.properties().await {
            Err(err) => {
                warn!("Could not query peripheral for properties: {:?}", err);
                return;
            },
            Ok(None) => {
                debug!("Peripheral has no properties");
                return;
            },
            Ok(Some(properties)) => properties,
        };

        // Some environments ignore the filter, so make sure to check the service uuid again
        if !properties.services.contains(&make_gripfit_service_uuid()) {
            return;
        }

        let device_id = DeviceId(peripheral.address().to_string());
        let device = DiscoveredDevice {
            id: device_id.clone(),
            name: properties.local_name.unwrap_or_else(|| "GripFit".to_string()),
            rssi_dbm: properties.rssi.unwrap_or(-127),
        };

        self.peripherals.insert(device_id, peripheral);
        self.emit(TransportEvent::Discovered(device)).await;
    }

    async fn on_device_disconnected(&mut self, id: PeripheralId) {
        let matches_link = self
            .link
            .as_ref()
            .is_some_and(|link| link.peripheral.id() == id);
        if !matches_link {
            return;
        }

        let link = self.link.take().unwrap();
        link.notify_cancel.cancel();
        let _ = link.notify_task.await;

        let reason = if self.disconnect_requested {
            DisconnectReason::Requested
        } else {
            DisconnectReason::Unsolicited
        };
        self.disconnect_requested = false;
        info!("Peripheral disconnected ({:?})", reason);
        self.emit(TransportEvent::Disconnected { reason }).await;
    }

    async fn connect(&mut self, id: DeviceId) {
        let peripheral = match self.peripherals.get(&id) {
            Some(peripheral) => peripheral.clone(),
            None => {
                self.emit(TransportEvent::ConnectFailed(ConnectFailure::UnknownDevice)).await;
                return;
            },
        };

        self.disconnect_requested = false;

        match connect_peripheral(&peripheral).await {
            Ok((write_char, notify_uuid, name)) => {
                let notify_cancel = self.cancel.child_token();
                let notify_task = read_notifications_task(
                    notify_cancel.clone(),
                    &peripheral,
                    notify_uuid,
                    self.events.clone(),
                );
                self.link = Some(ActiveLink { peripheral, write_char, notify_cancel, notify_task });
                self.emit(TransportEvent::Connected { name }).await;
            },
            Err(DeviceError::MissingCharacteristic) => {
                // never present a connected-but-unusable link
                warn!("Peripheral lacks the notify/write characteristic pair");
                if let Err(err) = peripheral.disconnect().await {
                    warn!("Failed to disconnect unrecognized peripheral: {:?}", err);
                }
                self.emit(TransportEvent::ConnectFailed(ConnectFailure::NotRecognized)).await;
            },
            Err(err) => {
                warn!("Connecting to peripheral failed: {:?}", err);
                self.emit(TransportEvent::ConnectFailed(ConnectFailure::Failed(err.to_string()))).await;
            },
        }
    }

    async fn write(&mut self, bytes: Vec<u8>) {
        let (peripheral, write_char) = match &self.link {
            Some(link) => (link.peripheral.clone(), link.write_char.clone()),
            None => {
                debug!("Write ignored: no active link");
                return;
            },
        };

        let fut = peripheral.write(&write_char, &bytes, WriteType::WithResponse);

        tokio::select! {
            _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                warn!("Sending to command characteristic took too long");
            }
            result = fut => match result {
                Ok(()) => self.emit(TransportEvent::WriteCompleted).await,
                Err(err) => warn!("Failed to send to command characteristic: {:?}", err),
            }
        };
    }

    async fn disconnect(&mut self) {
        self.stop_scan().await;

        if let Some(link) = self.link.take() {
            self.disconnect_requested = true;
            link.notify_cancel.cancel();
            let _ = link.notify_task.await;
            if let Err(err) = link.peripheral.disconnect().await {
                warn!("Failed to disconnect peripheral: {:?}", err);
            }
            self.disconnect_requested = false;
            self.emit(TransportEvent::Disconnected { reason: DisconnectReason::Requested }).await;
        }
    }

    async fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            link.notify_cancel.cancel();
            let _ = link.notify_task.await;
            let _ = link.peripheral.disconnect().await;
        }
        self.stop_scan().await;
    }
}

/**
 * Connects and verifies the protocol surface: within the GripFit service
 * there must be a notifiable characteristic and a writable one. Role is
 * defined by capability; on some firmware revisions the two characteristic
 * labels are swapped, so UUIDs are deliberately not used for selection.
 */
async fn connect_peripheral(
    peripheral: &Peripheral,
) -> Result<(Characteristic, Uuid, String), DeviceError> {
    let service_uuid = make_gripfit_service_uuid();

    info!("Connecting to peripheral...");
    peripheral.connect().await?;

    info!("Connected; discovering services...");
    peripheral.discover_services().await?;

    for service in peripheral.services() {
        if !service.uuid.eq(&service_uuid) {
            continue;
        }

        let mut notify_char: Option<Characteristic> = None;
        let mut write_char: Option<Characteristic> = None;

        for characteristic in &service.characteristics {
            if notify_char.is_none() && characteristic.properties.contains(CharPropFlags::NOTIFY) {
                notify_char = Some(characteristic.clone());
            } else if write_char.is_none() && characteristic.properties.contains(CharPropFlags::WRITE) {
                write_char = Some(characteristic.clone());
            }
        }

        if let (Some(notify), Some(write)) = (notify_char, write_char) {
            info!("Subscribing to characteristic {:?} {:?}", service.uuid, notify.uuid);
            peripheral.subscribe(&notify).await?;

            let name = peripheral
                .properties()
                .await?
                .and_then(|properties| properties.local_name)
                .unwrap_or_else(|| "GripFit".to_string());

            return Ok((write, notify.uuid, name));
        }
    }

    Err(DeviceError::MissingCharacteristic)
}

fn read_notifications_task(
    cancel: CancellationToken,
    peripheral: &Peripheral,
    notify_uuid: Uuid,
    mut events: Sender<TransportEvent>,
) -> JoinHandle<Result<(), DeviceError>> {
    let peripheral = peripheral.clone();

    spawn(async move {
        let mut notifications = peripheral.notifications().await?;

        'notifyloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'notifyloop;
                },
                Some(data) = notifications.next() => {
                    if data.uuid.eq(&notify_uuid) {
                        if events.send(TransportEvent::Notification(data.value)).await.is_err() {
                            break 'notifyloop;
                        }
                    }
                },
            }
        }

        Ok(())
    })
}
