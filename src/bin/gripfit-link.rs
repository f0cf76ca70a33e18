use clap::Parser;
use log::{error, info};
use tokio::time::{interval, sleep, Duration};
use tokio_util::sync::CancellationToken;

use gripfit_link::config::io::read_config;
use gripfit_link::device::manager::spawn_link;
use gripfit_link::device::types::ConnectionState;
use gripfit_link::error::AppRunError;
use gripfit_link::transport::ble::spawn_ble_transport;
use gripfit_link::transport::sim::spawn_sim_transport;
use gripfit_link::init_logging;

/// Field-diagnostic tool for the GripFit link layer: scans, connects to the
/// strongest device, streams force readings, and can capture a recording.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Use the simulated device instead of the bluetooth radio.
    #[arg(long)]
    simulate: bool,

    /// Stream for this many seconds once connected.
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// Capture the streamed window as a recording and print its summary.
    #[arg(long)]
    record: bool,
}

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    init_logging();
    info!(concat!("gripfit-link ", env!("CARGO_PKG_VERSION")));

    let args = Args::parse();
    let config = read_config().await?;

    let cancel = CancellationToken::new();
    let (transport, _transport_handle) = if args.simulate || config.simulate {
        info!("Using the simulated transport");
        spawn_sim_transport(cancel.clone())
    } else {
        spawn_ble_transport(cancel.clone())
    };

    let (link, _link_handle) = spawn_link(config, transport, cancel.clone());

    let mut state_rx = link.watch_connection_state();
    let mut devices_rx = link.watch_discovered_devices();

    link.start_scanning().await;

    // wait for the first discovery (or a terminal scan error)
    loop {
        tokio::select! {
            result = devices_rx.changed() => {
                result.expect("link task is gone");
                if !devices_rx.borrow().is_empty() {
                    break;
                }
            },
            result = state_rx.changed() => {
                result.expect("link task is gone");
                let state = state_rx.borrow().clone();
                if let ConnectionState::Error { message } = state {
                    error!("Scan failed: {}", message);
                    cancel.cancel();
                    return Ok(());
                }
            },
        }
    }

    // give slower advertisers a moment, then pick the strongest signal
    sleep(Duration::from_secs(1)).await;
    let device = link
        .discovered_devices()
        .into_iter()
        .max_by_key(|device| device.rssi_dbm)
        .expect("discovered set was emptied");
    println!("Connecting to {} ({}, {}dBm)", device.name, device.id, device.rssi_dbm);
    link.connect(device.id).await;

    loop {
        state_rx.changed().await.expect("link task is gone");
        let state = state_rx.borrow().clone();
        match state {
            ConnectionState::Connected { device_name } => {
                println!("Connected to {}", device_name);
                break;
            },
            ConnectionState::Error { message } => {
                error!("Connection failed: {}", message);
                cancel.cancel();
                return Ok(());
            },
            _ => {},
        }
    }

    if args.record {
        link.start_recording().await;
    }

    let mut ticker = interval(Duration::from_millis(500));
    for _ in 0..(args.seconds * 2) {
        ticker.tick().await;
        println!(
            "force: {:6.2} kg   firmware: {}   sensor ready: {}",
            link.current_force(),
            link.firmware_version().unwrap_or_else(|| "?".to_string()),
            link.sensor_ready(),
        );
    }

    if args.record {
        match link.stop_recording().await {
            Some(recording) => {
                println!("Recording {}:", recording.id);
                println!("  samples:  {}", recording.samples.len());
                println!("  duration: {:.2} s", recording.duration_seconds);
                println!("  peak:     {:.2} kg", recording.peak_force_kg);
                println!("  average:  {:.2} kg", recording.average_force_kg);
            },
            None => println!("The recording window captured no samples"),
        }
    }

    link.disconnect().await;
    cancel.cancel();
    Ok(())
}
