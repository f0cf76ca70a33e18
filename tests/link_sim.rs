//! End-to-end scenarios driving the full link stack over the simulated
//! transport. Time is paused, so the simulated delays elapse instantly.

use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use gripfit_link::config::types::LinkConfig;
use gripfit_link::device::manager::{spawn_link, GripLink};
use gripfit_link::device::types::ConnectionState;
use gripfit_link::transport::sim::spawn_sim_transport;

struct Rig {
    link: GripLink,
    cancel: CancellationToken,
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn sim_rig() -> Rig {
    let cancel = CancellationToken::new();
    let (transport, _transport_handle) = spawn_sim_transport(cancel.clone());
    let (link, _link_handle) = spawn_link(LinkConfig::default(), transport, cancel.clone());
    Rig { link, cancel }
}

async fn scan_and_connect(rig: &Rig) {
    let mut devices = rig.link.watch_discovered_devices();
    rig.link.start_scanning().await;

    while devices.borrow_and_update().is_empty() {
        devices.changed().await.unwrap();
    }

    let first = rig.link.discovered_devices().first().cloned().unwrap();
    rig.link.connect(first.id).await;

    let mut state = rig.link.watch_connection_state();
    loop {
        let current = state.borrow_and_update().clone();
        match current {
            ConnectionState::Connected { .. } => break,
            ConnectionState::Error { message } => panic!("connection failed: {}", message),
            _ => state.changed().await.unwrap(),
        }
    }
}

/// Collects every published force value until `deadline`.
async fn collect_forces(link: &GripLink, deadline: Instant) -> Vec<f64> {
    let mut force = link.watch_current_force();
    let mut samples = Vec::new();

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => break,
            result = force.changed() => {
                result.unwrap();
                samples.push(*force.borrow());
            },
        }
    }

    samples
}

#[tokio::test(start_paused = true)]
async fn scanning_surfaces_three_devices_after_the_simulated_delay() {
    let rig = sim_rig();
    let mut devices = rig.link.watch_discovered_devices();

    let started = Instant::now();
    rig.link.start_scanning().await;
    assert_eq!(rig.link.connection_state(), ConnectionState::Scanning);

    while devices.borrow_and_update().len() < 3 {
        devices.changed().await.unwrap();
    }

    let elapsed = Instant::now() - started;
    assert!(elapsed >= Duration::from_millis(1_400), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(2_500), "{:?}", elapsed);

    let discovered = rig.link.discovered_devices();
    assert_eq!(discovered.len(), 3);
    // varied signal strengths, distinct identities
    assert!(discovered.windows(2).all(|w| w[0].rssi_dbm != w[1].rssi_dbm));
    assert!(discovered.windows(2).all(|w| w[0].id != w[1].id));
}

#[tokio::test(start_paused = true)]
async fn connecting_publishes_state_and_firmware() {
    let rig = sim_rig();
    scan_and_connect(&rig).await;

    match rig.link.connection_state() {
        ConnectionState::Connected { device_name } => assert_eq!(device_name, "GripFit Pro"),
        state => panic!("unexpected state {:?}", state),
    }

    // the D: and S:READY lines arrive right behind the connection event
    sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.link.firmware_version(), Some("1.2.0".to_string()));
    assert!(rig.link.sensor_ready());
}

#[tokio::test(start_paused = true)]
async fn six_seconds_of_streaming_contain_a_full_squeeze_cycle() {
    let rig = sim_rig();
    scan_and_connect(&rig).await;

    let samples = collect_forces(&rig.link, Instant::now() + Duration::from_secs(6)).await;

    // ~20Hz for 6 seconds
    assert!(samples.len() >= 100, "only {} samples", samples.len());

    let peak = samples.iter().cloned().fold(0.0, f64::max);
    assert!(peak >= 20.0, "peak was {}", peak);
    // troughs near zero at both ends of the window
    assert!(samples.iter().take(5).all(|f| *f < 5.0));
    assert!(*samples.last().unwrap() < 5.0);
    assert!(samples.iter().all(|f| *f >= 0.0));
}

#[tokio::test(start_paused = true)]
async fn recording_a_window_yields_a_consistent_artifact() {
    let rig = sim_rig();
    scan_and_connect(&rig).await;

    rig.link.start_recording().await;
    sleep(Duration::from_secs(6)).await;
    let recording = rig.link.stop_recording().await.expect("expected a recording");

    assert!(!rig.link.is_recording());
    assert!(recording.samples.len() >= 100);
    assert!(recording.duration_seconds >= 5.9);

    let peak = recording.samples.iter().map(|s| s.force_kg).fold(f64::MIN, f64::max);
    let mean = recording.samples.iter().map(|s| s.force_kg).sum::<f64>()
        / recording.samples.len() as f64;
    assert!((recording.peak_force_kg - peak).abs() < 1e-9);
    assert!((recording.average_force_kg - mean).abs() < 1e-9);
    assert!(recording
        .samples
        .windows(2)
        .all(|w| w[0].elapsed_seconds < w[1].elapsed_seconds));
}

#[tokio::test(start_paused = true)]
async fn stop_recording_without_starting_returns_none() {
    let rig = sim_rig();
    assert!(rig.link.stop_recording().await.is_none());

    scan_and_connect(&rig).await;
    assert!(rig.link.stop_recording().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn changing_the_sample_rate_changes_the_cadence() {
    let rig = sim_rig();
    scan_and_connect(&rig).await;

    rig.link.set_sample_rate(100).await;
    // let the acknowledgement land before measuring
    sleep(Duration::from_millis(200)).await;

    let samples = collect_forces(&rig.link, Instant::now() + Duration::from_secs(2)).await;
    assert!(samples.len() >= 15 && samples.len() <= 25, "{} samples", samples.len());
}

#[tokio::test(start_paused = true)]
async fn disconnect_resets_published_values() {
    let rig = sim_rig();
    scan_and_connect(&rig).await;
    sleep(Duration::from_secs(2)).await;

    rig.link.disconnect().await;

    let mut state = rig.link.watch_connection_state();
    loop {
        if *state.borrow_and_update() == ConnectionState::Disconnected {
            break;
        }
        state.changed().await.unwrap();
    }
    assert_eq!(rig.link.current_force(), 0.0);
    assert_eq!(rig.link.firmware_version(), None);
    assert!(!rig.link.sensor_ready());

    // and calling it again is a harmless no-op
    rig.link.disconnect().await;
    assert_eq!(rig.link.connection_state(), ConnectionState::Disconnected);
}
