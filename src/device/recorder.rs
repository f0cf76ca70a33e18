use std::time::SystemTime;
use log::{debug, info};
use tokio::time::Instant;
use uuid::Uuid;

use crate::device::types::{ForceSample, Recording};

/**
 * Buffers force samples while a recording window is open and finalizes them
 * into an immutable `Recording`. Owned exclusively by the link task; external
 * consumers only ever see the finished artifact.
 */
#[derive(Debug, Default)]
pub struct SessionRecorder {
    window: Option<Window>,
}

#[derive(Debug)]
struct Window {
    started_instant: Instant,
    started_at: SystemTime,
    samples: Vec<ForceSample>,
}

impl SessionRecorder {
    pub fn new() -> Self {
        SessionRecorder { window: None }
    }

    pub fn is_recording(&self) -> bool {
        self.window.is_some()
    }

    /// Opens a recording window. A no-op if one is already open.
    pub fn start(&mut self, now: Instant) {
        if self.window.is_some() {
            debug!("start_recording: already recording");
            return;
        }

        info!("Recording started");
        self.window = Some(Window {
            started_instant: now,
            started_at: SystemTime::now(),
            samples: Vec::new(),
        });
    }

    /// Appends a sample, timed relative to the window's start instant.
    pub fn record(&mut self, now: Instant, force_kg: f64) {
        if let Some(window) = &mut self.window {
            window.samples.push(ForceSample {
                elapsed_seconds: now.duration_since(window.started_instant).as_secs_f64(),
                force_kg,
            });
        }
    }

    /**
     * Closes the window. Returns `None` when no window is open or when it
     * captured zero samples; the buffer and start instant are cleared either
     * way. Peak and average are recomputed over the full buffer here, never
     * accumulated incrementally.
     */
    pub fn stop(&mut self, now: Instant) -> Option<Recording> {
        let window = match self.window.take() {
            Some(window) => window,
            None => {
                debug!("stop_recording: not recording");
                return None;
            },
        };

        if window.samples.is_empty() {
            info!("Recording stopped without capturing any samples");
            return None;
        }

        let peak = window.samples.iter().map(|s| s.force_kg).fold(f64::MIN, f64::max);
        let sum: f64 = window.samples.iter().map(|s| s.force_kg).sum();
        let average = sum / window.samples.len() as f64;
        let duration = now.duration_since(window.started_instant).as_secs_f64();

        info!(
            "Recording stopped: {} samples over {:.2}s, peak {:.2}kg",
            window.samples.len(), duration, peak,
        );

        Some(Recording {
            id: Uuid::new_v4(),
            started_at: window.started_at,
            peak_force_kg: peak,
            average_force_kg: average,
            duration_seconds: duration,
            samples: window.samples,
        })
    }

    /// Discards an in-flight window without producing an artifact.
    pub fn abandon(&mut self) {
        if self.window.take().is_some() {
            info!("In-flight recording discarded");
        }
    }
}
