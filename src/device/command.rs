use crate::device::constants::{MAX_SAMPLE_RATE_MS, MIN_SAMPLE_RATE_MS};

/// Control intents the app can issue to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Tare,
    RequestInfo,
    SetRate(u32),
}

impl Command {
    /**
     * Encodes the intent as its newline-terminated ASCII wire form. An
     * out-of-range rate is clamped, never rejected.
     */
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Ping => b"CMD:PING\n".to_vec(),
            Command::Tare => b"CMD:TARE\n".to_vec(),
            Command::RequestInfo => b"CMD:INFO\n".to_vec(),
            Command::SetRate(ms) => {
                let ms = (*ms).clamp(MIN_SAMPLE_RATE_MS, MAX_SAMPLE_RATE_MS);
                format!("CMD:RATE:{}\n", ms).into_bytes()
            },
        }
    }
}
