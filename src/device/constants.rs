use uuid::Uuid;

/**
 * How long (milliseconds) a scan may run before an empty discovery set is
 * reported as "no device found".
 */
pub const SCAN_TIMEOUT: u64 = 10_000;

/**
 * How long (milliseconds) a connection attempt may take before it is
 * cancelled.
 */
pub const CONNECT_TIMEOUT: u64 = 5_000;

/**
 * How long (milliseconds) a connected link may go without a reading before
 * the watchdog sends a PING.
 */
pub const WATCHDOG_TIMEOUT: u64 = 2_000;

/**
 * Delay (milliseconds) before the first automatic reconnection attempt.
 * Doubles after every failed attempt.
 */
pub const RECONNECT_DELAY_INITIAL: u64 = 1_000;

/**
 * Ceiling (milliseconds) for the reconnection delay.
 */
pub const RECONNECT_DELAY_MAX: u64 = 30_000;

/**
 * How long (milliseconds) a write to the command characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2_000;

/**
 * Sample interval (milliseconds) the device boots with, and the clamp range
 * accepted by CMD:RATE.
 */
pub const DEFAULT_SAMPLE_RATE_MS: u32 = 50;
pub const MIN_SAMPLE_RATE_MS: u32 = 20;
pub const MAX_SAMPLE_RATE_MS: u32 = 1_000;

/**
 * The UUID of the Bluetooth BLE service exposed by the GripFit dynamometer.
 */
pub const GRIPFIT_SERVICE: &str = "8e400001-f315-4f60-9fb8-838830daea50";

/**
 * The two GATT characteristics under the service. Note that on some firmware
 * revisions their labels are swapped relative to their function; the binding
 * selects by capability (notify vs write), never by which UUID is which.
 */
pub const GRIPFIT_DATA_CHARACTERISTIC: &str = "8e400002-f315-4f60-9fb8-838830daea50";
pub const GRIPFIT_COMMAND_CHARACTERISTIC: &str = "8e400003-f315-4f60-9fb8-838830daea50";

/**
 * Raw counts per kilogram. Fixed factory scale; per-device calibration is
 * handled outside this crate.
 */
pub const RAW_COUNTS_PER_KG: f64 = 10_000.0;

pub fn make_gripfit_service_uuid() -> Uuid {
    Uuid::parse_str(GRIPFIT_SERVICE).unwrap()
}
