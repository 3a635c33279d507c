use btleplug::api::bleuuid::uuid_from_u16;
use std::time::Duration;
use uuid::Uuid;

/// UUID for the Heart Rate Service.
pub const HEARTRATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);
/// UUID for the Heart Rate Measurement Characteristic.
pub const HEARTRATE_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2A37);
/// UUID for the Client Characteristic Configuration Descriptor.
pub const CLIENT_CONFIG_DESCRIPTOR_UUID: Uuid = uuid_from_u16(0x2902);

pub const MONITOR_NAME: &str = "Bluetooth Smart HRP";

/// Grace period for the first sample after a start.
pub const START_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum silence once the session is running.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(30);
/// Resolution of the watchdog timer.
pub const WATCHDOG_TICK: Duration = Duration::from_secs(1);
/// Finest accepted watchdog resolution.
pub const MIN_WATCHDOG_TICK: Duration = Duration::from_millis(1);
/// Delay before the GATT service is opened.
pub const INIT_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_SMOOTHING_FACTOR: usize = 1;

/// Heart rates at or below this value never update the session minimum.
pub const MIN_PLAUSIBLE_HEART_RATE: u16 = 30;
/// Heart rates at or above this value never update the session maximum.
pub const MAX_PLAUSIBLE_HEART_RATE: u16 = 240;

pub const START_TIMEOUT_REASON: &str = "start timeout";
pub const RUN_TIMEOUT_REASON: &str = "communication timeout";

pub const DEFAULT_LOGGER_DELIMITER: &str = ";";
#[cfg(windows)]
pub const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_ENDING: &str = "\n";

/// Capacity of the broadcast channels carrying monitor and logger events.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
