use std::time::Duration;

/**
 * How long an active scan may run before the peripheral is declared not found.
 */
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/**
 * How long the radio-level connect may take.
 */
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/**
 * How long enumerating the services of a connected peripheral may take.
 */
pub const SERVICE_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/**
 * Pause before enumerating the characteristics of each service. Simblee/RFduino based peripherals
 * drop requests that arrive back to back.
 */
pub const CHARACTERISTIC_PAUSE: Duration = Duration::from_millis(100);

/**
 * Spacing and number of the connection status checks done right after connecting.
 */
pub const STABILIZE_INTERVAL: Duration = Duration::from_millis(500);
pub const STABILIZE_CHECKS: u32 = 4;

/**
 * How long a write to the command characteristic may take.
 */
pub const WRITE_DEADLINE: Duration = Duration::from_millis(2000);

/**
 * Wait after tearing down a link, so that the host radio stack has released its handles before the
 * next connect. Reconnecting sooner yields "access denied" errors on some stacks.
 */
pub const RELEASE_SETTLE: Duration = Duration::from_secs(2);

/**
 * Reconnection attempts within a single recovery run.
 */
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/**
 * Delay before each reconnection attempt; the last entry repeats.
 */
pub const BACKOFF_SCHEDULE: [Duration; 6] = [
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(8),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

/**
 * First byte of a heartbeat notification sent by the peripheral.
 */
pub const HEARTBEAT_MARKER: u8 = 0xFE;

/**
 * Heartbeats are logged at most this often.
 */
pub const HEARTBEAT_LOG_INTERVAL: Duration = Duration::from_secs(30);

/**
 * Default advertised name of the peripheral.
 */
pub const DEFAULT_DEVICE_NAME: &str = "RFduino";

// RFduino/Simblee custom characteristics share the first 32 bits of their uuid:
// 2d30c082-...: device -> host (notify), used for the heartbeat
// 2d30c083-...: host -> device (write), the command channel
// 2d30c084-...: disconnect request, never written to
pub const DEVICE_TO_HOST_PREFIX: u32 = 0x2d30c082;
pub const HOST_TO_DEVICE_PREFIX: u32 = 0x2d30c083;

/**
 * 16-bit id of the RFduino service. Writable characteristics of this service are used when the
 * host -> device characteristic is not advertised.
 */
pub const FALLBACK_SERVICE: u16 = 0xfe84;

pub const DEVICE_INFORMATION_SERVICE: u16 = 0x180a;

/**
 * Standard characteristics that some stacks report as writable but must never receive a status.
 */
pub const BLOCKED_CHARACTERISTICS: &[u16] = &[
    0x2a00, // Device Name
    0x2a01, // Appearance
    0x2a04, // Peripheral Preferred Connection Parameters
    // Device Information service members
    0x2a23, 0x2a24, 0x2a25, 0x2a26, 0x2a27, 0x2a28, 0x2a29, 0x2a2a, 0x2a50,
];
