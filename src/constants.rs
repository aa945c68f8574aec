/// Current firmware version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Baud rate of the modem serial link
pub const MODEM_BAUD_RATE: u32 = 4800;

/// Pause between two broker connection attempts
pub const MQTT_RETRY_DELAY_MS: u32 = 5000;

/// Watchdog timeout used to reset the device
pub const WATCHDOG_TIMEOUT_MS: u64 = 8000;

/// Delay after power-up before talking to the modem
pub const STARTUP_DELAY_MS: u64 = 1000;
