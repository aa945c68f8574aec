pub struct Config {
    // Device ID (used as MQTT client identifier)
    pub device_id: &'static str,

    // Log at debug level
    pub debug: bool,

    // Adafruit IO user name, also the first topic segment
    pub io_username: &'static str,

    // Adafruit IO key, sent as MQTT password
    pub io_key: &'static str,

    // MQTT broker hostname
    pub mqtt_hostname: &'static str,

    // MQTT port
    pub mqtt_port: u16,

    // Access point name of the cellular data service
    pub apn: &'static str,

    // APN user name (empty when not required)
    pub apn_username: &'static str,

    // APN password (empty when not required)
    pub apn_password: &'static str,

    // Failed broker connections in a row before resetting the device,
    // none to retry forever
    pub max_conn_failures: Option<u8>,

    // Publish interval in seconds
    pub publish_interval_seconds: u16,

    // MQTT keep-alive in seconds
    pub keep_alive_seconds: u16,

    // Feed receiving the signal strength in dBm
    pub signal_feed: &'static str,

    // Feed receiving the supply voltage in mV
    pub battery_feed: &'static str,
}

// config values are generated at compile time
include!(concat!(env!("OUT_DIR"), "/config.rs"));
