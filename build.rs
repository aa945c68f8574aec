use std::{env, error::Error, fs, path::Path};

use serde::Deserialize;

const CONFIG_FILE: &str = "cfg.toml";
const EXAMPLE_CONFIG_FILE: &str = "cfg.toml.example";

#[derive(Deserialize)]
struct RawConfig {
    device_id: String,
    #[serde(default)]
    debug: bool,
    io_username: String,
    io_key: String,
    #[serde(default = "default_mqtt_hostname")]
    mqtt_hostname: String,
    #[serde(default = "default_mqtt_port")]
    mqtt_port: u16,
    apn: String,
    #[serde(default)]
    apn_username: String,
    #[serde(default)]
    apn_password: String,
    max_conn_failures: Option<u8>,
    publish_interval_seconds: u16,
    keep_alive_seconds: u16,
    signal_feed: String,
    battery_feed: String,
}

fn default_mqtt_hostname() -> String {
    "io.adafruit.com".into()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn main() -> Result<(), Box<dyn Error>> {
    // Tell Cargo to rerun if toml changes
    println!("cargo:rerun-if-changed={}", CONFIG_FILE);
    println!("cargo:rerun-if-changed={}", EXAMPLE_CONFIG_FILE);

    let source = if Path::new(CONFIG_FILE).exists() {
        CONFIG_FILE
    } else {
        println!(
            "cargo:warning={} not found, building with {}",
            CONFIG_FILE, EXAMPLE_CONFIG_FILE
        );
        EXAMPLE_CONFIG_FILE
    };

    // Read and parse
    let toml_str = fs::read_to_string(source)?;
    let raw: RawConfig = toml::from_str(&toml_str)?;

    if raw.publish_interval_seconds == 0 {
        return Err("publish_interval_seconds must be at least 1".into());
    }
    if raw.keep_alive_seconds == 0 {
        println!("cargo:warning=keep_alive_seconds is 0, broker keep-alive and pings are off");
    }

    // Generate Rust code
    let code = format!(
        r#"
        pub const CONFIG: Config = Config {{
            device_id: {id:?},
            debug: {debug},
            io_username: {user:?},
            io_key: {key:?},
            mqtt_hostname: {mh:?},
            mqtt_port: {mp},
            apn: {apn:?},
            apn_username: {apn_user:?},
            apn_password: {apn_pwd:?},
            max_conn_failures: {max:?},
            publish_interval_seconds: {intv},
            keep_alive_seconds: {ka},
            signal_feed: {signal:?},
            battery_feed: {battery:?},
        }};
    "#,
        id = raw.device_id,
        debug = raw.debug,
        user = raw.io_username,
        key = raw.io_key,
        mh = raw.mqtt_hostname,
        mp = raw.mqtt_port,
        apn = raw.apn,
        apn_user = raw.apn_username,
        apn_pwd = raw.apn_password,
        max = raw.max_conn_failures,
        intv = raw.publish_interval_seconds,
        ka = raw.keep_alive_seconds,
        signal = raw.signal_feed,
        battery = raw.battery_feed,
    );

    let out_dir = env::var("OUT_DIR")?;
    let dest_path = Path::new(&out_dir).join("config.rs");
    fs::write(dest_path, code)?;
    Ok(())
}
