#![no_std]
#![no_main]

use static_cell::StaticCell;

use atat::asynch::Client;
use atat::{AtatIngress, ResponseSlot, UrcChannel};
use embassy_executor::Spawner;
use embassy_time::{Delay, Duration, Timer};

use esp_backtrace as _;
use esp_hal::{self as hal};
use esp_println::logger::init_logger;

use hal::{
    gpio::{Level, Output, OutputConfig},
    rtc_cntl::Rtc,
    timer::timg::TimerGroup,
    uart::{Uart, UartRx, UartTx},
    Async,
};

use gsm_core::{
    bridge::ping_interval_secs,
    fona::{self, Fona, ModemIngress, ModemUrcs, CLIENT_BUF_SIZE, INGRESS_BUF_SIZE},
    Bridge, BridgeError, ConnectionSupervisor, Settings,
};

pub mod config;
pub mod constants;
mod watchdog;

use config::CONFIG;
use constants::*;
use watchdog::Watchdog;

esp_bootloader_esp_idf::esp_app_desc!();

type ModemBridge = Bridge<'static, UartTx<'static, Async>, Output<'static>, Delay>;

static RES_SLOT: ResponseSlot<INGRESS_BUF_SIZE> = ResponseSlot::new();
static URC_CHANNEL: ModemUrcs = UrcChannel::new();
static INGRESS_BUF: StaticCell<[u8; INGRESS_BUF_SIZE]> = StaticCell::new();
static CLIENT_BUF: StaticCell<[u8; CLIENT_BUF_SIZE]> = StaticCell::new();
static BRIDGE: StaticCell<ModemBridge> = StaticCell::new();

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) {
    init_logger(if CONFIG.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    log::info!("GSM MQTT bridge v{} ({})", VERSION, CONFIG.device_id);

    let peripherals = esp_hal::init(esp_hal::Config::default());

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timg0.timer0);

    let watchdog = Watchdog::new(Rtc::new(peripherals.LPWR));

    // let the modem supply settle before the first reset pulse
    Timer::after(Duration::from_millis(STARTUP_DELAY_MS)).await;

    let (tx_pin, rx_pin) = (peripherals.GPIO17, peripherals.GPIO16);

    let uart_config = hal::uart::Config::default()
        .with_baudrate(MODEM_BAUD_RATE)
        .with_stop_bits(hal::uart::StopBits::_1)
        .with_data_bits(hal::uart::DataBits::_8)
        .with_parity(hal::uart::Parity::None);

    let uart = Uart::new(peripherals.UART2, uart_config)
        .unwrap()
        .with_tx(tx_pin)
        .with_rx(rx_pin)
        .into_async();

    let reset = Output::new(peripherals.GPIO4, Level::High, OutputConfig::default());

    let (rx, tx) = uart.split();
    let ingress = fona::ingress(
        INGRESS_BUF.init([0; INGRESS_BUF_SIZE]),
        &RES_SLOT,
        &URC_CHANNEL,
    );
    let client = Client::new(
        tx,
        &RES_SLOT,
        CLIENT_BUF.init([0; CLIENT_BUF_SIZE]),
        atat::Config::default(),
    );
    let fona = Fona::new(client, &URC_CHANNEL, reset, Delay);
    let bridge = BRIDGE.init(Bridge::new(fona, settings()));

    spawner.spawn(ingress_task(ingress, rx)).ok();
    spawner.spawn(bridge_task(bridge, watchdog)).ok();
}

fn settings() -> Settings<'static> {
    Settings {
        client_id: CONFIG.device_id,
        username: CONFIG.io_username,
        key: CONFIG.io_key,
        broker_host: CONFIG.mqtt_hostname,
        broker_port: CONFIG.mqtt_port,
        keep_alive_secs: CONFIG.keep_alive_seconds,
        apn: CONFIG.apn,
        apn_username: CONFIG.apn_username,
        apn_password: CONFIG.apn_password,
        signal_feed: CONFIG.signal_feed,
        battery_feed: CONFIG.battery_feed,
    }
}

#[embassy_executor::task]
async fn ingress_task(mut ingress: ModemIngress<'static>, mut rx: UartRx<'static, Async>) {
    ingress.read_from(&mut rx).await
}

#[embassy_executor::task]
async fn bridge_task(bridge: &'static mut ModemBridge, mut watchdog: Watchdog) {
    match bridge.start().await {
        Ok(model) => log::info!("Modem ready: {:?}", model),
        // without a failure cap a dead GPRS bearer is left to the retry loop
        Err(BridgeError::Gprs) if CONFIG.max_conn_failures.is_none() => {
            log::error!("Failed to turn GPRS on");
        }
        Err(e) => {
            match e {
                BridgeError::ModemNotFound => log::error!("Modem did not answer, giving up"),
                BridgeError::Gprs => log::error!("Failed to turn GPRS on, resetting..."),
                other => log::error!("Modem start error: {:?}", other),
            }
            if CONFIG.max_conn_failures.is_some() {
                watchdog.reset();
            }
            watchdog::hang();
        }
    }

    let mut supervisor = ConnectionSupervisor::new(CONFIG.max_conn_failures, MQTT_RETRY_DELAY_MS);
    let mut delay = Delay;

    loop {
        if let Err(e) = supervisor.ensure_connected(bridge, &mut delay).await {
            log::error!("{}", e);
            watchdog.reset();
        }

        if let Err(e) = bridge.publish_telemetry().await {
            log::error!("Publish error: {:?}", e);
        }

        idle(bridge).await;
    }
}

/// Wait out the publish interval, pinging the broker often enough to keep
/// the session within its keep-alive.
async fn idle(bridge: &mut ModemBridge) {
    let interval = u64::from(CONFIG.publish_interval_seconds);
    let Some(ping_every) = ping_interval_secs(CONFIG.keep_alive_seconds) else {
        Timer::after(Duration::from_secs(interval)).await;
        return;
    };

    let mut waited = 0;
    while waited < interval {
        let step = ping_every.min(interval - waited);
        Timer::after(Duration::from_secs(step)).await;
        waited += step;

        if waited < interval {
            if let Err(e) = bridge.keep_alive().await {
                // the next round reconnects
                log::warn!("Keep-alive failed: {:?}", e);
                return;
            }
        }
    }
}
