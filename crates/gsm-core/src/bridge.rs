//! Modem plus MQTT session: brings the cellular link up, keeps the broker
//! connection alive and publishes the modem's own telemetry.

use core::fmt::{self, Write as _};

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_io_async::Write;
use heapless::String;
use log::{debug, info, warn};

use crate::fona::{self, Fona, ModemType};
use crate::mqtt::{self, feed_topic, ConnectOptions, MqttClient, QoS};
use crate::supervisor::Connection;

/// Everything the bridge needs to reach the cellular network and broker.
#[derive(Debug, Clone, Copy)]
pub struct Settings<'a> {
    pub client_id: &'a str,
    pub username: &'a str,
    pub key: &'a str,
    pub broker_host: &'a str,
    pub broker_port: u16,
    pub keep_alive_secs: u16,
    pub apn: &'a str,
    pub apn_username: &'a str,
    pub apn_password: &'a str,
    pub signal_feed: &'a str,
    pub battery_feed: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// The modem never answered
    ModemNotFound,
    /// GPRS could not be enabled
    Gprs,
    Modem(fona::Error),
    Mqtt(mqtt::Error),
}

impl From<fona::Error> for BridgeError {
    fn from(e: fona::Error) -> Self {
        match e {
            fona::Error::NotFound => BridgeError::ModemNotFound,
            fona::Error::GprsFailed => BridgeError::Gprs,
            other => BridgeError::Modem(other),
        }
    }
}

impl From<mqtt::Error> for BridgeError {
    fn from(e: mqtt::Error) -> Self {
        BridgeError::Mqtt(e)
    }
}

/// Why a broker connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// The TCP link to the broker could not be opened
    Tcp(fona::Error),
    Mqtt(mqtt::Error),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Tcp(_) => f.write_str("Connection failed"),
            ConnectError::Mqtt(e) => write!(f, "{}", e),
        }
    }
}

/// Half the keep-alive, at least a second. `None` when the keep-alive is
/// off (0), so nothing needs pinging.
pub fn ping_interval_secs(keep_alive_secs: u16) -> Option<u64> {
    match keep_alive_secs {
        0 => None,
        secs => Some(u64::from(secs / 2).max(1)),
    }
}

pub struct Bridge<'a, W: Write, P, D> {
    fona: Fona<'a, W, P, D>,
    mqtt: MqttClient<'a>,
    settings: Settings<'a>,
}

impl<'a, W, P, D> Bridge<'a, W, P, D>
where
    W: Write,
    P: OutputPin,
    D: DelayNs,
{
    pub fn new(fona: Fona<'a, W, P, D>, settings: Settings<'a>) -> Self {
        let mqtt = MqttClient::new(ConnectOptions {
            client_id: settings.client_id,
            username: Some(settings.username),
            password: Some(settings.key),
            keep_alive_secs: settings.keep_alive_secs,
            clean_session: true,
        });
        Self {
            fona,
            mqtt,
            settings,
        }
    }

    pub fn fona(&self) -> &Fona<'a, W, P, D> {
        &self.fona
    }

    /// Find the modem, wait for home network registration and enable GPRS.
    pub async fn start(&mut self) -> Result<ModemType, BridgeError> {
        let model = self.fona.begin().await?;
        self.fona.wait_for_network().await?;
        self.fona
            .initialize_gprs(
                self.settings.apn,
                self.settings.apn_username,
                self.settings.apn_password,
            )
            .await?;
        Ok(model)
    }

    /// Publish signal strength (dBm) and supply voltage (mV) to their feeds.
    pub async fn publish_telemetry(&mut self) -> Result<(), BridgeError> {
        let signal = self.fona.rssi().await?;
        let battery_mv = self.fona.battery_mv().await?;

        match signal.dbm() {
            Some(dbm) => {
                let feed = self.settings.signal_feed;
                self.publish_value(feed, dbm).await?;
            }
            None => warn!("Signal strength unknown, not publishing"),
        }

        let feed = self.settings.battery_feed;
        self.publish_value(feed, battery_mv).await?;
        Ok(())
    }

    /// Ping the broker so it does not drop an idle session.
    pub async fn keep_alive(&mut self) -> Result<(), BridgeError> {
        let mut stream = self.fona.tcp_stream();
        self.mqtt.ping(&mut stream).await?;
        Ok(())
    }

    async fn publish_value<V: fmt::Display>(&mut self, feed: &str, value: V) -> Result<(), BridgeError> {
        let topic = feed_topic(self.settings.username, feed)?;
        let mut payload: String<16> = String::new();
        write!(payload, "{}", value).map_err(|_| mqtt::Error::BufferTooSmall)?;

        info!("Publishing {} to {}", payload, topic);
        let mut stream = self.fona.tcp_stream();
        self.mqtt
            .publish(&mut stream, &topic, payload.as_bytes(), QoS::AtLeastOnce)
            .await?;
        Ok(())
    }
}

impl<W, P, D> Connection for Bridge<'_, W, P, D>
where
    W: Write,
    P: OutputPin,
    D: DelayNs,
{
    type Error = ConnectError;

    /// Connected while the MQTT session is up and the modem still reports
    /// the TCP link open.
    async fn is_connected(&mut self) -> bool {
        if !self.mqtt.is_connected() {
            return false;
        }

        match self.fona.tcp_connected().await {
            Ok(true) => true,
            Ok(false) => {
                debug!("TCP link to broker dropped");
                self.mqtt.mark_disconnected();
                false
            }
            Err(e) => {
                debug!("TCP status query failed: {:?}", e);
                self.mqtt.mark_disconnected();
                false
            }
        }
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.fona
            .tcp_connect(self.settings.broker_host, self.settings.broker_port)
            .await
            .map_err(ConnectError::Tcp)?;

        let mut stream = self.fona.tcp_stream();
        self.mqtt
            .connect(&mut stream)
            .await
            .map_err(ConnectError::Mqtt)
    }

    async fn disconnect(&mut self) {
        let mut stream = self.fona.tcp_stream();
        if let Err(e) = self.mqtt.disconnect(&mut stream).await {
            debug!("MQTT disconnect: {:?}", e);
        }
        if let Err(e) = self.fona.tcp_close().await {
            debug!("TCP close: {:?}", e);
        }
    }
}
