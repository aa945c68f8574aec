//! MQTT 3.1.1 client driven over any `embedded-io-async` transport.
//!
//! The client does not own its transport: every operation borrows the
//! stream for its duration, so the same client survives reconnects of the
//! underlying TCP link.

use core::fmt;

use embedded_io_async::{Error as _, ErrorKind, Read, Write};
use heapless::String;
use log::{debug, warn};

pub mod packet;

pub use packet::{ConnectOptions, Packet, QoS};

/// Size of the outgoing packet buffer
pub const MQTT_TX_BUFFER_SIZE: usize = 512;
/// Size of the incoming packet buffer
pub const MQTT_RX_BUFFER_SIZE: usize = 256;
/// Longest topic name the bridge builds
pub const TOPIC_MAX: usize = 96;

/// Packets read while waiting for a specific reply before giving up
const MAX_UNRELATED_PACKETS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The underlying stream failed
    Transport(ErrorKind),
    /// The broker refused the connection
    Refused(ConnectReturnCode),
    /// The broker sent something that is not valid here
    Protocol,
    /// A packet did not fit into the client buffers
    BufferTooSmall,
    /// An operation needing a session was called without one
    NotConnected,
}

/// Non-zero CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
    RateLimited,
    Banned,
    Unknown(u8),
}

impl ConnectReturnCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUserNameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            6 => ConnectReturnCode::RateLimited,
            7 => ConnectReturnCode::Banned,
            other => ConnectReturnCode::Unknown(other),
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ConnectReturnCode::UnacceptableProtocolVersion => {
                "The Server does not support the level of the MQTT protocol requested"
            }
            ConnectReturnCode::IdentifierRejected => {
                "The Client identifier is correct UTF-8 but not allowed by the Server"
            }
            ConnectReturnCode::ServerUnavailable => "The MQTT service is unavailable",
            ConnectReturnCode::BadUserNameOrPassword => {
                "The data in the user name or password is malformed"
            }
            ConnectReturnCode::NotAuthorized => "Not authorized to connect",
            ConnectReturnCode::RateLimited => {
                "Exceeded reconnect rate limit. Please try again later."
            }
            ConnectReturnCode::Banned => {
                "You have been banned from connecting. Please contact the MQTT server administrator for more details."
            }
            ConnectReturnCode::Unknown(_) => "Unknown error",
        };
        f.write_str(message)
    }
}

/// Connect failure text: the broker's refusal reason, "Connection failed"
/// for a broken transport, "Unknown error" for anything else.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(_) => f.write_str("Connection failed"),
            Error::Refused(code) => write!(f, "{}", code),
            Error::Protocol | Error::BufferTooSmall | Error::NotConnected => {
                f.write_str("Unknown error")
            }
        }
    }
}

/// Adafruit IO topic for a feed: `{username}/feeds/{feed}`.
pub fn feed_topic(username: &str, feed: &str) -> Result<String<TOPIC_MAX>, Error> {
    use core::fmt::Write as _;

    let mut topic = String::new();
    write!(topic, "{}/feeds/{}", username, feed).map_err(|_| Error::BufferTooSmall)?;
    Ok(topic)
}

pub struct MqttClient<'a> {
    options: ConnectOptions<'a>,
    connected: bool,
    next_packet_id: u16,
    tx: [u8; MQTT_TX_BUFFER_SIZE],
    rx: [u8; MQTT_RX_BUFFER_SIZE],
}

impl<'a> MqttClient<'a> {
    pub fn new(options: ConnectOptions<'a>) -> Self {
        Self {
            options,
            connected: false,
            next_packet_id: 1,
            tx: [0; MQTT_TX_BUFFER_SIZE],
            rx: [0; MQTT_RX_BUFFER_SIZE],
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Forget the session without talking to the broker.
    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    pub async fn connect<T: Read + Write>(&mut self, transport: &mut T) -> Result<(), Error> {
        self.connected = false;

        let n = packet::encode_connect(&mut self.tx, &self.options)?;
        self.send(transport, n).await?;

        match packet::read_packet(transport, &mut self.rx).await? {
            Packet::ConnAck { return_code: 0, .. } => {
                debug!("MQTT CONNACK accepted");
                self.connected = true;
                Ok(())
            }
            Packet::ConnAck { return_code, .. } => Err(Error::Refused(
                ConnectReturnCode::from_code(return_code),
            )),
            other => {
                warn!("Expected CONNACK, got {:?}", other);
                Err(Error::Protocol)
            }
        }
    }

    pub async fn publish<T: Read + Write>(
        &mut self,
        transport: &mut T,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> Result<(), Error> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        let packet_id = match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => self.take_packet_id(),
        };
        let n = packet::encode_publish(&mut self.tx, topic, payload, qos, packet_id)?;
        let sent = self.send(transport, n).await;
        self.guard(sent)?;
        debug!("MQTT published {} bytes to {}", payload.len(), topic);

        if qos == QoS::AtLeastOnce {
            let acked = self
                .wait_for(transport, |p| p == Packet::PubAck { packet_id })
                .await;
            self.guard(acked)?;
        }
        Ok(())
    }

    pub async fn ping<T: Read + Write>(&mut self, transport: &mut T) -> Result<(), Error> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        let n = packet::encode_pingreq(&mut self.tx)?;
        let sent = self.send(transport, n).await;
        self.guard(sent)?;
        let answered = self.wait_for(transport, |p| p == Packet::PingResp).await;
        self.guard(answered)
    }

    /// Send DISCONNECT if a session is open. The session is considered
    /// closed afterwards whatever the transport says.
    pub async fn disconnect<T: Read + Write>(&mut self, transport: &mut T) -> Result<(), Error> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        let n = packet::encode_disconnect(&mut self.tx)?;
        self.send(transport, n).await
    }

    async fn send<T: Write>(&mut self, transport: &mut T, len: usize) -> Result<(), Error> {
        transport
            .write_all(&self.tx[..len])
            .await
            .map_err(|e| Error::Transport(e.kind()))?;
        transport
            .flush()
            .await
            .map_err(|e| Error::Transport(e.kind()))
    }

    /// Read packets until `matches` accepts one. Incoming QoS 1 publishes
    /// are acknowledged on the way.
    async fn wait_for<T, F>(&mut self, transport: &mut T, matches: F) -> Result<(), Error>
    where
        T: Read + Write,
        F: Fn(Packet) -> bool,
    {
        for _ in 0..MAX_UNRELATED_PACKETS {
            let received = packet::read_packet(transport, &mut self.rx).await?;
            if matches(received) {
                return Ok(());
            }

            if let Packet::Publish {
                qos: 1,
                packet_id: Some(id),
            } = received
            {
                let n = packet::encode_puback(&mut self.tx, id)?;
                self.send(transport, n).await?;
            }
            debug!("MQTT skipping {:?}", received);
        }
        Err(Error::Protocol)
    }

    /// Drop the session when an operation failed in a way that leaves the
    /// stream in an unknown state.
    fn guard(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        if result.is_err() {
            self.connected = false;
        }
        result
    }

    fn take_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSerial;
    use embassy_futures::block_on;

    fn client() -> MqttClient<'static> {
        MqttClient::new(ConnectOptions {
            client_id: "bridge",
            username: Some("mouzy"),
            password: Some("key"),
            keep_alive_secs: 300,
            clean_session: true,
        })
    }

    #[test]
    fn connect_accepted() {
        let mut client = client();
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x20, 0x02, 0x00, 0x00]);

        block_on(client.connect(&mut transport)).unwrap();
        assert!(client.is_connected());
        assert_eq!(transport.tx[0], 0x10);
    }

    #[test]
    fn connect_refused_reports_return_code() {
        let mut client = client();
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x20, 0x02, 0x00, 0x04]);

        let err = block_on(client.connect(&mut transport)).unwrap_err();
        assert_eq!(
            err,
            Error::Refused(ConnectReturnCode::BadUserNameOrPassword)
        );
        assert!(!client.is_connected());
        assert_eq!(
            std::format!("{}", err),
            "The data in the user name or password is malformed"
        );
    }

    #[test]
    fn connect_without_reply_is_transport_error() {
        let mut client = client();
        let mut transport = ScriptedSerial::new();

        let err = block_on(client.connect(&mut transport)).unwrap_err();
        assert_eq!(err, Error::Transport(ErrorKind::ConnectionReset));
        assert_eq!(std::format!("{}", err), "Connection failed");
    }

    #[test]
    fn malformed_connack_reads_unknown_error() {
        let mut client = client();
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x20, 0x03, 0x00, 0x00, 0x00]);

        let err = block_on(client.connect(&mut transport)).unwrap_err();
        assert_eq!(err, Error::Protocol);
        assert_eq!(std::format!("{}", err), "Unknown error");
    }

    #[test]
    fn publish_requires_session() {
        let mut client = client();
        let mut transport = ScriptedSerial::new();

        assert_eq!(
            block_on(client.publish(&mut transport, "t", b"1", QoS::AtMostOnce)),
            Err(Error::NotConnected)
        );
        assert!(transport.tx.is_empty());
    }

    #[test]
    fn qos1_publish_waits_for_matching_ack() {
        let mut client = client();
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x20, 0x02, 0x00, 0x00]);
        block_on(client.connect(&mut transport)).unwrap();

        // a stray ping response before the ack
        transport.push_bytes(&[0xD0, 0x00, 0x40, 0x02, 0x00, 0x01]);
        block_on(client.publish(&mut transport, "mouzy/feeds/rssi", b"-71", QoS::AtLeastOnce))
            .unwrap();
        assert!(client.is_connected());
    }

    #[test]
    fn lost_ack_drops_session() {
        let mut client = client();
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x20, 0x02, 0x00, 0x00]);
        block_on(client.connect(&mut transport)).unwrap();

        assert!(block_on(client.publish(&mut transport, "t", b"1", QoS::AtLeastOnce)).is_err());
        assert!(!client.is_connected());
    }

    #[test]
    fn incoming_publish_is_acknowledged_while_waiting() {
        let mut client = client();
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x20, 0x02, 0x00, 0x00]);
        block_on(client.connect(&mut transport)).unwrap();
        transport.tx.clear();

        transport.push_bytes(&[0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x2A, 0xD0, 0x00]);
        block_on(client.ping(&mut transport)).unwrap();
        assert_eq!(transport.tx, [0xC0, 0x00, 0x40, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn disconnect_sends_packet_once() {
        let mut client = client();
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x20, 0x02, 0x00, 0x00]);
        block_on(client.connect(&mut transport)).unwrap();
        transport.tx.clear();

        block_on(client.disconnect(&mut transport)).unwrap();
        block_on(client.disconnect(&mut transport)).unwrap();
        assert_eq!(transport.tx, [0xE0, 0x00]);
        assert!(!client.is_connected());
    }

    #[test]
    fn feed_topics() {
        assert_eq!(
            feed_topic("mouzy34", "battery").unwrap().as_str(),
            "mouzy34/feeds/battery"
        );
    }

    #[test]
    fn packet_ids_skip_zero() {
        let mut client = client();
        client.next_packet_id = u16::MAX;
        assert_eq!(client.take_packet_id(), u16::MAX);
        assert_eq!(client.take_packet_id(), 1);
    }
}
