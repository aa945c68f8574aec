//! MQTT 3.1.1 control packets used by the bridge.

use embedded_io_async::{Error as _, ErrorKind, Read, ReadExactError};

use super::Error;

pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const PUBACK: u8 = 4;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

/// Protocol level of MQTT 3.1.1
const PROTOCOL_LEVEL: u8 = 4;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_CLEAN_SESSION: u8 = 0x02;

/// Largest value the four-byte remaining length field can hold
const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    fn bits(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

/// Packets the client expects to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    ConnAck { session_present: bool, return_code: u8 },
    PubAck { packet_id: u16 },
    PingResp,
    /// An incoming publish; only the acknowledgement details are kept
    Publish { qos: u8, packet_id: Option<u16> },
    Other(u8),
}

/// Bounds-checked writer over a packet buffer.
struct Writer<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    fn put_u8(&mut self, value: u8) -> Result<(), Error> {
        self.put_slice(&[value])
    }

    fn put_u16(&mut self, value: u16) -> Result<(), Error> {
        self.put_slice(&value.to_be_bytes())
    }

    fn put_slice(&mut self, data: &[u8]) -> Result<(), Error> {
        let end = self.len + data.len();
        if end > self.buf.len() {
            return Err(Error::BufferTooSmall);
        }
        self.buf[self.len..end].copy_from_slice(data);
        self.len = end;
        Ok(())
    }

    /// Length-prefixed UTF-8 string or binary field
    fn put_field(&mut self, data: &[u8]) -> Result<(), Error> {
        let len = u16::try_from(data.len()).map_err(|_| Error::BufferTooSmall)?;
        self.put_u16(len)?;
        self.put_slice(data)
    }

    fn put_remaining_length(&mut self, mut len: usize) -> Result<(), Error> {
        if len > MAX_REMAINING_LENGTH {
            return Err(Error::BufferTooSmall);
        }
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            self.put_u8(byte)?;
            if len == 0 {
                return Ok(());
            }
        }
    }
}

pub fn encode_connect(buf: &mut [u8], options: &ConnectOptions<'_>) -> Result<usize, Error> {
    let mut flags = 0;
    let mut payload_len = 2 + options.client_id.len();
    if options.clean_session {
        flags |= FLAG_CLEAN_SESSION;
    }
    if let Some(username) = options.username {
        flags |= FLAG_USERNAME;
        payload_len += 2 + username.len();
    }
    if let Some(password) = options.password {
        flags |= FLAG_PASSWORD;
        payload_len += 2 + password.len();
    }

    // protocol name, level, flags, keep alive
    let variable_header_len = 6 + 1 + 1 + 2;

    let mut w = Writer::new(buf);
    w.put_u8(CONNECT << 4)?;
    w.put_remaining_length(variable_header_len + payload_len)?;
    w.put_field(b"MQTT")?;
    w.put_u8(PROTOCOL_LEVEL)?;
    w.put_u8(flags)?;
    w.put_u16(options.keep_alive_secs)?;
    w.put_field(options.client_id.as_bytes())?;
    if let Some(username) = options.username {
        w.put_field(username.as_bytes())?;
    }
    if let Some(password) = options.password {
        w.put_field(password.as_bytes())?;
    }
    Ok(w.len)
}

pub fn encode_publish(
    buf: &mut [u8],
    topic: &str,
    payload: &[u8],
    qos: QoS,
    packet_id: u16,
) -> Result<usize, Error> {
    let id_len = if qos == QoS::AtMostOnce { 0 } else { 2 };
    let remaining = 2 + topic.len() + id_len + payload.len();

    let mut w = Writer::new(buf);
    w.put_u8(PUBLISH << 4 | qos.bits() << 1)?;
    w.put_remaining_length(remaining)?;
    w.put_field(topic.as_bytes())?;
    if qos != QoS::AtMostOnce {
        w.put_u16(packet_id)?;
    }
    w.put_slice(payload)?;
    Ok(w.len)
}

pub fn encode_puback(buf: &mut [u8], packet_id: u16) -> Result<usize, Error> {
    let mut w = Writer::new(buf);
    w.put_u8(PUBACK << 4)?;
    w.put_u8(2)?;
    w.put_u16(packet_id)?;
    Ok(w.len)
}

pub fn encode_pingreq(buf: &mut [u8]) -> Result<usize, Error> {
    let mut w = Writer::new(buf);
    w.put_u8(PINGREQ << 4)?;
    w.put_u8(0)?;
    Ok(w.len)
}

pub fn encode_disconnect(buf: &mut [u8]) -> Result<usize, Error> {
    let mut w = Writer::new(buf);
    w.put_u8(DISCONNECT << 4)?;
    w.put_u8(0)?;
    Ok(w.len)
}

/// Read one packet from `transport`, using `buf` for its body.
pub async fn read_packet<T: Read>(transport: &mut T, buf: &mut [u8]) -> Result<Packet, Error> {
    let mut header = [0u8; 1];
    read_exact(transport, &mut header).await?;

    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    let mut length_bytes = 0;
    loop {
        let mut byte = [0u8; 1];
        read_exact(transport, &mut byte).await?;
        remaining += usize::from(byte[0] & 0x7F) * multiplier;
        length_bytes += 1;
        if byte[0] & 0x80 == 0 {
            break;
        }
        if length_bytes == 4 {
            return Err(Error::Protocol);
        }
        multiplier *= 128;
    }

    if remaining > buf.len() {
        return Err(Error::BufferTooSmall);
    }
    let body = &mut buf[..remaining];
    read_exact(transport, body).await?;

    decode(header[0], body)
}

fn decode(header: u8, body: &[u8]) -> Result<Packet, Error> {
    match header >> 4 {
        CONNACK => {
            if body.len() != 2 {
                return Err(Error::Protocol);
            }
            Ok(Packet::ConnAck {
                session_present: body[0] & 0x01 != 0,
                return_code: body[1],
            })
        }
        PUBACK => {
            if body.len() != 2 {
                return Err(Error::Protocol);
            }
            Ok(Packet::PubAck {
                packet_id: u16::from_be_bytes([body[0], body[1]]),
            })
        }
        PINGRESP => Ok(Packet::PingResp),
        PUBLISH => {
            let qos = (header >> 1) & 0x03;
            if body.len() < 2 {
                return Err(Error::Protocol);
            }
            let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
            let packet_id = if qos > 0 {
                let at = 2 + topic_len;
                if body.len() < at + 2 {
                    return Err(Error::Protocol);
                }
                Some(u16::from_be_bytes([body[at], body[at + 1]]))
            } else {
                None
            };
            Ok(Packet::Publish { qos, packet_id })
        }
        other => Ok(Packet::Other(other)),
    }
}

async fn read_exact<T: Read>(transport: &mut T, buf: &mut [u8]) -> Result<(), Error> {
    transport.read_exact(buf).await.map_err(|e| match e {
        ReadExactError::UnexpectedEof => Error::Transport(ErrorKind::ConnectionReset),
        ReadExactError::Other(e) => Error::Transport(e.kind()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSerial;
    use embassy_futures::block_on;

    #[test]
    fn connect_with_credentials() {
        let mut buf = [0u8; 64];
        let options = ConnectOptions {
            client_id: "fona",
            username: Some("user"),
            password: Some("key"),
            keep_alive_secs: 300,
            clean_session: true,
        };

        let n = encode_connect(&mut buf, &options).unwrap();
        assert_eq!(
            &buf[..n],
            &[
                0x10, 27, // fixed header
                0x00, 0x04, b'M', b'Q', b'T', b'T', 4, 0xC2, 0x01, 0x2C, // variable header
                0x00, 0x04, b'f', b'o', b'n', b'a', //
                0x00, 0x04, b'u', b's', b'e', b'r', //
                0x00, 0x03, b'k', b'e', b'y',
            ]
        );
    }

    #[test]
    fn publish_qos1_carries_packet_id() {
        let mut buf = [0u8; 32];
        let n = encode_publish(&mut buf, "a/b", b"42", QoS::AtLeastOnce, 7).unwrap();
        assert_eq!(
            &buf[..n],
            &[0x32, 9, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x07, b'4', b'2']
        );
    }

    #[test]
    fn publish_qos0_has_no_packet_id() {
        let mut buf = [0u8; 32];
        let n = encode_publish(&mut buf, "t", b"x", QoS::AtMostOnce, 7).unwrap();
        assert_eq!(&buf[..n], &[0x30, 4, 0x00, 0x01, b't', b'x']);
    }

    #[test]
    fn long_payload_uses_multi_byte_length() {
        let mut buf = [0u8; 256];
        let payload = [0u8; 200];
        let n = encode_publish(&mut buf, "t", &payload, QoS::AtMostOnce, 0).unwrap();
        // 3 + 200 = 203 = 0xCB 0x01
        assert_eq!(&buf[..3], &[0x30, 0xCB, 0x01]);
        assert_eq!(n, 3 + 203);
    }

    #[test]
    fn encoding_into_small_buffer_fails() {
        let mut buf = [0u8; 4];
        assert_eq!(
            encode_publish(&mut buf, "topic", b"payload", QoS::AtMostOnce, 0),
            Err(Error::BufferTooSmall)
        );
    }

    #[test]
    fn decodes_connack_and_puback() {
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x20, 0x02, 0x00, 0x05, 0x40, 0x02, 0x12, 0x34, 0xD0, 0x00]);
        let mut buf = [0u8; 16];

        assert_eq!(
            block_on(read_packet(&mut transport, &mut buf)),
            Ok(Packet::ConnAck {
                session_present: false,
                return_code: 5
            })
        );
        assert_eq!(
            block_on(read_packet(&mut transport, &mut buf)),
            Ok(Packet::PubAck { packet_id: 0x1234 })
        );
        assert_eq!(
            block_on(read_packet(&mut transport, &mut buf)),
            Ok(Packet::PingResp)
        );
    }

    #[test]
    fn packet_arriving_a_byte_at_a_time() {
        let mut transport = ScriptedSerial::new();
        transport.max_read = 1;
        transport.push_bytes(&[0x20, 0x02, 0x01, 0x00]);
        let mut buf = [0u8; 16];

        assert_eq!(
            block_on(read_packet(&mut transport, &mut buf)),
            Ok(Packet::ConnAck {
                session_present: true,
                return_code: 0
            })
        );
    }

    #[test]
    fn decodes_incoming_publish_id() {
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x32, 0x07, 0x00, 0x01, b't', 0x00, 0x09, b'h', b'i']);
        let mut buf = [0u8; 16];

        assert_eq!(
            block_on(read_packet(&mut transport, &mut buf)),
            Ok(Packet::Publish {
                qos: 1,
                packet_id: Some(9)
            })
        );
    }

    #[test]
    fn truncated_packet_is_a_transport_error() {
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x20, 0x02, 0x00]);
        let mut buf = [0u8; 16];

        assert_eq!(
            block_on(read_packet(&mut transport, &mut buf)),
            Err(Error::Transport(ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn oversized_packet_is_refused() {
        let mut transport = ScriptedSerial::new();
        transport.push_bytes(&[0x30, 0x20]);
        let mut buf = [0u8; 16];

        assert_eq!(
            block_on(read_packet(&mut transport, &mut buf)),
            Err(Error::BufferTooSmall)
        );
    }
}
