//! SIM800 AT commands, their responses and the unsolicited result codes the
//! modem emits, expressed as `atat` types.
//!
//! Commands whose final result is a plain `OK`/`ERROR` are derived. Those that
//! finish with their own result line (`SHUT OK`, `CLOSE OK`, `SEND OK`) are
//! written without waiting for a response code, and the result arrives as a
//! [`Urc`].

use atat::atat_derive::{AtatCmd, AtatResp, AtatUrc};
use atat::InternalError;
use core::fmt::Write as _;
use heapless::{String, Vec};

use super::tcp::{MAX_READ_CHUNK, MAX_SEND_CHUNK};

/// `AT+CIPRXGET` mode switching the modem to manual receive
pub const RX_MODE_MANUAL: u8 = 1;
/// `AT+CIPRXGET` mode reporting how many bytes wait to be read
pub const RX_MODE_PENDING: u8 = 4;

#[derive(Clone, Debug, AtatResp)]
pub struct NoResponse;

#[derive(Clone, AtatCmd)]
#[at_cmd("", NoResponse, timeout_ms = 500)]
pub struct At;

#[derive(Clone, AtatCmd)]
#[at_cmd("E0", NoResponse)]
pub struct DisableEcho;

#[derive(Clone, AtatCmd)]
#[at_cmd("+CREG?", NetworkRegistration)]
pub struct GetNetworkRegistration;

#[derive(Clone, Debug, AtatResp)]
pub struct NetworkRegistration {
    #[at_arg(position = 0)]
    pub n: u8,
    #[at_arg(position = 1)]
    pub stat: u8,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CSQ", SignalReport)]
pub struct GetSignalQuality;

#[derive(Clone, Debug, AtatResp)]
pub struct SignalReport {
    #[at_arg(position = 0)]
    pub rssi: u8,
    #[at_arg(position = 1)]
    pub ber: u8,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CBC", BatteryCharge)]
pub struct GetBatteryCharge;

#[derive(Clone, Debug, AtatResp)]
pub struct BatteryCharge {
    #[at_arg(position = 0)]
    pub status: u8,
    #[at_arg(position = 1)]
    pub percent: u8,
    #[at_arg(position = 2)]
    pub millivolts: u16,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CGATT", NoResponse, timeout_ms = 10000)]
pub struct SetGprsAttach {
    #[at_arg(position = 0)]
    pub state: u8,
}

/// `AT+SAPBR=3,1,"<tag>","<value>"`
#[derive(Clone, AtatCmd)]
#[at_cmd("+SAPBR", NoResponse)]
pub struct SetBearerParameter {
    #[at_arg(position = 0)]
    pub cmd_type: u8,
    #[at_arg(position = 1)]
    pub cid: u8,
    #[at_arg(position = 2)]
    pub tag: String<8>,
    #[at_arg(position = 3)]
    pub value: String<64>,
}

/// `AT+SAPBR=1,1` opens the bearer, `AT+SAPBR=0,1` closes it.
#[derive(Clone, AtatCmd)]
#[at_cmd("+SAPBR", NoResponse, timeout_ms = 30000)]
pub struct BearerControl {
    #[at_arg(position = 0)]
    pub cmd_type: u8,
    #[at_arg(position = 1)]
    pub cid: u8,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CSTT", NoResponse)]
pub struct SetApn {
    #[at_arg(position = 0)]
    pub apn: String<64>,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CSTT", NoResponse)]
pub struct SetApnWithCredentials {
    #[at_arg(position = 0)]
    pub apn: String<64>,
    #[at_arg(position = 1)]
    pub username: String<64>,
    #[at_arg(position = 2)]
    pub password: String<64>,
}

/// Bring up the wireless connection
#[derive(Clone, AtatCmd)]
#[at_cmd("+CIICR", NoResponse, timeout_ms = 30000)]
pub struct BringUpWireless;

#[derive(Clone, AtatCmd)]
#[at_cmd("+CIPMUX", NoResponse)]
pub struct SetMultiConnection {
    #[at_arg(position = 0)]
    pub mode: u8,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CIPRXGET", NoResponse)]
pub struct SetReceiveMode {
    #[at_arg(position = 0)]
    pub mode: u8,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CIPRXGET", PendingData)]
pub struct GetPendingData {
    #[at_arg(position = 0)]
    pub mode: u8,
}

#[derive(Clone, Debug, AtatResp)]
pub struct PendingData {
    #[at_arg(position = 0)]
    pub mode: u8,
    #[at_arg(position = 1)]
    pub length: u16,
}

/// `AT+CIPSTART="TCP","<host>","<port>"`. `CONNECT OK` follows as a URC.
#[derive(Clone, AtatCmd)]
#[at_cmd("+CIPSTART", NoResponse, timeout_ms = 5000)]
pub struct StartConnection {
    #[at_arg(position = 0)]
    pub mode: String<4>,
    #[at_arg(position = 1)]
    pub host: String<64>,
    #[at_arg(position = 2)]
    pub port: String<6>,
}

/// The `STATE:` line follows the `OK` as a URC.
#[derive(Clone, AtatCmd)]
#[at_cmd("+CIPSTATUS", NoResponse)]
pub struct GetConnectionStatus;

/// Answered by the `>` data prompt.
#[derive(Clone, AtatCmd)]
#[at_cmd("+CIPSEND", NoResponse, timeout_ms = 5000)]
pub struct PrepareSend {
    #[at_arg(position = 0)]
    pub length: u16,
}

#[derive(Clone, Debug, AtatResp)]
pub struct ConnectionState {
    #[at_arg(position = 0)]
    pub state: String<32>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.state.ends_with("CONNECT OK")
    }
}

#[derive(Clone, Debug, AtatUrc)]
pub enum Urc {
    #[at_urc("RDY")]
    Ready,
    #[at_urc("+CFUN")]
    Functionality,
    #[at_urc("+CPIN")]
    SimStatus,
    #[at_urc("Call Ready")]
    CallReady,
    #[at_urc("SMS Ready")]
    SmsReady,
    #[at_urc("CONNECT OK")]
    ConnectOk,
    #[at_urc("CONNECT FAIL")]
    ConnectFail,
    #[at_urc("ALREADY CONNECT")]
    AlreadyConnect,
    #[at_urc("SEND OK")]
    SendOk,
    #[at_urc("SEND FAIL")]
    SendFail,
    #[at_urc("CLOSE OK")]
    CloseOk,
    #[at_urc("SHUT OK")]
    ShutOk,
    #[at_urc("CLOSED")]
    Closed,
    #[at_urc("+PDP")]
    PdpDeactivated,
    /// Only consumed so it never lands inside a command response; the
    /// receive path polls `AT+CIPRXGET=4` instead.
    #[at_urc("+CIPRXGET: 1")]
    DataAvailable,
    #[at_urc("STATE")]
    ConnectionState(ConnectionState),
}

/// `ATI`
#[derive(Clone)]
pub struct GetIdentification;

#[derive(Clone, Debug)]
pub struct Identification {
    pub ident: String<64>,
}

impl atat::AtatResp for Identification {}

impl atat::AtatCmd for GetIdentification {
    type Response = Identification;

    const MAX_LEN: usize = 5;

    fn write(&self, buf: &mut [u8]) -> usize {
        write_bytes(buf, b"ATI\r\n")
    }

    fn parse(&self, resp: Result<&[u8], InternalError>) -> Result<Identification, atat::Error> {
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => return Err(e.into()),
        };
        let mut lines = lines(resp);
        let line = lines
            .clone()
            .find(|line| line.contains("SIM"))
            .or_else(|| lines.next())
            .ok_or(atat::Error::Parse)?;

        let mut ident = String::new();
        ident.push_str(line).map_err(|_| atat::Error::Parse)?;
        Ok(Identification { ident })
    }
}

/// `AT+GSN`
#[derive(Clone)]
pub struct GetImei;

#[derive(Clone, Debug)]
pub struct Imei {
    pub imei: String<16>,
}

impl atat::AtatResp for Imei {}

impl atat::AtatCmd for GetImei {
    type Response = Imei;

    const MAX_LEN: usize = 8;

    fn write(&self, buf: &mut [u8]) -> usize {
        write_bytes(buf, b"AT+GSN\r\n")
    }

    fn parse(&self, resp: Result<&[u8], InternalError>) -> Result<Imei, atat::Error> {
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => return Err(e.into()),
        };
        let line = lines(resp)
            .find(|line| line.len() == 15 && line.bytes().all(|b| b.is_ascii_digit()))
            .ok_or(atat::Error::Parse)?;

        let mut imei = String::new();
        imei.push_str(line).map_err(|_| atat::Error::Parse)?;
        Ok(Imei { imei })
    }
}

/// `AT+CIPRXGET=3,<length>`: read received bytes, hex encoded so binary
/// payloads stay line-safe.
#[derive(Clone)]
pub struct ReadData {
    pub length: u16,
}

#[derive(Clone, Debug)]
pub struct ReceivedData {
    pub data: Vec<u8, MAX_READ_CHUNK>,
}

impl atat::AtatResp for ReceivedData {}

impl atat::AtatCmd for ReadData {
    type Response = ReceivedData;

    const MAX_LEN: usize = 24;
    const MAX_TIMEOUT_MS: u32 = 5000;

    fn write(&self, buf: &mut [u8]) -> usize {
        let mut cmd: String<24> = String::new();
        // "AT+CIPRXGET=3,65535\r\n" always fits
        let _ = write!(cmd, "AT+CIPRXGET=3,{}\r\n", self.length);
        write_bytes(buf, cmd.as_bytes())
    }

    fn parse(&self, resp: Result<&[u8], InternalError>) -> Result<ReceivedData, atat::Error> {
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => return Err(e.into()),
        };
        let mut lines = lines(resp);
        let header = lines
            .next()
            .and_then(|line| line.strip_prefix("+CIPRXGET: 3,"))
            .ok_or(atat::Error::Parse)?;
        let length: usize = header
            .split(',')
            .next()
            .and_then(|field| field.trim().parse().ok())
            .ok_or(atat::Error::Parse)?;
        if length > MAX_READ_CHUNK || length > usize::from(self.length) {
            return Err(atat::Error::Parse);
        }

        let mut data = Vec::new();
        if length > 0 {
            let hex = lines.next().ok_or(atat::Error::Parse)?.as_bytes();
            if hex.len() != length * 2 {
                return Err(atat::Error::Parse);
            }
            for pair in hex.chunks(2) {
                let byte = (hex_digit(pair[0])? << 4) | hex_digit(pair[1])?;
                // length <= MAX_READ_CHUNK
                let _ = data.push(byte);
            }
        }
        Ok(ReceivedData { data })
    }
}

/// Payload written after the `>` prompt. `SEND OK` arrives as a URC.
#[derive(Clone)]
pub struct SendData<'a> {
    pub data: &'a [u8],
}

impl atat::AtatCmd for SendData<'_> {
    type Response = NoResponse;

    const MAX_LEN: usize = MAX_SEND_CHUNK;
    const EXPECTS_RESPONSE_CODE: bool = false;

    fn write(&self, buf: &mut [u8]) -> usize {
        write_bytes(buf, self.data)
    }

    fn parse(&self, _resp: Result<&[u8], InternalError>) -> Result<NoResponse, atat::Error> {
        Ok(NoResponse)
    }
}

macro_rules! unacknowledged_command {
    ($(#[$meta:meta])* $name:ident, $bytes:expr) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name;

        impl atat::AtatCmd for $name {
            type Response = NoResponse;

            const MAX_LEN: usize = $bytes.len();
            const EXPECTS_RESPONSE_CODE: bool = false;

            fn write(&self, buf: &mut [u8]) -> usize {
                write_bytes(buf, $bytes)
            }

            fn parse(&self, _resp: Result<&[u8], InternalError>) -> Result<NoResponse, atat::Error> {
                Ok(NoResponse)
            }
        }
    };
}

unacknowledged_command!(
    /// Deactivate the GPRS PDP context. Answered by `SHUT OK`.
    ShutIp,
    b"AT+CIPSHUT\r\n"
);

unacknowledged_command!(
    /// Answered by `CLOSE OK`.
    CloseConnection,
    b"AT+CIPCLOSE\r\n"
);

fn write_bytes(buf: &mut [u8], bytes: &[u8]) -> usize {
    let len = bytes.len().min(buf.len());
    buf[..len].copy_from_slice(&bytes[..len]);
    len
}

fn lines(resp: &[u8]) -> impl Iterator<Item = &str> + Clone {
    core::str::from_utf8(resp)
        .unwrap_or("")
        .split("\r\n")
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

fn hex_digit(c: u8) -> Result<u8, atat::Error> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(atat::Error::Parse),
    }
}
