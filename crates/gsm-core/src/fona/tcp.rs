//! Single TCP connection over the modem's internal IP stack.
//!
//! Received data is pulled with `AT+CIPRXGET` (manual receive mode) so the
//! payload never interleaves with command responses on the serial line. Each
//! pull fetches up to [`MAX_READ_CHUNK`] bytes into the driver's receive
//! buffer, and reads are served from there first.

use core::fmt::Write as _;

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_io_async::{ErrorKind, ErrorType, Read, Write};
use heapless::String;
use log::{debug, info};

use atat::asynch::AtatClient;

use super::command::*;
use super::{text, wait_for_urc, Error, Fona};

/// Largest payload handed to a single `AT+CIPSEND`
pub const MAX_SEND_CHUNK: usize = 1024;
/// Largest payload requested from a single `AT+CIPRXGET=3`
pub const MAX_READ_CHUNK: usize = 256;
/// Pause between polls for received data
pub const READ_POLL_INTERVAL_MS: u32 = 100;
/// Polls before a read gives up (about ten seconds)
pub const READ_POLL_ATTEMPTS: u16 = 100;
/// How long the modem may take to report `CONNECT OK`
pub const CONNECT_TIMEOUT_MS: u32 = 75_000;
/// How long the modem may take to report `SEND OK`
pub const SEND_TIMEOUT_MS: u32 = 30_000;
/// How long `AT+CIPSTATUS` and `AT+CIPCLOSE` may take to report back
pub const STATUS_TIMEOUT_MS: u32 = 2_000;

impl<'a, W, P, D> Fona<'a, W, P, D>
where
    W: Write,
    P: OutputPin,
    D: DelayNs,
{
    pub async fn tcp_connect(&mut self, host: &str, port: u16) -> Result<(), Error> {
        self.clear_received();
        self.shut_ip().await?;
        self.client.send(&SetMultiConnection { mode: 0 }).await?;
        self.client
            .send(&SetReceiveMode {
                mode: RX_MODE_MANUAL,
            })
            .await?;

        info!("Opening TCP connection to {}:{}", host, port);
        let mut port_text: String<6> = String::new();
        write!(port_text, "{}", port).map_err(|_| Error::SettingsTooLong)?;
        let cmd = StartConnection {
            mode: text("TCP")?,
            host: text(host)?,
            port: port_text,
        };

        let mut urcs = self.subscribe()?;
        self.client.send(&cmd).await?;
        wait_for_urc(&mut self.delay, &mut urcs, CONNECT_TIMEOUT_MS, |urc| match urc {
            Urc::ConnectOk | Urc::AlreadyConnect => Some(Ok(())),
            Urc::ConnectFail => Some(Err(Error::Rejected)),
            _ => None,
        })
        .await?
    }

    pub async fn tcp_send(&mut self, data: &[u8]) -> Result<(), Error> {
        for chunk in data.chunks(MAX_SEND_CHUNK) {
            let mut urcs = self.subscribe()?;
            // chunk.len() <= MAX_SEND_CHUNK
            self.client
                .send(&PrepareSend {
                    length: chunk.len() as u16,
                })
                .await?;
            self.client.send(&SendData { data: chunk }).await?;
            wait_for_urc(&mut self.delay, &mut urcs, SEND_TIMEOUT_MS, |urc| match urc {
                Urc::SendOk => Some(Ok(())),
                Urc::SendFail => Some(Err(Error::Rejected)),
                _ => None,
            })
            .await??;
            debug!("TCP sent {} bytes", chunk.len());
        }
        Ok(())
    }

    /// Bytes received by the modem and not pulled yet.
    pub async fn tcp_available(&mut self) -> Result<usize, Error> {
        let pending = self
            .client
            .send(&GetPendingData {
                mode: RX_MODE_PENDING,
            })
            .await?;
        Ok(usize::from(pending.length))
    }

    /// Read up to `buf.len()` received bytes; returns how many were read.
    /// Pulls a fresh chunk from the modem only once the buffer is drained.
    pub async fn tcp_read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.buffered() == 0 {
            let received = self
                .client
                .send(&ReadData {
                    length: MAX_READ_CHUNK as u16,
                })
                .await?;
            self.rx = received.data;
            self.rx_pos = 0;
        }
        Ok(self.take_buffered(buf))
    }

    pub async fn tcp_connected(&mut self) -> Result<bool, Error> {
        let mut urcs = self.subscribe()?;
        self.client.send(&GetConnectionStatus).await?;
        wait_for_urc(&mut self.delay, &mut urcs, STATUS_TIMEOUT_MS, |urc| match urc {
            Urc::ConnectionState(state) => Some(state.is_connected()),
            _ => None,
        })
        .await
    }

    pub async fn tcp_close(&mut self) -> Result<(), Error> {
        self.clear_received();
        let mut urcs = self.subscribe()?;
        self.client.send(&CloseConnection).await?;
        wait_for_urc(&mut self.delay, &mut urcs, STATUS_TIMEOUT_MS, |urc| {
            matches!(urc, Urc::CloseOk).then_some(())
        })
        .await
    }

    /// Borrow the open connection as a byte stream.
    pub fn tcp_stream(&mut self) -> TcpStream<'_, 'a, W, P, D> {
        TcpStream { fona: self }
    }

    fn buffered(&self) -> usize {
        self.rx.len() - self.rx_pos
    }

    fn take_buffered(&mut self, buf: &mut [u8]) -> usize {
        let pending = &self.rx[self.rx_pos..];
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        self.rx_pos += n;
        n
    }

    fn clear_received(&mut self) {
        self.rx.clear();
        self.rx_pos = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpError(pub ErrorKind);

impl embedded_io_async::Error for TcpError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

impl From<Error> for TcpError {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::Timeout => ErrorKind::TimedOut,
            Error::Rejected => ErrorKind::NotConnected,
            Error::InvalidResponse => ErrorKind::InvalidData,
            _ => ErrorKind::Other,
        };
        TcpError(kind)
    }
}

/// `embedded-io-async` view of the modem's TCP connection.
pub struct TcpStream<'f, 'a, W: Write, P, D> {
    fona: &'f mut Fona<'a, W, P, D>,
}

impl<W: Write, P, D> ErrorType for TcpStream<'_, '_, W, P, D> {
    type Error = TcpError;
}

impl<W, P, D> Read for TcpStream<'_, '_, W, P, D>
where
    W: Write,
    P: OutputPin,
    D: DelayNs,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TcpError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.fona.buffered() > 0 {
            return Ok(self.fona.take_buffered(buf));
        }

        for _ in 0..READ_POLL_ATTEMPTS {
            if self.fona.tcp_available().await? > 0 {
                let n = self.fona.tcp_read(buf).await?;
                if n > 0 {
                    return Ok(n);
                }
            }
            self.fona.delay.delay_ms(READ_POLL_INTERVAL_MS).await;
        }

        Err(TcpError(ErrorKind::TimedOut))
    }
}

impl<W, P, D> Write for TcpStream<'_, '_, W, P, D>
where
    W: Write,
    P: OutputPin,
    D: DelayNs,
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TcpError> {
        self.fona.tcp_send(buf).await?;
        Ok(buf.len())
    }
}
