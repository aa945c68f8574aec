//! Scripted stand-ins for the modem, serial port, reset pin and delay
//! provider.

use core::cell::RefCell;
use core::convert::Infallible;
use core::future::Future;
use std::collections::VecDeque;
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use atat::asynch::Client;
use atat::{AtatIngress, ResponseSlot, UrcChannel};
use embassy_futures::block_on;
use embassy_futures::select::{select, Either};
use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_io_async::{ErrorType, Read, Write};

use crate::fona::{self, Fona, ModemIngress, ModemUrcs, CLIENT_BUF_SIZE, INGRESS_BUF_SIZE};

pub type TestFona<'a> = Fona<'a, ScriptedModem, RecordingPin, InstantDelay>;

#[derive(Default)]
struct Line {
    rx: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
}

/// Modem that answers every write with the next queued reply. Clones share
/// the same line, so one clone can sit in the `atat` client while another
/// feeds the ingress.
#[derive(Clone, Default)]
pub struct ScriptedModem {
    line: Rc<RefCell<Line>>,
}

impl ScriptedModem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to the next write. An empty reply leaves it
    /// unanswered.
    pub fn reply(&self, bytes: impl AsRef<[u8]>) -> &Self {
        self.line
            .borrow_mut()
            .replies
            .push_back(bytes.as_ref().to_vec());
        self
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.line.borrow().writes.clone()
    }

    /// Every write, terminator stripped.
    pub fn commands(&self) -> Vec<String> {
        self.writes()
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end_matches("\r\n").to_owned())
            .collect()
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.writes().concat()).into_owned()
    }
}

impl ErrorType for ScriptedModem {
    type Error = Infallible;
}

impl Read for ScriptedModem {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        loop {
            {
                let mut line = self.line.borrow_mut();
                let n = buf.len().min(line.rx.len());
                if n > 0 {
                    for (slot, byte) in buf.iter_mut().zip(line.rx.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
            }
            embassy_futures::yield_now().await;
        }
    }
}

impl Write for ScriptedModem {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut line = self.line.borrow_mut();
        line.writes.push(buf.to_vec());
        if let Some(reply) = line.replies.pop_front() {
            line.rx.extend(reply);
        }
        Ok(buf.len())
    }
}

/// Response slot, URC channel and buffers an `atat` client and ingress
/// share.
pub struct Wiring {
    res_slot: ResponseSlot<INGRESS_BUF_SIZE>,
    urcs: ModemUrcs,
    ingress_buf: [u8; INGRESS_BUF_SIZE],
    client_buf: [u8; CLIENT_BUF_SIZE],
}

impl Wiring {
    pub fn new() -> Self {
        Self {
            res_slot: ResponseSlot::new(),
            urcs: UrcChannel::new(),
            ingress_buf: [0; INGRESS_BUF_SIZE],
            client_buf: [0; CLIENT_BUF_SIZE],
        }
    }

    /// A driver talking to `modem`, and the ingress digesting its replies.
    pub fn fona(&mut self, modem: &ScriptedModem) -> (ModemIngress<'_>, TestFona<'_>) {
        let Wiring {
            res_slot,
            urcs,
            ingress_buf,
            client_buf,
        } = self;
        let res_slot = &*res_slot;
        let urcs = &*urcs;

        let ingress = fona::ingress(ingress_buf, res_slot, urcs);
        let client = Client::new(modem.clone(), res_slot, client_buf, atat::Config::default());
        let fona = Fona::new(client, urcs, RecordingPin::default(), InstantDelay::default());
        (ingress, fona)
    }
}

/// Run `test` to completion while `ingress` digests the modem's replies.
pub fn run<F: Future>(ingress: &mut ModemIngress<'_>, modem: &ScriptedModem, test: F) -> F::Output {
    block_on(async {
        match select(test, ingress.read_from(modem.clone())).await {
            Either::First(output) => output,
            Either::Second(never) => never,
        }
    })
}

/// Serial port that replays canned bytes and records what was sent.
pub struct ScriptedSerial {
    rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    /// Upper bound on bytes handed out per `read`, to exercise split reads
    pub max_read: usize,
}

impl ScriptedSerial {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: Vec::new(),
            max_read: usize::MAX,
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }
}

impl ErrorType for ScriptedSerial {
    type Error = Infallible;
}

impl Read for ScriptedSerial {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = buf.len().min(self.rx.len()).min(self.max_read);
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for ScriptedSerial {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Output pin that remembers every level it was driven to.
#[derive(Default)]
pub struct RecordingPin {
    pub levels: Vec<bool>,
}

impl PinErrorType for RecordingPin {
    type Error = Infallible;
}

impl OutputPin for RecordingPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.levels.push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.levels.push(true);
        Ok(())
    }
}

/// Delay that records the requested waits and only yields once, so other
/// futures (the ingress) get to run.
#[derive(Default)]
pub struct InstantDelay {
    pub waits_ms: Vec<u32>,
}

impl InstantDelay {
    pub fn total_ms(&self) -> u64 {
        self.waits_ms.iter().map(|&ms| u64::from(ms)).sum()
    }
}

impl DelayNs for InstantDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.waits_ms.push(ns / 1_000_000);
        embassy_futures::yield_now().await;
    }

    async fn delay_us(&mut self, us: u32) {
        self.waits_ms.push(us / 1_000);
        embassy_futures::yield_now().await;
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.waits_ms.push(ms);
        embassy_futures::yield_now().await;
    }
}
