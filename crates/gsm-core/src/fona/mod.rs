//! SIM800-family ("FONA") modem driver.
//!
//! Commands go out through an `atat` client. Responses and unsolicited
//! result codes come back through an [`Ingress`] that the caller feeds from
//! the modem's serial receive half.

use atat::asynch::{AtatClient, Client};
use atat::{DefaultDigester, Ingress, ResponseSlot, UrcChannel, UrcSubscription};
use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_io_async::Write;
use heapless::{String, Vec};
use log::{debug, error, info};

use command::*;

pub mod command;
pub mod tcp;

pub use command::Urc;
pub use tcp::{TcpError, TcpStream, MAX_READ_CHUNK, MAX_SEND_CHUNK};

/// Pause between `AT` attempts while waiting for the modem to wake up
pub const WAKE_INTERVAL_MS: u32 = 500;
/// `AT` attempts made before giving up on the modem (about seven seconds)
pub const DEFAULT_WAKE_ATTEMPTS: u8 = 14;
/// Pause between network registration polls
pub const NETWORK_POLL_INTERVAL_MS: u32 = 500;
/// Settle time around GPRS reconfiguration
pub const GPRS_SETTLE_MS: u32 = 2000;
/// Pause between looks at the URC queue
pub const URC_POLL_INTERVAL_MS: u32 = 100;
/// How long `AT+CIPSHUT` may take to answer `SHUT OK`
pub const SHUT_TIMEOUT_MS: u32 = 30_000;

pub const INGRESS_BUF_SIZE: usize = 1024;
/// Large enough for a full `AT+CIPSEND` chunk
pub const CLIENT_BUF_SIZE: usize = MAX_SEND_CHUNK + 64;
pub const URC_CAPACITY: usize = 16;
pub const URC_SUBSCRIBERS: usize = 2;

const CREDENTIAL_MAX: usize = 64;

pub type ModemUrcs = UrcChannel<Urc, URC_CAPACITY, URC_SUBSCRIBERS>;
pub type ModemIngress<'a> =
    Ingress<'a, DefaultDigester<Urc>, Urc, INGRESS_BUF_SIZE, URC_CAPACITY, URC_SUBSCRIBERS>;
pub type ModemClient<'a, W> = Client<'a, W, INGRESS_BUF_SIZE>;

type Subscription<'a> = UrcSubscription<'a, Urc, URC_CAPACITY, URC_SUBSCRIBERS>;

/// Ingress that digests the modem's output into `res_slot` and `urcs`.
pub fn ingress<'a>(
    buf: &'a mut [u8],
    res_slot: &'a ResponseSlot<INGRESS_BUF_SIZE>,
    urcs: &'a ModemUrcs,
) -> ModemIngress<'a> {
    Ingress::new(DefaultDigester::<Urc>::default(), buf, res_slot, urcs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The modem never answered `AT`
    NotFound,
    /// Driving the reset pin failed
    ResetPin,
    /// Bringing GPRS up failed
    GprsFailed,
    /// An APN, credential or host name is longer than the driver accepts
    SettingsTooLong,
    /// A reply could not be parsed
    InvalidResponse,
    /// No answer in time
    Timeout,
    /// The modem answered with an error
    Rejected,
    /// Every URC subscriber slot is taken
    UrcChannel,
}

impl From<atat::Error> for Error {
    fn from(e: atat::Error) -> Self {
        match e {
            atat::Error::Timeout => Error::Timeout,
            atat::Error::Parse | atat::Error::InvalidResponse => Error::InvalidResponse,
            other => {
                debug!("AT command failed: {:?}", other);
                Error::Rejected
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemType {
    Sim800L,
    Sim800H,
    Sim808V1,
    Sim808V2,
    Sim5320A,
    Sim5320E,
    Sim7000,
    Unknown,
}

impl ModemType {
    /// Classify the modem from its `ATI` identification line.
    pub fn from_ident(ident: &str) -> Self {
        if ident.contains("SIM808 R14") {
            ModemType::Sim808V2
        } else if ident.contains("SIM808 R13") {
            ModemType::Sim808V1
        } else if ident.contains("SIM800H") {
            ModemType::Sim800H
        } else if ident.contains("SIM800") {
            ModemType::Sim800L
        } else if ident.contains("SIM5320A") {
            ModemType::Sim5320A
        } else if ident.contains("SIM5320E") {
            ModemType::Sim5320E
        } else if ident.contains("SIM7000") {
            ModemType::Sim7000
        } else {
            ModemType::Unknown
        }
    }
}

/// Registration state reported by `AT+CREG?`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    NotRegistered,
    RegisteredHome,
    Searching,
    Denied,
    Unknown,
    RegisteredRoaming,
}

impl NetworkStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => NetworkStatus::NotRegistered,
            1 => NetworkStatus::RegisteredHome,
            2 => NetworkStatus::Searching,
            3 => NetworkStatus::Denied,
            5 => NetworkStatus::RegisteredRoaming,
            _ => NetworkStatus::Unknown,
        }
    }
}

/// Received signal strength as reported by `AT+CSQ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalQuality(pub u8);

impl SignalQuality {
    /// Signal strength in dBm, `None` when the modem does not know (99).
    pub fn dbm(&self) -> Option<i16> {
        match self.0 {
            0 => Some(-115),
            1 => Some(-111),
            31 => Some(-52),
            n @ 2..=30 => Some(-110 + (i16::from(n) - 2) * 2),
            _ => None,
        }
    }
}

#[derive(Default)]
struct GprsSettings {
    apn: String<CREDENTIAL_MAX>,
    username: String<CREDENTIAL_MAX>,
    password: String<CREDENTIAL_MAX>,
}

pub struct Fona<'a, W: Write, P, D> {
    client: ModemClient<'a, W>,
    urcs: &'a ModemUrcs,
    reset: P,
    delay: D,
    model: ModemType,
    gprs: GprsSettings,
    wake_attempts: u8,
    /// Received TCP bytes not handed out yet
    rx: Vec<u8, MAX_READ_CHUNK>,
    rx_pos: usize,
}

impl<'a, W, P, D> Fona<'a, W, P, D>
where
    W: Write,
    P: OutputPin,
    D: DelayNs,
{
    pub fn new(client: ModemClient<'a, W>, urcs: &'a ModemUrcs, reset: P, delay: D) -> Self {
        Self {
            client,
            urcs,
            reset,
            delay,
            model: ModemType::Unknown,
            gprs: GprsSettings::default(),
            wake_attempts: DEFAULT_WAKE_ATTEMPTS,
            rx: Vec::new(),
            rx_pos: 0,
        }
    }

    /// `AT` attempts `begin` makes before giving up. Also bounds how many
    /// network status queries in a row may fail.
    pub fn with_wake_attempts(mut self, attempts: u8) -> Self {
        self.wake_attempts = attempts;
        self
    }

    pub fn model(&self) -> ModemType {
        self.model
    }

    /// Reset the modem and wait for it to answer, then turn echo off and
    /// identify the model.
    pub async fn begin(&mut self) -> Result<ModemType, Error> {
        self.reset.set_high().map_err(|_| Error::ResetPin)?;
        self.delay.delay_ms(10).await;
        self.reset.set_low().map_err(|_| Error::ResetPin)?;
        self.delay.delay_ms(100).await;
        self.reset.set_high().map_err(|_| Error::ResetPin)?;

        info!("Attempting to open comm with ATs");
        let mut answered = false;
        for attempt in 1..=self.wake_attempts {
            match self.client.send(&At).await {
                Ok(_) => {
                    answered = true;
                    break;
                }
                Err(e) => debug!("No answer to AT attempt {}: {:?}", attempt, e),
            }
            self.delay.delay_ms(WAKE_INTERVAL_MS).await;
        }

        if !answered {
            error!("Couldn't find FONA");
            return Err(Error::NotFound);
        }

        self.client.send(&DisableEcho).await?;
        self.delay.delay_ms(100).await;

        let ident = self.client.send(&GetIdentification).await?.ident;
        self.model = ModemType::from_ident(&ident);
        info!("FONA is OK ({:?}: {})", self.model, ident);

        Ok(self.model)
    }

    pub async fn network_status(&mut self) -> Result<NetworkStatus, Error> {
        let registration = self.client.send(&GetNetworkRegistration).await?;
        Ok(NetworkStatus::from_code(registration.stat))
    }

    /// Poll until the modem is registered on its home network. Gives up once
    /// as many queries in a row have failed as `begin` makes `AT` attempts.
    pub async fn wait_for_network(&mut self) -> Result<(), Error> {
        info!("Checking for network...");
        let mut failures = 0;
        loop {
            match self.network_status().await {
                Ok(NetworkStatus::RegisteredHome) => break,
                Ok(status) => {
                    failures = 0;
                    debug!("Network status: {:?}", status);
                }
                Err(e) => {
                    failures += 1;
                    debug!("Network status query failed: {:?}", e);
                    if failures >= self.wake_attempts {
                        error!("Modem stopped answering network queries");
                        return Err(e);
                    }
                }
            }
            self.delay.delay_ms(NETWORK_POLL_INTERVAL_MS).await;
        }
        info!("Registered (home)");
        Ok(())
    }

    pub fn set_gprs_network_settings(
        &mut self,
        apn: &str,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        self.gprs = GprsSettings {
            apn: text(apn)?,
            username: text(username)?,
            password: text(password)?,
        };
        Ok(())
    }

    pub async fn enable_gprs(&mut self, enable: bool) -> Result<(), Error> {
        if enable {
            self.gprs_up().await
        } else {
            self.gprs_down().await
        }
    }

    async fn gprs_up(&mut self) -> Result<(), Error> {
        // drop any open IP session first
        self.shut_ip().await?;
        self.client.send(&SetGprsAttach { state: 1 }).await?;
        self.client.send(&bearer_parameter("CONTYPE", "GPRS")?).await?;

        if !self.gprs.apn.is_empty() {
            let apn = self.gprs.apn.clone();
            self.client.send(&bearer_parameter("APN", &apn)?).await?;

            if self.gprs.username.is_empty() {
                self.client.send(&SetApn { apn }).await?;
            } else {
                let cmd = SetApnWithCredentials {
                    apn,
                    username: self.gprs.username.clone(),
                    password: self.gprs.password.clone(),
                };
                self.client.send(&cmd).await?;
            }

            if !self.gprs.username.is_empty() {
                let cmd = bearer_parameter("USER", &self.gprs.username)?;
                self.client.send(&cmd).await?;
            }
            if !self.gprs.password.is_empty() {
                let cmd = bearer_parameter("PWD", &self.gprs.password)?;
                self.client.send(&cmd).await?;
            }
        }

        // open the bearer, then bring the wireless connection up
        self.client.send(&BearerControl { cmd_type: 1, cid: 1 }).await?;
        self.client.send(&BringUpWireless).await?;
        Ok(())
    }

    async fn gprs_down(&mut self) -> Result<(), Error> {
        self.shut_ip().await?;
        // fails when the bearer is already closed
        if let Err(e) = self.client.send(&BearerControl { cmd_type: 0, cid: 1 }).await {
            debug!("Closing bearer: {:?}", e);
        }
        self.client.send(&SetGprsAttach { state: 0 }).await?;
        Ok(())
    }

    /// Configure the APN and cycle GPRS off and on again.
    pub async fn initialize_gprs(
        &mut self,
        apn: &str,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        self.set_gprs_network_settings(apn, username, password)?;
        self.delay.delay_ms(GPRS_SETTLE_MS).await;

        info!("Disabling GPRS");
        if let Err(e) = self.enable_gprs(false).await {
            debug!("Disabling GPRS: {:?}", e);
        }
        self.delay.delay_ms(GPRS_SETTLE_MS).await;

        info!("Enabling GPRS");
        if let Err(e) = self.enable_gprs(true).await {
            error!("Failed to turn GPRS on: {:?}", e);
            return Err(Error::GprsFailed);
        }
        info!("Connected to Cellular!");
        Ok(())
    }

    pub async fn rssi(&mut self) -> Result<SignalQuality, Error> {
        let report = self.client.send(&GetSignalQuality).await?;
        Ok(SignalQuality(report.rssi))
    }

    /// Supply voltage in millivolts.
    pub async fn battery_mv(&mut self) -> Result<u16, Error> {
        Ok(self.client.send(&GetBatteryCharge).await?.millivolts)
    }

    pub async fn imei(&mut self) -> Result<String<16>, Error> {
        Ok(self.client.send(&GetImei).await?.imei)
    }

    async fn shut_ip(&mut self) -> Result<(), Error> {
        let mut urcs = self.subscribe()?;
        self.client.send(&ShutIp).await?;
        wait_for_urc(&mut self.delay, &mut urcs, SHUT_TIMEOUT_MS, |urc| {
            matches!(urc, Urc::ShutOk).then_some(())
        })
        .await
    }

    fn subscribe(&self) -> Result<Subscription<'a>, Error> {
        self.urcs.subscribe().map_err(|_| Error::UrcChannel)
    }
}

/// Wait up to `timeout_ms` for the first URC that `pick` maps to a value.
async fn wait_for_urc<D: DelayNs, T>(
    delay: &mut D,
    urcs: &mut Subscription<'_>,
    timeout_ms: u32,
    mut pick: impl FnMut(&Urc) -> Option<T>,
) -> Result<T, Error> {
    let mut waited = 0;
    loop {
        while let Some(urc) = urcs.try_next_message_pure() {
            match pick(&urc) {
                Some(value) => return Ok(value),
                None => debug!("Ignoring URC {:?}", urc),
            }
        }
        if waited >= timeout_ms {
            return Err(Error::Timeout);
        }
        delay.delay_ms(URC_POLL_INTERVAL_MS).await;
        waited += URC_POLL_INTERVAL_MS;
    }
}

fn text<const N: usize>(value: &str) -> Result<String<N>, Error> {
    let mut s = String::new();
    s.push_str(value).map_err(|_| Error::SettingsTooLong)?;
    Ok(s)
}

fn bearer_parameter(tag: &str, value: &str) -> Result<SetBearerParameter, Error> {
    Ok(SetBearerParameter {
        cmd_type: 3,
        cid: 1,
        tag: text(tag)?,
        value: text(value)?,
    })
}
