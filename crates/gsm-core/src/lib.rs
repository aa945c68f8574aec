//! Hardware-independent core of the GSM MQTT bridge.
//!
//! Everything that talks to the SIM800 modem, speaks MQTT over the modem's
//! TCP stack, or decides when to retry a broker connection lives here. The
//! crate only depends on the `embedded-io-async` and `embedded-hal` traits
//! and on `atat` for the AT command layer, so it builds for the ESP32
//! firmware and for host-side tests alike.

#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

pub mod bridge;
pub mod fona;
pub mod mqtt;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{Bridge, BridgeError, Settings};
pub use supervisor::{Connection, ConnectionSupervisor, SupervisorError};
