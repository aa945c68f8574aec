//! Keeps the broker session up: connect, and on failure log, disconnect,
//! wait and try again, optionally giving up after too many failures in a
//! row.

use core::fmt;

use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info};

/// Default pause between two connection attempts
pub const DEFAULT_RETRY_DELAY_MS: u32 = 5000;

/// Something that can be connected, checked and torn down again.
pub trait Connection {
    type Error: fmt::Display + fmt::Debug;

    async fn is_connected(&mut self) -> bool;

    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Tear down whatever a failed attempt left behind. Must not fail.
    async fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorError {
    /// `max` consecutive failures were already counted when another
    /// attempt failed. The device should be reset.
    FailureLimit { max: u8 },
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::FailureLimit { max } => {
                write!(f, "Giving up after {} failed connection attempts", max)
            }
        }
    }
}

pub struct ConnectionSupervisor {
    max_failures: Option<u8>,
    retry_delay_ms: u32,
    failures: u8,
}

impl ConnectionSupervisor {
    /// `max_failures` of `None` retries forever.
    pub fn new(max_failures: Option<u8>, retry_delay_ms: u32) -> Self {
        Self {
            max_failures,
            retry_delay_ms,
            failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u8 {
        self.failures
    }

    /// Return once `conn` is connected.
    ///
    /// Fails only when a cap is set and an attempt fails while the failure
    /// counter already sits at the cap, so a cap of 120 gives up on the
    /// 121st failure in a row. A successful connect clears the counter.
    pub async fn ensure_connected<C, D>(
        &mut self,
        conn: &mut C,
        delay: &mut D,
    ) -> Result<(), SupervisorError>
    where
        C: Connection,
        D: DelayNs,
    {
        if conn.is_connected().await {
            debug!("MQTT Already Connected!");
            return Ok(());
        }

        info!("Connecting to MQTT... ");

        while let Err(e) = conn.connect().await {
            if let Some(max) = self.max_failures {
                if self.failures >= max {
                    error!("{} (failure limit of {} reached)", e, max);
                    return Err(SupervisorError::FailureLimit { max });
                }
            }
            self.failures = self.failures.saturating_add(1);

            error!("{}", e);
            conn.disconnect().await;

            debug!(
                "Retrying MQTT connection in {} seconds...",
                self.retry_delay_ms / 1000
            );
            delay.delay_ms(self.retry_delay_ms).await;
        }

        self.failures = 0;
        info!("MQTT Connected!");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InstantDelay;
    use embassy_futures::block_on;

    /// Fails the first `failures_left` connects, then succeeds.
    struct FlakyLink {
        connected: bool,
        failures_left: u32,
        connects: u32,
        disconnects: u32,
    }

    impl FlakyLink {
        fn failing(times: u32) -> Self {
            Self {
                connected: false,
                failures_left: times,
                connects: 0,
                disconnects: 0,
            }
        }
    }

    impl Connection for FlakyLink {
        type Error = &'static str;

        async fn is_connected(&mut self) -> bool {
            self.connected
        }

        async fn connect(&mut self) -> Result<(), Self::Error> {
            self.connects += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err("The MQTT service is unavailable");
            }
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.disconnects += 1;
            self.connected = false;
        }
    }

    #[test]
    fn already_connected_does_nothing() {
        let mut supervisor = ConnectionSupervisor::new(Some(3), DEFAULT_RETRY_DELAY_MS);
        let mut link = FlakyLink::failing(0);
        link.connected = true;
        let mut delay = InstantDelay::default();

        block_on(supervisor.ensure_connected(&mut link, &mut delay)).unwrap();
        assert_eq!(link.connects, 0);
        assert!(delay.waits_ms.is_empty());
    }

    #[test]
    fn retries_until_connected_and_clears_counter() {
        let mut supervisor = ConnectionSupervisor::new(Some(120), DEFAULT_RETRY_DELAY_MS);
        let mut link = FlakyLink::failing(3);
        let mut delay = InstantDelay::default();

        block_on(supervisor.ensure_connected(&mut link, &mut delay)).unwrap();
        assert_eq!(link.connects, 4);
        assert_eq!(link.disconnects, 3);
        assert_eq!(delay.waits_ms, [5000, 5000, 5000]);
        assert_eq!(supervisor.consecutive_failures(), 0);
    }

    #[test]
    fn cap_is_checked_before_counting() {
        let mut supervisor = ConnectionSupervisor::new(Some(2), DEFAULT_RETRY_DELAY_MS);
        let mut link = FlakyLink::failing(u32::MAX);
        let mut delay = InstantDelay::default();

        assert_eq!(
            block_on(supervisor.ensure_connected(&mut link, &mut delay)),
            Err(SupervisorError::FailureLimit { max: 2 })
        );
        // two counted failures, the third gives up without waiting
        assert_eq!(link.connects, 3);
        assert_eq!(link.disconnects, 2);
        assert_eq!(delay.waits_ms.len(), 2);
        assert_eq!(supervisor.consecutive_failures(), 2);
    }

    #[test]
    fn zero_cap_gives_up_on_first_failure() {
        let mut supervisor = ConnectionSupervisor::new(Some(0), DEFAULT_RETRY_DELAY_MS);
        let mut link = FlakyLink::failing(1);
        let mut delay = InstantDelay::default();

        assert!(block_on(supervisor.ensure_connected(&mut link, &mut delay)).is_err());
        assert_eq!(link.disconnects, 0);
    }

    #[test]
    fn cap_of_120_gives_up_on_121st_failure() {
        let mut supervisor = ConnectionSupervisor::new(Some(120), 1000);
        let mut delay = InstantDelay::default();

        let mut link = FlakyLink::failing(119);
        block_on(supervisor.ensure_connected(&mut link, &mut delay)).unwrap();
        assert_eq!(supervisor.consecutive_failures(), 0);

        let mut link = FlakyLink::failing(121);
        assert!(block_on(supervisor.ensure_connected(&mut link, &mut delay)).is_err());
        assert_eq!(link.connects, 121);
    }

    #[test]
    fn uncapped_keeps_retrying() {
        let mut supervisor = ConnectionSupervisor::new(None, DEFAULT_RETRY_DELAY_MS);
        let mut link = FlakyLink::failing(300);
        let mut delay = InstantDelay::default();

        block_on(supervisor.ensure_connected(&mut link, &mut delay)).unwrap();
        assert_eq!(link.connects, 301);
        assert_eq!(delay.total_ms(), 300 * 5000);
    }
}
