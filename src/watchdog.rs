use esp_hal::{
    rtc_cntl::{Rtc, RwdtStage, RwdtStageAction},
    time::Duration,
};

use crate::constants::WATCHDOG_TIMEOUT_MS;

/// Last-resort recovery through the RTC watchdog.
pub struct Watchdog {
    rtc: Rtc<'static>,
}

impl Watchdog {
    pub fn new(rtc: Rtc<'static>) -> Self {
        Self { rtc }
    }

    /// Arm the watchdog and never feed it; the chip resets once it fires.
    pub fn reset(&mut self) -> ! {
        log::warn!("Resetting in {} ms", WATCHDOG_TIMEOUT_MS);

        let rwdt = &mut self.rtc.rwdt;
        rwdt.set_timeout(
            RwdtStage::Stage0,
            Duration::from_millis(WATCHDOG_TIMEOUT_MS),
        );
        rwdt.set_stage_action(RwdtStage::Stage0, RwdtStageAction::ResetSystem);
        rwdt.enable();

        loop {
            core::hint::spin_loop();
        }
    }
}

/// Stop here for good, leaving the watchdog disabled.
pub fn hang() -> ! {
    log::error!("Halted");
    loop {
        core::hint::spin_loop();
    }
}
