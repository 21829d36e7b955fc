//! Device status latch and indicator mirroring.

use bit_field::BitField;

/// Bit positions within the one-byte status report.
const ERROR: usize = 0;
const FPGA_READY: usize = 1;
const ALERT: usize = 2;

/// One-byte summary of device health reported to the host.
///
/// Each bit has its own lifetime rule:
///
/// - ERROR (bit 0) is *read-clear*: taking a [snapshot](Self::snapshot)
///   reports it and clears it in the same operation. Stalling a
///   host-to-device transfer only surfaces as a USB timeout, so the latch
///   lets the host learn about a failed write much sooner by polling
///   status.
/// - FPGA_READY (bit 1) is a *live mirror* of the configuration channel's
///   readiness, not a record of past configurations.
/// - ALERT (bit 2) is *sticky*: it stays set across any number of status
///   reads until the host issues the dedicated acknowledgement.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusLatch {
    bits: u8,
}

impl StatusLatch {
    /// An empty latch: no error, FPGA not ready, no alert.
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Latch the ERROR bit. Cleared by the next [`snapshot`](Self::snapshot).
    pub fn raise_error(&mut self) {
        self.bits.set_bit(ERROR, true);
    }

    /// Latch the sticky ALERT bit.
    pub fn raise_alert(&mut self) {
        self.bits.set_bit(ALERT, true);
    }

    /// Clear the ALERT bit. Only the host's explicit alert-acknowledge
    /// command should reach this.
    pub fn acknowledge_alert(&mut self) {
        self.bits.set_bit(ALERT, false);
    }

    /// Track the configuration channel's current readiness.
    pub fn set_fpga_ready(&mut self, ready: bool) {
        self.bits.set_bit(FPGA_READY, ready);
    }

    /// Whether ERROR is currently latched.
    pub fn error(&self) -> bool {
        self.bits.get_bit(ERROR)
    }

    /// Whether the FPGA is currently configured and running.
    pub fn fpga_ready(&self) -> bool {
        self.bits.get_bit(FPGA_READY)
    }

    /// Whether an unacknowledged alert is pending.
    pub fn alert(&self) -> bool {
        self.bits.get_bit(ALERT)
    }

    /// Report the status byte and clear ERROR as a side effect.
    ///
    /// The returned byte includes ERROR as it stood before the clear.
    pub fn snapshot(&mut self) -> u8 {
        let report = self.bits;
        self.bits.set_bit(ERROR, false);
        report
    }
}

/// Indicator LEDs mirroring the status latch.
///
/// Pin-level toggling belongs to the board support code; the dispatcher
/// only pushes the derived on/off levels through this trait whenever the
/// latch changes.
pub trait Indicators {
    /// Drive the fault indicator. Lit while ERROR or ALERT is latched.
    fn set_fault(&mut self, on: bool);
    /// Drive the FPGA indicator. Lit while the FPGA is ready.
    fn set_fpga(&mut self, on: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ERROR reports once and is gone from the following snapshot.
    #[test]
    fn error_clears_on_read() {
        let mut latch = StatusLatch::new();
        latch.raise_error();
        assert_eq!(latch.snapshot(), 0b001);
        assert_eq!(latch.snapshot(), 0b000);
    }

    /// ALERT survives snapshots and only clears on acknowledgement.
    #[test]
    fn alert_is_sticky_across_reads() {
        let mut latch = StatusLatch::new();
        latch.raise_alert();
        assert_eq!(latch.snapshot(), 0b100);
        assert_eq!(latch.snapshot(), 0b100);
        latch.acknowledge_alert();
        assert_eq!(latch.snapshot(), 0b000);
    }

    /// Acknowledging an alert leaves a latched error untouched, and a
    /// status read leaves a pending alert untouched.
    #[test]
    fn error_and_alert_are_independent() {
        let mut latch = StatusLatch::new();
        latch.raise_error();
        latch.raise_alert();
        latch.acknowledge_alert();
        assert!(latch.error());
        assert_eq!(latch.snapshot(), 0b001);

        latch.raise_error();
        latch.raise_alert();
        assert_eq!(latch.snapshot(), 0b101);
        assert!(latch.alert());
        assert!(!latch.error());
    }

    /// FPGA_READY tracks the level it is given and is not affected by
    /// reads.
    #[test]
    fn fpga_ready_is_a_live_mirror() {
        let mut latch = StatusLatch::new();
        latch.set_fpga_ready(true);
        assert_eq!(latch.snapshot(), 0b010);
        assert_eq!(latch.snapshot(), 0b010);
        latch.set_fpga_ready(false);
        assert!(!latch.fpga_ready());
    }
}
