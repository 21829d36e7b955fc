//! Power-monitor voltage sensing (revision C and later boards).
//!
//! Later boards replace the threshold ADCs with PMBus power monitors.
//! The monitor reports the bus voltage through `READ_VIN` (scaled by the
//! 5/4 input divider) and latches warning flags in its
//! manufacturer-specific status register. Warning thresholds cannot yet
//! be programmed from the window millivolts, so alert windows read back
//! as disabled and programming one is accepted as a no-op until the
//! threshold mapping is nailed down.

use embedded_hal::i2c::I2c;

use super::{AlertWindow, PORT_COUNT, Port, PortMask};
use crate::error::Error;

/// Per-port monitor addresses, in port order.
const MONITOR_ADDRESS: [u8; PORT_COUNT] = [0x40, 0x41];

const CMD_RESTORE_DEFAULT_ALL: u8 = 0x12;
const CMD_STATUS_MFR_SPECIFIC: u8 = 0x80;
const CMD_READ_VIN: u8 = 0x88;
const CMD_MFR_ALERT_MASK: u8 = 0xD2;

/// Latched warning flags in the manufacturer status register.
const ST_UNDERVOLTAGE: u8 = 1 << 0;
const ST_OVERVOLTAGE: u8 = 1 << 1;
const ST_OVERCURRENT: u8 = 1 << 2;
const ST_OVERPOWER: u8 = 1 << 3;

const ST_WARNINGS: u8 = ST_UNDERVOLTAGE | ST_OVERVOLTAGE | ST_OVERCURRENT | ST_OVERPOWER;

/// Driver for the per-port PMBus power monitors.
///
/// Caches each port's latched status so a poll that has already seen a
/// flag keeps reporting the port until the host clears it, even if the
/// monitor resets underneath.
pub struct PowerMonitor {
    status: [u8; PORT_COUNT],
}

impl PowerMonitor {
    /// A driver for the fixed pair of power monitors, no flags latched.
    pub fn new() -> Self {
        PowerMonitor {
            status: [0; PORT_COUNT],
        }
    }

    fn read_register<B: I2c>(bus: &mut B, port: Port, command: u8, buffer: &mut [u8]) -> Result<(), Error> {
        bus.write_read(MONITOR_ADDRESS[port.index()], &[command], buffer)
            .map_err(|_| Error::Bus)
    }

    /// Measure the rail voltage of `port`.
    pub fn measure<B: I2c>(&mut self, bus: &mut B, port: Port) -> Result<u16, Error> {
        let mut raw = [0u8; 2];
        Self::read_register(bus, port, CMD_READ_VIN, &mut raw)?;
        // VIN is in millivolts behind a 5/4 input divider.
        let code = u16::from_le_bytes(raw) as u32;
        Ok((code * 5 / 4) as u16)
    }

    /// Accepted but not yet programmed into the monitor's warning
    /// thresholds.
    pub fn set_window<B: I2c>(
        &mut self,
        _bus: &mut B,
        _ports: PortMask,
        _window: AlertWindow,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Always the disabled sentinel; see [`set_window`](Self::set_window).
    pub fn get_window<B: I2c>(&mut self, _bus: &mut B, _port: Port) -> Result<AlertWindow, Error> {
        Ok(AlertWindow::DISABLED)
    }

    /// Which ports have a warning latched, folding freshly read flags
    /// into the cache.
    pub fn poll<B: I2c>(&mut self, bus: &mut B) -> Result<PortMask, Error> {
        let mut alerted = PortMask::NONE;
        for port in Port::ALL {
            let mut status = [0u8; 1];
            Self::read_register(bus, port, CMD_STATUS_MFR_SPECIFIC, &mut status)?;
            self.status[port.index()] |= status[0] & ST_WARNINGS;
            if self.status[port.index()] != 0 {
                alerted.insert(port);
            }
        }
        Ok(alerted)
    }

    /// Reset every monitor in `ports` to defaults, unmask its alert
    /// output and drop the cached flags.
    pub fn clear<B: I2c>(&mut self, bus: &mut B, ports: PortMask) -> Result<(), Error> {
        for port in ports.iter() {
            let address = MONITOR_ADDRESS[port.index()];
            bus.write(address, &[CMD_RESTORE_DEFAULT_ALL])
                .map_err(|_| Error::Bus)?;
            bus.write(address, &[CMD_MFR_ALERT_MASK, 0xFF])
                .map_err(|_| Error::Bus)?;
            self.status[port.index()] = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::testbus::BusLog;

    /// VIN readings are little-endian and scaled by the input divider.
    #[test]
    fn measurement_scaling() {
        // 3300 * 4/5 = 2640 = 0x0A50, sent low byte first.
        let mut bus = BusLog::replying(&[&[0x50, 0x0A]]);
        let mut monitor = PowerMonitor::new();
        assert_eq!(monitor.measure(&mut bus, Port::A), Ok(3300));
    }

    /// A latched warning keeps the port alerting across later polls even
    /// when the register reads back clean.
    #[test]
    fn warning_latch_is_sticky() {
        let mut bus = BusLog::replying(&[
            &[ST_OVERCURRENT],
            &[0x00],
            &[0x00],
            &[0x00],
        ]);
        let mut monitor = PowerMonitor::new();
        assert_eq!(monitor.poll(&mut bus), Ok(Port::A.mask()));
        assert_eq!(monitor.poll(&mut bus), Ok(Port::A.mask()));
    }

    /// Clearing resets the monitor, unmasks its alert output and drops
    /// the cache.
    #[test]
    fn clear_resets_monitor() {
        let mut bus = BusLog::replying(&[&[ST_OVERVOLTAGE], &[0x00], &[0x00], &[0x00]]);
        let mut monitor = PowerMonitor::new();
        monitor.poll(&mut bus).unwrap();
        monitor.clear(&mut bus, Port::A.mask()).unwrap();
        assert_eq!(
            bus.writes.last(),
            Some(&(0x40, vec![CMD_MFR_ALERT_MASK, 0xFF]))
        );
        assert!(
            bus.writes
                .contains(&(0x40, vec![CMD_RESTORE_DEFAULT_ALL]))
        );
        assert_eq!(monitor.poll(&mut bus), Ok(PortMask::NONE));
    }

    /// Windows are accepted without bus traffic and read back disabled.
    #[test]
    fn window_placeholder() {
        let mut bus = BusLog::default();
        let mut monitor = PowerMonitor::new();
        let window = AlertWindow {
            low_mv: 3000,
            high_mv: 3600,
        };
        monitor.set_window(&mut bus, PortMask::ALL, window).unwrap();
        assert!(bus.writes.is_empty());
        let readback = monitor.get_window(&mut bus, Port::A).unwrap();
        assert!(readback.is_disabled());
    }
}
