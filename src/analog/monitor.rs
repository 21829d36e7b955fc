//! Threshold-monitor voltage sensing (revision A/B boards).
//!
//! These boards sense each rail through an 8-bit I2C ADC with built-in
//! limit comparison. The ADC latches under/over-limit flags in a status
//! register and asserts a shared interrupt line; [`poll`] reads the
//! flags and quiesces the line, [`clear`] releases the latch and
//! re-arms it.
//!
//! [`poll`]: ThresholdMonitor::poll
//! [`clear`]: ThresholdMonitor::clear

use embedded_hal::i2c::I2c;

use super::{AlertWindow, PORT_COUNT, Port, PortMask};
use crate::error::Error;

/// Per-port ADC addresses, in port order.
const ADC_ADDRESS: [u8; PORT_COUNT] = [0x54, 0x55];

const REG_RESULT: u8 = 0x00;
const REG_ALERT_STATUS: u8 = 0x01;
const REG_CONFIG: u8 = 0x02;
const REG_LOW_LIMIT: u8 = 0x03;
const REG_HIGH_LIMIT: u8 = 0x04;

/// Status bits: latched under/over-range flags, write-1-to-clear.
const ST_UNDER: u8 = 1 << 0;
const ST_OVER: u8 = 1 << 1;

/// Config: route alerts to the interrupt pin.
const CFG_ALERT_PIN: u8 = 1 << 2;
/// Config: latch alert flags until explicitly cleared.
const CFG_ALERT_HOLD: u8 = 1 << 4;
/// Config: automatic conversion cycle, slowest rate.
const CFG_CYCLE: u8 = 0b110 << 5;

/// The config word while a window is armed and routed to the pin.
const CFG_ARMED: u8 = CFG_CYCLE | CFG_ALERT_HOLD | CFG_ALERT_PIN;

/// One ADC step is 25.9 millivolts through the rail divider.
fn millivolts_for_raw(raw: u16) -> u16 {
    ((raw >> 4) as u32 * 259 / 10) as u16
}

fn raw_for_millivolts(millivolts: u16) -> u16 {
    let code = (millivolts as u32 * 10 / 259).min(0xFF) as u16;
    code << 4
}

/// Driver for the per-port threshold-monitoring ADCs.
pub struct ThresholdMonitor;

impl ThresholdMonitor {
    /// A driver for the fixed pair of monitoring ADCs.
    pub fn new() -> Self {
        ThresholdMonitor
    }

    fn read_register<B: I2c>(bus: &mut B, port: Port, register: u8, buffer: &mut [u8]) -> Result<(), Error> {
        bus.write_read(ADC_ADDRESS[port.index()], &[register], buffer)
            .map_err(|_| Error::Bus)
    }

    fn write_register<B: I2c>(bus: &mut B, port: Port, register: u8, data: &[u8]) -> Result<(), Error> {
        let mut frame = [0u8; 3];
        frame[0] = register;
        frame[1..1 + data.len()].copy_from_slice(data);
        bus.write(ADC_ADDRESS[port.index()], &frame[..1 + data.len()])
            .map_err(|_| Error::Bus)
    }

    /// Measure the rail voltage of `port`.
    pub fn measure<B: I2c>(&mut self, bus: &mut B, port: Port) -> Result<u16, Error> {
        let mut raw = [0u8; 2];
        Self::read_register(bus, port, REG_RESULT, &mut raw)?;
        Ok(millivolts_for_raw(u16::from_be_bytes(raw)))
    }

    /// Program the alert window of every port in `ports`. The disabled
    /// sentinel widens the limits to full scale and stops conversion.
    pub fn set_window<B: I2c>(
        &mut self,
        bus: &mut B,
        ports: PortMask,
        window: AlertWindow,
    ) -> Result<(), Error> {
        let (low, high, config) = if window.is_disabled() {
            (0x0000u16, 0x0FF0u16, 0u8)
        } else {
            (
                raw_for_millivolts(window.low_mv),
                raw_for_millivolts(window.high_mv),
                CFG_ARMED,
            )
        };
        for port in ports.iter() {
            Self::write_register(bus, port, REG_LOW_LIMIT, &low.to_be_bytes())?;
            Self::write_register(bus, port, REG_HIGH_LIMIT, &high.to_be_bytes())?;
            Self::write_register(bus, port, REG_CONFIG, &[config])?;
        }
        Ok(())
    }

    /// The alert window of `port`; the sentinel when conversion is off.
    pub fn get_window<B: I2c>(&mut self, bus: &mut B, port: Port) -> Result<AlertWindow, Error> {
        let mut config = [0u8; 1];
        Self::read_register(bus, port, REG_CONFIG, &mut config)?;
        if config[0] == 0 {
            return Ok(AlertWindow::DISABLED);
        }
        let mut low = [0u8; 2];
        let mut high = [0u8; 2];
        Self::read_register(bus, port, REG_LOW_LIMIT, &mut low)?;
        Self::read_register(bus, port, REG_HIGH_LIMIT, &mut high)?;
        Ok(AlertWindow {
            low_mv: millivolts_for_raw(u16::from_be_bytes(low)),
            high_mv: millivolts_for_raw(u16::from_be_bytes(high)),
        })
    }

    /// Which ports have latched an alert. Alerting ports are taken off
    /// the interrupt pin so the line releases; the latch itself stays
    /// set until [`clear`](Self::clear).
    pub fn poll<B: I2c>(&mut self, bus: &mut B) -> Result<PortMask, Error> {
        let mut alerted = PortMask::NONE;
        for port in Port::ALL {
            let mut status = [0u8; 1];
            Self::read_register(bus, port, REG_ALERT_STATUS, &mut status)?;
            if status[0] & (ST_UNDER | ST_OVER) != 0 {
                alerted.insert(port);
                Self::write_register(bus, port, REG_CONFIG, &[CFG_ARMED & !CFG_ALERT_PIN])?;
            }
        }
        Ok(alerted)
    }

    /// Release the latched alert of every port in `ports` and put armed
    /// ports back on the interrupt pin.
    pub fn clear<B: I2c>(&mut self, bus: &mut B, ports: PortMask) -> Result<(), Error> {
        for port in ports.iter() {
            Self::write_register(bus, port, REG_ALERT_STATUS, &[ST_UNDER | ST_OVER])?;
            let mut config = [0u8; 1];
            Self::read_register(bus, port, REG_CONFIG, &mut config)?;
            if config[0] != 0 {
                Self::write_register(bus, port, REG_CONFIG, &[CFG_ARMED])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::testbus::BusLog;

    /// A measurement converts the 8-bit code through the rail divider.
    #[test]
    fn measurement_scaling() {
        // Code 128 in bits 11..4.
        let mut bus = BusLog::replying(&[&[0x08, 0x00]]);
        let mut monitor = ThresholdMonitor::new();
        let mv = monitor.measure(&mut bus, Port::A).unwrap();
        assert_eq!(mv, 128 * 259 / 10);
    }

    /// An armed window programs both limits and the armed config word.
    #[test]
    fn window_programming() {
        let mut bus = BusLog::default();
        let mut monitor = ThresholdMonitor::new();
        let window = AlertWindow {
            low_mv: 3000,
            high_mv: 3600,
        };
        monitor.set_window(&mut bus, Port::B.mask(), window).unwrap();
        let low = raw_for_millivolts(3000).to_be_bytes();
        let high = raw_for_millivolts(3600).to_be_bytes();
        assert_eq!(
            bus.writes,
            vec![
                (0x55, vec![REG_LOW_LIMIT, low[0], low[1]]),
                (0x55, vec![REG_HIGH_LIMIT, high[0], high[1]]),
                (0x55, vec![REG_CONFIG, CFG_ARMED]),
            ]
        );
    }

    /// The disabled sentinel widens the limits and stops conversion.
    #[test]
    fn window_disable() {
        let mut bus = BusLog::default();
        let mut monitor = ThresholdMonitor::new();
        monitor
            .set_window(&mut bus, Port::A.mask(), AlertWindow::DISABLED)
            .unwrap();
        assert_eq!(
            bus.writes,
            vec![
                (0x54, vec![REG_LOW_LIMIT, 0x00, 0x00]),
                (0x54, vec![REG_HIGH_LIMIT, 0x0F, 0xF0]),
                (0x54, vec![REG_CONFIG, 0]),
            ]
        );
    }

    /// A zero config register reads back as the disabled sentinel.
    #[test]
    fn disabled_window_readback() {
        let mut bus = BusLog::replying(&[&[0x00]]);
        let mut monitor = ThresholdMonitor::new();
        let window = monitor.get_window(&mut bus, Port::A).unwrap();
        assert!(window.is_disabled());
    }

    /// Polling reports latched ports and takes them off the pin without
    /// releasing the latch.
    #[test]
    fn poll_reports_and_quiesces() {
        // Port A latched over-range, port B quiet.
        let mut bus = BusLog::replying(&[&[ST_OVER], &[0x00]]);
        let mut monitor = ThresholdMonitor::new();
        let alerted = monitor.poll(&mut bus).unwrap();
        assert_eq!(alerted, Port::A.mask());
        // Status-register selects bracket port A's quiesce write.
        assert_eq!(
            bus.writes,
            vec![
                (0x54, vec![REG_ALERT_STATUS]),
                (0x54, vec![REG_CONFIG, CFG_ARMED & !CFG_ALERT_PIN]),
                (0x55, vec![REG_ALERT_STATUS]),
            ]
        );
    }

    /// Clearing writes the latch bits back and re-arms the pin while a
    /// window is still configured.
    #[test]
    fn clear_releases_and_rearms() {
        let mut bus = BusLog::replying(&[&[CFG_ARMED & !CFG_ALERT_PIN]]);
        let mut monitor = ThresholdMonitor::new();
        monitor.clear(&mut bus, Port::A.mask()).unwrap();
        // The middle write is the config readback's register select.
        assert_eq!(
            bus.writes,
            vec![
                (0x54, vec![REG_ALERT_STATUS, ST_UNDER | ST_OVER]),
                (0x54, vec![REG_CONFIG]),
                (0x54, vec![REG_CONFIG, CFG_ARMED]),
            ]
        );
    }
}
