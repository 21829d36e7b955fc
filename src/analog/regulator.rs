//! DAC-programmed rail regulators.
//!
//! Each port's regulator is set through an I2C DAC whose code word maps
//! inversely onto the output voltage: code 0xFE0 gives the minimum
//! 1.65 V and lower codes raise the rail, up to 5.5 V. Both DACs also
//! answer on a shared broadcast address so a both-port set is a single
//! bus transaction.

use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::I2c;

use super::{MAX_VOLTAGE_MV, MIN_VOLTAGE_MV, PORT_COUNT, Port, PortMask};
use crate::error::Error;

/// Per-port DAC addresses, in port order.
const DAC_ADDRESS: [u8; PORT_COUNT] = [0x0C, 0x0D];
/// Broadcast address both DACs are strapped to answer on.
const DAC_ADDRESS_ALL: u8 = 0x0E;

/// The DAC code word for an output level within the legal range.
fn code_for_millivolts(millivolts: u16) -> u16 {
    let steps = ((millivolts - MIN_VOLTAGE_MV) as u32 >> 4) * 269;
    (254 << 4) - (steps >> 4) as u16
}

/// The nominal output level for a DAC code word.
fn millivolts_for_code(code: u16) -> u16 {
    let steps = (255 - (code >> 4)) as u32;
    MIN_VOLTAGE_MV + (steps * 152 / 10) as u16
}

/// Driver for the per-port regulators and their enable lines.
///
/// Tracks the commanded level per port so that a disabled output reads
/// back as 0 without touching the bus, and so the 0-millivolt disable
/// sentinel never reaches the DAC.
pub struct RailRegulator<EN> {
    enable: [EN; PORT_COUNT],
    level_mv: [u16; PORT_COUNT],
}

impl<EN: OutputPin> RailRegulator<EN> {
    /// Take ownership of the per-port enable lines, outputs disabled.
    pub fn new(enable: [EN; PORT_COUNT]) -> Self {
        RailRegulator {
            enable,
            level_mv: [0; PORT_COUNT],
        }
    }

    /// Program every port in `ports` to `millivolts`, or disable their
    /// outputs when it is 0.
    pub fn set_voltage<B: I2c>(
        &mut self,
        bus: &mut B,
        ports: PortMask,
        millivolts: u16,
    ) -> Result<(), Error> {
        if ports.is_empty() {
            return Ok(());
        }
        if millivolts == 0 {
            for port in ports.iter() {
                self.enable[port.index()].set_low().map_err(|_| Error::Pin)?;
                self.level_mv[port.index()] = 0;
            }
            return Ok(());
        }
        if !(MIN_VOLTAGE_MV..=MAX_VOLTAGE_MV).contains(&millivolts) {
            return Err(Error::VoltageOutOfRange(millivolts));
        }

        let word = code_for_millivolts(millivolts).to_be_bytes();
        if ports == PortMask::ALL {
            bus.write(DAC_ADDRESS_ALL, &word).map_err(|_| Error::Bus)?;
        } else {
            for port in ports.iter() {
                bus.write(DAC_ADDRESS[port.index()], &word)
                    .map_err(|_| Error::Bus)?;
            }
        }
        for port in ports.iter() {
            self.enable[port.index()].set_high().map_err(|_| Error::Pin)?;
            self.level_mv[port.index()] = millivolts;
        }
        Ok(())
    }

    /// The commanded level of `port`, read back from the DAC; 0 when the
    /// output is disabled.
    pub fn get_voltage<B: I2c>(&mut self, bus: &mut B, port: Port) -> Result<u16, Error> {
        if self.level_mv[port.index()] == 0 {
            return Ok(0);
        }
        let mut word = [0u8; 2];
        bus.read(DAC_ADDRESS[port.index()], &mut word)
            .map_err(|_| Error::Bus)?;
        Ok(millivolts_for_code(u16::from_be_bytes(word)))
    }
}
