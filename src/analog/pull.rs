//! Pull-resistor control through the per-port I2C I/O expanders.
//!
//! Each port has an 8-bit expander whose lines connect pull resistors to
//! the I/O pins. A line's output register picks the pull direction and
//! its configuration register connects it: configuration 0 drives the
//! line (pull connected), 1 floats it, so the enabled mask is stored
//! inverted.

use embedded_hal::i2c::I2c;

use super::{PORT_COUNT, Port, PullState};
use crate::error::Error;

/// Per-port expander addresses, in port order.
const EXPANDER_ADDRESS: [u8; PORT_COUNT] = [0x20, 0x21];

const REG_OUTPUT: u8 = 0x01;
const REG_CONFIG: u8 = 0x03;

/// Driver for the per-port pull-resistor expanders.
pub struct PullExpander;

impl PullExpander {
    /// A driver for the fixed pair of expanders.
    pub fn new() -> Self {
        PullExpander
    }

    /// Program the pull resistors of `port`. The levels are set before
    /// any line is connected so a newly enabled pull never glitches
    /// through the old direction.
    pub fn set<B: I2c>(&mut self, bus: &mut B, port: Port, pull: PullState) -> Result<(), Error> {
        let address = EXPANDER_ADDRESS[port.index()];
        bus.write(address, &[REG_OUTPUT, pull.level])
            .map_err(|_| Error::Bus)?;
        bus.write(address, &[REG_CONFIG, !pull.enabled])
            .map_err(|_| Error::Bus)
    }

    /// The pull-resistor state of `port`.
    pub fn get<B: I2c>(&mut self, bus: &mut B, port: Port) -> Result<PullState, Error> {
        let address = EXPANDER_ADDRESS[port.index()];
        let mut level = [0u8; 1];
        let mut config = [0u8; 1];
        bus.write_read(address, &[REG_OUTPUT], &mut level)
            .map_err(|_| Error::Bus)?;
        bus.write_read(address, &[REG_CONFIG], &mut config)
            .map_err(|_| Error::Bus)?;
        Ok(PullState {
            enabled: !config[0],
            level: level[0],
        })
    }
}
