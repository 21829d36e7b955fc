//! FPGA configuration channel and register bus.
//!
//! The bit-serial link that shifts configuration data into the FPGA is
//! hardware-specific and lives in the board support code behind
//! [`ConfigLink`]; this module owns the state machine that sequences it
//! and the byte-addressed register protocol used once the FPGA runs.

use embedded_hal::i2c::{I2c, Operation};

use crate::error::Error;

/// Minimum time, in microseconds, that [`ConfigLink::reset`]
/// implementations must wait after releasing the configuration-reset
/// line. The slowest supported image device documents 1200 µs; smaller
/// parts need 800 µs.
pub const RESET_SETTLE_US: u32 = 1200;

/// Largest bitstream chunk accepted by [`FpgaChannel::load`].
pub const MAX_LOAD_CHUNK: usize = 64;

/// The physical configuration link.
///
/// Implementations handle the cycle-exact pin work: disabling the
/// data-FIFO bus and holding configuration reset, clocking raw bytes out
/// bit-serially, and the start sequence that pulses the internal clock,
/// hands the link back to the FPGA and re-enables the FIFO bus. The state
/// machine in [`FpgaChannel`] never sees any of that timing.
pub trait ConfigLink {
    /// Disable the data-FIFO bus, pulse configuration reset and wait at
    /// least [`RESET_SETTLE_US`] before returning.
    fn reset(&mut self) -> Result<(), Error>;
    /// Shift `chunk` into the FPGA. Content is not interpreted; any byte
    /// stream is forwarded.
    fn load(&mut self, chunk: &[u8]) -> Result<(), Error>;
    /// Run the start sequence and hand the link over to the FPGA.
    fn start(&mut self) -> Result<(), Error>;
    /// Level of the FPGA's ready line, right now.
    fn is_ready(&mut self) -> bool;
}

/// Byte-addressed register protocol spoken to a started FPGA.
///
/// Independent of the bitstream path: a register address is selected
/// once, then a byte range is read or written. A failure in any phase
/// aborts without retry.
pub trait RegisterBus {
    /// Select the register subsequent transfers address.
    fn select(&mut self, register: u8) -> Result<(), Error>;
    /// Read `buf.len()` bytes from the selected register.
    fn read(&mut self, buf: &mut [u8]) -> Result<(), Error>;
    /// Write `data` to the selected register.
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;
}

/// Phases of the configuration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    /// No configuration attempted since power-up.
    Idle,
    /// Reset issued but not completed; only observable after a failed
    /// [`FpgaChannel::begin`].
    Resetting,
    /// Accepting bitstream data.
    Loading,
    /// Start sequence issued but not completed; only observable after a
    /// failed [`FpgaChannel::start`].
    Starting,
    /// The FPGA reported ready after start.
    Ready,
    /// The FPGA failed to report ready after start.
    Faulted,
}

/// State machine driving a [`ConfigLink`].
///
/// Idle → Resetting → Loading → Starting → Ready | Faulted. A new
/// [`begin`](Self::begin) is legal in any state and aborts whatever was
/// in progress.
#[derive(Debug)]
pub struct FpgaChannel {
    state: LinkState,
}

impl FpgaChannel {
    /// Channel for an FPGA that may already be running (self-loaded from
    /// the image store at power-up).
    pub fn new(ready_at_boot: bool) -> Self {
        Self {
            state: if ready_at_boot {
                LinkState::Ready
            } else {
                LinkState::Idle
            },
        }
    }

    /// Current phase of the handshake.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Whether the last configuration sequence ended with a running FPGA.
    pub fn is_started(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Reset the FPGA and open a new loading sequence.
    ///
    /// Aborts any state the channel was in; the caller is responsible for
    /// discarding the image identifier, which no longer describes the
    /// replaced image.
    pub fn begin<L: ConfigLink>(&mut self, link: &mut L) -> Result<(), Error> {
        debug!("fpga: reset, leaving {}", self.state);
        self.state = LinkState::Resetting;
        link.reset()?;
        self.state = LinkState::Loading;
        Ok(())
    }

    /// Forward one bitstream chunk.
    ///
    /// Accepted only while loading and only up to [`MAX_LOAD_CHUNK`]
    /// bytes at a time.
    pub fn load<L: ConfigLink>(&mut self, link: &mut L, chunk: &[u8]) -> Result<(), Error> {
        if self.state != LinkState::Loading {
            return Err(Error::LinkBusy);
        }
        if chunk.len() > MAX_LOAD_CHUNK {
            return Err(Error::BadLength);
        }
        link.load(chunk)
    }

    /// Close loading and start the FPGA.
    ///
    /// Returns whether the FPGA reported ready; `Ok(false)` is a
    /// hardware fault for the caller to latch, not an error.
    pub fn start<L: ConfigLink>(&mut self, link: &mut L) -> Result<bool, Error> {
        if self.state != LinkState::Loading {
            return Err(Error::LinkBusy);
        }
        self.state = LinkState::Starting;
        link.start()?;
        let ready = link.is_ready();
        self.state = if ready {
            LinkState::Ready
        } else {
            LinkState::Faulted
        };
        info!("fpga: start, ready={=bool}", ready);
        Ok(ready)
    }
}

/// [`RegisterBus`] spoken over an I2C connection to the FPGA fabric.
///
/// The fabric exposes a one-byte register file at a fixed bus address:
/// a write of the register byte selects, a subsequent read or write
/// moves data.
pub struct I2cRegisterBus<B> {
    bus: B,
    address: u8,
    register: u8,
}

impl<B: I2c> I2cRegisterBus<B> {
    /// Talk to the register file at `address`.
    pub fn new(bus: B, address: u8) -> Self {
        Self {
            bus,
            address,
            register: 0,
        }
    }
}

impl<B: I2c> RegisterBus for I2cRegisterBus<B> {
    fn select(&mut self, register: u8) -> Result<(), Error> {
        self.register = register;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.bus
            .write_read(self.address, &[self.register], buf)
            .map_err(|_| Error::Bus)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.bus
            .transaction(
                self.address,
                &mut [Operation::Write(&[self.register]), Operation::Write(data)],
            )
            .map_err(|_| Error::Bus)
    }
}
