//! The crate-wide error type.

/// Faults raised while admitting or executing a control command.
///
/// The dispatcher sorts these into two classes. *Protocol* faults are
/// malformed or out-of-order requests: the command is refused at admission
/// and no device state changes. Everything else is a *transport* fault, a
/// transaction that failed partway through a command: the command is
/// aborted at the failing step and the ERROR status bit is latched for the
/// host to discover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The request code is not one the firmware understands, or the setup
    /// packet was not a vendor request addressed to the device.
    UnknownRequest(u8),
    /// The request direction does not match the operation (for example, a
    /// status query issued as a host-to-device transfer).
    BadDirection,
    /// The payload length does not match the operation's wire contract.
    BadLength,
    /// A bitstream chunk arrived out of sequence.
    ///
    /// Chunks must arrive with index 0 (which restarts the upload) or with
    /// exactly the index after the last accepted one. The offending chunk
    /// is rejected and the sequence counter does not advance.
    BadChunkIndex {
        /// The next index the upload sequence would have accepted.
        expected: u16,
        /// The index the host actually sent.
        received: u16,
    },
    /// The logical chip selector does not resolve to a physical store.
    UnknownStorageChip(u16),
    /// The port selector or mask names a port this device does not have.
    UnknownPort(u8),
    /// A millivolt value is outside the regulators' programmable range.
    VoltageOutOfRange(u16),
    /// A voltage-set request exceeds the port's configured ceiling.
    AboveCeiling {
        /// The requested output level in millivolts.
        requested: u16,
        /// The port's ceiling in millivolts.
        ceiling: u16,
    },
    /// The configuration channel is not in a state that accepts this
    /// operation (for example, image data sent before a reset).
    LinkBusy,
    /// An image-identifier write arrived before the FPGA reported a
    /// successful start.
    FpgaNotStarted,
    /// An I2C transaction with a peripheral failed.
    Bus,
    /// A digital control line could not be driven.
    Pin,
    /// A non-volatile storage transaction failed.
    Storage,
    /// A data phase on the control endpoint failed.
    Transport,
}

impl Error {
    /// True for faults rejected at admission with no state change.
    ///
    /// The dispatcher latches the ERROR status bit only for the other,
    /// mid-command class of fault.
    pub fn is_protocol(&self) -> bool {
        match self {
            Error::UnknownRequest(_)
            | Error::BadDirection
            | Error::BadLength
            | Error::BadChunkIndex { .. }
            | Error::UnknownStorageChip(_)
            | Error::UnknownPort(_)
            | Error::VoltageOutOfRange(_)
            | Error::AboveCeiling { .. }
            | Error::LinkBusy
            | Error::FpgaNotStarted => true,
            Error::Bus | Error::Pin | Error::Storage | Error::Transport => false,
        }
    }
}
