//! Control-channel request decoding and transport.
//!
//! The host drives the device through vendor-defined control transfers: an
//! 8-byte setup packet carrying a request code, two 16-bit parameters and
//! a payload length, followed by up to 64-byte data chunks in either
//! direction. Enumeration and descriptor tables live in the board support
//! code; this module only decodes the vendor requests it owns.

use byteorder::{ByteOrder, LittleEndian};
use num_traits::FromPrimitive;

use crate::error::Error;

/// Largest data chunk moved in one control-transfer transaction.
pub const MAX_CHUNK: usize = 64;

/// Setup-packet bits: type vendor, recipient device.
const VENDOR_TO_DEVICE: u8 = 0x40;
/// Setup-packet direction bit: device-to-host when set.
const DIRECTION_IN: u8 = 0x80;

/// Transfer direction of a control request's data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Host to device: a set/write operation.
    Out,
    /// Device to host: a get/read operation.
    In,
}

/// Vendor request codes understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestCode {
    /// Non-volatile storage read/write, chip selected by `index`.
    NvStorage = 0x10,
    /// FPGA bitstream load (chunked) and start.
    FpgaConfig = 0x11,
    /// One-byte status report. Reading clears the ERROR bit.
    Status = 0x12,
    /// FPGA register-bus read/write, register selected by `value`.
    FpgaRegister = 0x13,
    /// Output voltage get/set, millivolts.
    Voltage = 0x14,
    /// Read-only voltage measurement, millivolts.
    SenseVoltage = 0x15,
    /// Over/under-voltage alert window get/set.
    AlertWindow = 0x16,
    /// Alert poll and acknowledge.
    PollAlert = 0x17,
    /// FPGA image identifier get/set.
    ImageId = 0x18,
    /// Output buffer enable/disable.
    BufferEnable = 0x19,
    /// Per-port voltage-ceiling get/set.
    VoltageCeiling = 0x1A,
    /// Pull-resistor configuration get/set.
    Pull = 0x1B,
    /// Protocol compatibility level query.
    ApiLevel = 0x1F,
    /// Vendor-compatibility alias of [`NvStorage`](Self::NvStorage)
    /// fixed to the control store, kept so historical host tooling can
    /// reflash the boot store.
    LegacyStorage = 0xA9,
}

/// A decoded vendor control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlRequest {
    /// Data-phase direction.
    pub direction: Direction,
    /// The vendor request code.
    pub code: RequestCode,
    /// First 16-bit parameter (`wValue`): address or value selector.
    pub value: u16,
    /// Second 16-bit parameter (`wIndex`): chip/port selector or chunk
    /// index.
    pub index: u16,
    /// Data-phase length in bytes.
    pub length: u16,
}

impl ControlRequest {
    /// Decode an 8-byte setup packet.
    ///
    /// Only vendor requests addressed to the device are accepted; anything
    /// else, or an unknown request code, is a protocol fault.
    pub fn parse(setup: &[u8; 8]) -> Result<Self, Error> {
        let request_type = setup[0];
        if request_type & !DIRECTION_IN != VENDOR_TO_DEVICE {
            return Err(Error::UnknownRequest(setup[1]));
        }
        let code = RequestCode::from_u8(setup[1]).ok_or(Error::UnknownRequest(setup[1]))?;
        let direction = if request_type & DIRECTION_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        Ok(Self {
            direction,
            code,
            value: LittleEndian::read_u16(&setup[2..4]),
            index: LittleEndian::read_u16(&setup[4..6]),
            length: LittleEndian::read_u16(&setup[6..8]),
        })
    }

    /// Fail unless the request's data phase runs in `direction`.
    pub fn expect_direction(&self, direction: Direction) -> Result<(), Error> {
        if self.direction == direction {
            Ok(())
        } else {
            Err(Error::BadDirection)
        }
    }

    /// Fail unless the data phase is exactly `length` bytes.
    pub fn expect_length(&self, length: u16) -> Result<(), Error> {
        if self.length == length {
            Ok(())
        } else {
            Err(Error::BadLength)
        }
    }
}

/// The control endpoint's data and status phases.
///
/// Implemented by the board support code over the real endpoint buffers.
/// The dispatcher calls [`read`](Self::read)/[`write`](Self::write) in
/// chunks of at most [`MAX_CHUNK`] bytes, then closes the transfer with
/// [`accept`](Self::accept) or [`reject`](Self::reject). `reject` doubles
/// as the mid-transfer abort: issued after a failed step it stalls
/// whatever remains of the transfer.
pub trait ControlPipe {
    /// The setup packet of the admitted request.
    fn setup(&self) -> [u8; 8];
    /// Receive exactly `buf.len()` host-to-device payload bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<(), Error>;
    /// Send `data` as device-to-host payload bytes.
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;
    /// Complete the transfer successfully.
    fn accept(&mut self);
    /// Refuse or abort the transfer with a stall.
    fn reject(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(request_type: u8, code: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
        let mut packet = [request_type, code, 0, 0, 0, 0, 0, 0];
        LittleEndian::write_u16(&mut packet[2..4], value);
        LittleEndian::write_u16(&mut packet[4..6], index);
        LittleEndian::write_u16(&mut packet[6..8], length);
        packet
    }

    /// Vendor requests decode with their parameters in little-endian
    /// order.
    #[test]
    fn parses_vendor_request() {
        let req = ControlRequest::parse(&setup(0xC0, 0x12, 0, 0, 1)).unwrap();
        assert_eq!(req.direction, Direction::In);
        assert_eq!(req.code, RequestCode::Status);
        assert_eq!(req.length, 1);

        let req = ControlRequest::parse(&setup(0x40, 0x11, 0, 0x0102, 64)).unwrap();
        assert_eq!(req.direction, Direction::Out);
        assert_eq!(req.code, RequestCode::FpgaConfig);
        assert_eq!(req.index, 0x0102);
    }

    /// Standard and class requests are not ours to answer.
    #[test]
    fn rejects_non_vendor_requests() {
        assert_eq!(
            ControlRequest::parse(&setup(0x80, 0x06, 0x0100, 0, 18)),
            Err(Error::UnknownRequest(0x06))
        );
        // Vendor request to an interface rather than the device.
        assert_eq!(
            ControlRequest::parse(&setup(0xC1, 0x12, 0, 0, 1)),
            Err(Error::UnknownRequest(0x12))
        );
    }

    /// Unknown vendor codes are protocol faults carrying the code.
    #[test]
    fn rejects_unknown_codes() {
        assert_eq!(
            ControlRequest::parse(&setup(0xC0, 0x42, 0, 0, 0)),
            Err(Error::UnknownRequest(0x42))
        );
    }

    /// The legacy storage alias is still decoded.
    #[test]
    fn decodes_legacy_storage_code() {
        let req = ControlRequest::parse(&setup(0x40, 0xA9, 0x1000, 0, 64)).unwrap();
        assert_eq!(req.code, RequestCode::LegacyStorage);
        assert_eq!(req.value, 0x1000);
    }

    /// Direction and length guards report the right protocol faults.
    #[test]
    fn direction_and_length_guards() {
        let req = ControlRequest::parse(&setup(0xC0, 0x12, 0, 0, 1)).unwrap();
        assert!(req.expect_direction(Direction::In).is_ok());
        assert_eq!(
            req.expect_direction(Direction::Out),
            Err(Error::BadDirection)
        );
        assert!(req.expect_length(1).is_ok());
        assert_eq!(req.expect_length(2), Err(Error::BadLength));
    }
}
