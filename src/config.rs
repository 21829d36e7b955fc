//! Persisted identity and calibration record.
//!
//! A fixed 64-byte block stored near the top of the control store. It is
//! read once at boot and individual fields are rewritten when the host
//! changes them; the in-memory copy stays authoritative even when a write
//! back fails.

use byteorder::{ByteOrder, LittleEndian};
use core::ops::Range;

use crate::analog::{MAX_VOLTAGE_MV, PORT_COUNT};

/// Size of the encoded record in bytes.
pub const RECORD_SIZE: usize = 64;

/// Serial string substituted when no valid record is present.
pub const SENTINEL_SERIAL: [u8; 16] = *b"9999999999999999";

const REVISION_AT: usize = 0;
const SERIAL: Range<usize> = 1..17;
const IMAGE_SIZE: Range<usize> = 17..21;
const IMAGE_ID: Range<usize> = 21..37;
const CEILING: Range<usize> = 37..41;
const MANUFACTURER: Range<usize> = 41..63;
const FLAGS_AT: usize = 63;

/// Hardware revision tag.
///
/// Encoded in one byte: the high nibble is the revision letter (1 means
/// `A`) and the low nibble the digit, so `C2` encodes as `0x32`. The zero
/// byte means the revision is unknown. Very old records stored a bare
/// ASCII letter instead; [`ConfigStore::boot`](crate::storage::ConfigStore::boot)
/// migrates those forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Revision {
    /// No valid revision tag was found; peripheral drivers cannot be
    /// selected automatically.
    Unknown,
    /// A structured `letterN` revision such as `A0` or `C3`.
    Known {
        /// Revision letter, `b'A'..=b'O'` (four bits of letter index).
        letter: u8,
        /// Revision digit, `0..=9`.
        digit: u8,
    },
}

impl Revision {
    /// Build a known revision from its letter and digit.
    pub const fn new(letter: u8, digit: u8) -> Self {
        Revision::Known { letter, digit }
    }

    /// Decode the one-byte nibble encoding. Anything unencodable (zero
    /// byte, digit nibble above 9) comes back as `Unknown`.
    pub fn from_raw(raw: u8) -> Self {
        let letter_index = raw >> 4;
        let digit = raw & 0x0F;
        if letter_index == 0 || digit > 9 {
            Revision::Unknown
        } else {
            Revision::Known {
                letter: b'A' + letter_index - 1,
                digit,
            }
        }
    }

    /// Encode to the one-byte nibble form; `Unknown` encodes as zero.
    pub fn to_raw(self) -> u8 {
        match self {
            Revision::Unknown => 0,
            Revision::Known { letter, digit } => ((letter - b'A' + 1) << 4) | digit,
        }
    }

    /// The peripheral-driver family fitted on this revision, if known.
    ///
    /// Revisions `A` and `B` carry the threshold-monitor analog stack;
    /// `C` and later carry the power monitors.
    pub fn family(self) -> Option<DriverFamily> {
        match self {
            Revision::Unknown => None,
            Revision::Known { letter, .. } if letter <= b'B' => Some(DriverFamily::ThresholdMonitor),
            Revision::Known { .. } => Some(DriverFamily::PowerMonitor),
        }
    }
}

/// Which analog peripheral stack a hardware revision carries.
///
/// Selected once at boot from the configuration record; the dispatcher
/// itself never branches on revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverFamily {
    /// Dedicated threshold-monitor ADCs with hardware alert windows.
    ThresholdMonitor,
    /// PMBus-style power monitors.
    PowerMonitor,
}

/// The decoded configuration record.
///
/// Layout (all integers little-endian):
///
/// | bytes | field |
/// |---|---|
/// | 0 | revision (nibble encoding) |
/// | 1..=16 | serial string |
/// | 17..=20 | FPGA image size |
/// | 21..=36 | FPGA image identifier |
/// | 37..=40 | per-port voltage ceiling, millivolts |
/// | 41..=62 | manufacturer string |
/// | 63 | flags |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceConfig {
    /// Hardware revision tag.
    pub revision: Revision,
    /// Serial number, ASCII, padded with NULs.
    pub serial: [u8; 16],
    /// Size of the FPGA image flashed to the image store, or 0 if none.
    pub image_size: u32,
    /// Opaque identifier of the image the FPGA was last started with.
    pub image_id: [u8; 16],
    /// Per-port output-voltage ceiling in millivolts.
    pub voltage_ceiling: [u16; PORT_COUNT],
    /// Free-form manufacturer string, ASCII, padded with NULs.
    pub manufacturer: [u8; 22],
    /// Bit-flag field reserved for manufacturing options.
    pub flags: u8,
}

impl Default for DeviceConfig {
    /// The safe substitute used when the stored record is absent or
    /// corrupt: unknown revision, sentinel serial, no image.
    fn default() -> Self {
        Self {
            revision: Revision::Unknown,
            serial: SENTINEL_SERIAL,
            image_size: 0,
            image_id: [0; 16],
            voltage_ceiling: [MAX_VOLTAGE_MV; PORT_COUNT],
            manufacturer: [0; 22],
            flags: 0,
        }
    }
}

impl DeviceConfig {
    /// Decode a stored record.
    ///
    /// Byte interpretation itself cannot fail; whether the bytes deserve
    /// to be trusted is decided by the marker logic in
    /// [`ConfigStore::boot`](crate::storage::ConfigStore::boot).
    pub fn decode(raw: &[u8; RECORD_SIZE]) -> Self {
        let mut serial = [0; 16];
        serial.copy_from_slice(&raw[SERIAL]);
        let mut image_id = [0; 16];
        image_id.copy_from_slice(&raw[IMAGE_ID]);
        let mut manufacturer = [0; 22];
        manufacturer.copy_from_slice(&raw[MANUFACTURER]);
        Self {
            revision: Revision::from_raw(raw[REVISION_AT]),
            serial,
            image_size: LittleEndian::read_u32(&raw[IMAGE_SIZE]),
            image_id,
            voltage_ceiling: [
                LittleEndian::read_u16(&raw[CEILING.start..CEILING.start + 2]),
                LittleEndian::read_u16(&raw[CEILING.start + 2..CEILING.end]),
            ],
            manufacturer,
            flags: raw[FLAGS_AT],
        }
    }

    /// Encode the record into its stored form.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut raw = [0; RECORD_SIZE];
        raw[REVISION_AT] = self.revision.to_raw();
        raw[SERIAL].copy_from_slice(&self.serial);
        LittleEndian::write_u32(&mut raw[IMAGE_SIZE], self.image_size);
        raw[IMAGE_ID].copy_from_slice(&self.image_id);
        LittleEndian::write_u16(
            &mut raw[CEILING.start..CEILING.start + 2],
            self.voltage_ceiling[0],
        );
        LittleEndian::write_u16(
            &mut raw[CEILING.start + 2..CEILING.end],
            self.voltage_ceiling[1],
        );
        raw[MANUFACTURER].copy_from_slice(&self.manufacturer);
        raw[FLAGS_AT] = self.flags;
        raw
    }
}

/// A sub-range of the record that can be written back on its own.
///
/// Persisting a change rewrites only the changed field's bytes, not the
/// whole record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigField {
    /// The revision tag byte.
    Revision,
    /// The FPGA image size.
    ImageSize,
    /// The FPGA image identifier.
    ImageId,
    /// Both ports' voltage ceilings.
    VoltageCeiling,
}

impl ConfigField {
    /// Byte range of the field within the encoded record.
    pub fn byte_range(self) -> Range<usize> {
        match self {
            ConfigField::Revision => REVISION_AT..REVISION_AT + 1,
            ConfigField::ImageSize => IMAGE_SIZE,
            ConfigField::ImageId => IMAGE_ID,
            ConfigField::VoltageCeiling => CEILING,
        }
    }
}
