//! Non-volatile storage access and the configuration store.
//!
//! Raw byte I/O with the EEPROMs belongs to the board support code behind
//! [`StorageBank`]; this module owns the marker-driven boot load, the
//! legacy-record migration, and field-granular write back.

use crate::config::{ConfigField, DeviceConfig, RECORD_SIZE};
use crate::error::Error;

/// Boot-marker byte: firmware is present in the control store and the
/// record was loaded into RAM alongside it. Nothing to read.
pub const MARKER_FIRMWARE: u8 = 0xC2;

/// Boot-marker byte: factory state; the record must be read explicitly
/// from its fixed offset.
pub const MARKER_FACTORY: u8 = 0xC0;

/// Boot-marker byte written by [`ConfigStore::boot`] after migrating a
/// legacy record. Firmware that predates the structured revision encoding
/// does not recognise it and substitutes defaults instead of misreading
/// the upgraded record.
pub const MARKER_MIGRATED: u8 = 0xC1;

/// The physical non-volatile stores reachable from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageChip {
    /// The control MCU's boot store. Also holds the configuration record
    /// in its topmost [`RECORD_SIZE`] bytes.
    Control,
    /// Lower half of the FPGA image store.
    ImageLower,
    /// Upper half of the FPGA image store.
    ImageUpper,
}

impl StorageChip {
    /// Resolve the host's logical chip selector.
    pub fn from_selector(selector: u16) -> Result<Self, Error> {
        match selector {
            0 => Ok(StorageChip::Control),
            1 => Ok(StorageChip::ImageLower),
            2 => Ok(StorageChip::ImageUpper),
            _ => Err(Error::UnknownStorageChip(selector)),
        }
    }
}

/// Byte-level access to the non-volatile stores.
///
/// Implementations perform the actual I2C EEPROM transactions. Writes are
/// issued by callers in runs that never cross a page boundary of the
/// addressed chip, as reported by [`page_size`](Self::page_size).
pub trait StorageBank {
    /// Read `buf.len()` bytes starting at `address`.
    fn read(&mut self, chip: StorageChip, address: u16, buf: &mut [u8]) -> Result<(), Error>;
    /// Write `data` starting at `address`.
    fn write(&mut self, chip: StorageChip, address: u16, data: &[u8]) -> Result<(), Error>;
    /// The chip's write-page size in bytes.
    fn page_size(&self, chip: StorageChip) -> usize;
    /// The chip's total capacity in bytes.
    fn capacity(&self, chip: StorageChip) -> usize;
}

/// The in-memory configuration record and its write-back logic.
///
/// The record lives in the topmost [`RECORD_SIZE`] bytes of the control
/// store. After boot the in-memory copy is authoritative: a failed
/// persist latches an error for the host but never rolls the value back.
#[derive(Debug)]
pub struct ConfigStore {
    /// The active configuration record.
    pub record: DeviceConfig,
}

impl ConfigStore {
    /// Load the record at boot.
    ///
    /// The marker byte at address 0 of the control store picks the path:
    /// [`MARKER_FIRMWARE`] means `shadow` (the copy loaded with the
    /// firmware image) is already current; [`MARKER_FACTORY`] and
    /// [`MARKER_MIGRATED`] mean the record is read from its fixed offset;
    /// any other value, or a failed read, substitutes the safe defaults so
    /// the rest of the system never observes an invalid record. First
    /// boot of a blank device is expected, so defaulting is silent.
    ///
    /// A factory record whose revision byte still uses the legacy ASCII
    /// tag is migrated forward in place before use.
    pub fn boot<S: StorageBank>(bank: &mut S, shadow: DeviceConfig) -> Self {
        let mut marker = [0u8];
        if bank.read(StorageChip::Control, 0, &mut marker).is_err() {
            debug!("config: marker unreadable, using defaults");
            return Self {
                record: DeviceConfig::default(),
            };
        }

        match marker[0] {
            MARKER_FIRMWARE => Self { record: shadow },
            MARKER_FACTORY | MARKER_MIGRATED => {
                let offset = Self::record_offset(bank);
                let mut raw = [0u8; RECORD_SIZE];
                if bank.read(StorageChip::Control, offset, &mut raw).is_err() {
                    debug!("config: record unreadable, using defaults");
                    return Self {
                        record: DeviceConfig::default(),
                    };
                }
                let mut store = Self {
                    record: DeviceConfig::decode(&raw),
                };
                // Legacy factory tags only ever reached the early letters,
                // so the detector stops short of 'P' (0x50): structured
                // encodings from 0x50 up (revision E and later) pass
                // through untouched even behind the factory marker.
                if marker[0] == MARKER_FACTORY && (b'A'..=b'O').contains(&raw[0]) {
                    store.migrate(bank, raw[0]);
                }
                store
            }
            other => {
                debug!("config: unknown marker {=u8:x}, using defaults", other);
                Self {
                    record: DeviceConfig::default(),
                }
            }
        }
    }

    /// Rewrite a legacy ASCII revision tag in the structured encoding.
    ///
    /// Upgrades only ever move forward; a record already in the nibble
    /// encoding is never touched. The marker is rewritten last so an
    /// interrupted migration is retried on the next boot. Write failures
    /// are tolerated here: the migrated in-memory record is used either
    /// way and the next boot gets another attempt.
    fn migrate<S: StorageBank>(&mut self, bank: &mut S, legacy_tag: u8) {
        use crate::config::Revision;

        info!("config: migrating legacy revision tag {=u8:x}", legacy_tag);
        self.record.revision = Revision::new(legacy_tag, 0);
        if self.persist(bank, ConfigField::Revision).is_err() {
            warn!("config: migration write failed, retrying next boot");
            return;
        }
        if bank
            .write(StorageChip::Control, 0, &[MARKER_MIGRATED])
            .is_err()
        {
            warn!("config: marker rewrite failed, retrying next boot");
        }
    }

    /// Write one field of the record back to the control store.
    ///
    /// Only the field's bytes are rewritten, in runs that respect the
    /// chip's write-page boundaries. On failure the in-memory value is
    /// left standing; the caller decides whether to latch an error.
    pub fn persist<S: StorageBank>(&self, bank: &mut S, field: ConfigField) -> Result<(), Error> {
        let raw = self.record.encode();
        let range = field.byte_range();
        let page = bank.page_size(StorageChip::Control);
        let base = Self::record_offset(bank);

        let mut address = base as usize + range.start;
        let mut data = &raw[range];
        while !data.is_empty() {
            let run = (page - address % page).min(data.len());
            bank.write(StorageChip::Control, address as u16, &data[..run])?;
            address += run;
            data = &data[run..];
        }
        Ok(())
    }

    fn record_offset<S: StorageBank>(bank: &S) -> u16 {
        (bank.capacity(StorageChip::Control) - RECORD_SIZE) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Revision;

    /// Vec-backed bank with a fallible control store.
    struct MemBank {
        control: Vec<u8>,
        image: Vec<u8>,
        fail_reads: bool,
        writes: Vec<(u16, usize)>,
    }

    impl MemBank {
        fn new() -> Self {
            Self {
                control: vec![0xFF; 8192],
                image: vec![0xFF; 65536],
                fail_reads: false,
                writes: Vec::new(),
            }
        }

        fn with_record(marker: u8, record: &DeviceConfig) -> Self {
            let mut bank = Self::new();
            bank.control[0] = marker;
            bank.control[8192 - RECORD_SIZE..].copy_from_slice(&record.encode());
            bank
        }
    }

    impl StorageBank for MemBank {
        fn read(&mut self, chip: StorageChip, address: u16, buf: &mut [u8]) -> Result<(), Error> {
            if self.fail_reads {
                return Err(Error::Storage);
            }
            let store = match chip {
                StorageChip::Control => &self.control,
                _ => &self.image,
            };
            let at = address as usize;
            buf.copy_from_slice(&store[at..at + buf.len()]);
            Ok(())
        }

        fn write(&mut self, chip: StorageChip, address: u16, data: &[u8]) -> Result<(), Error> {
            let store = match chip {
                StorageChip::Control => &mut self.control,
                _ => &mut self.image,
            };
            let at = address as usize;
            store[at..at + data.len()].copy_from_slice(data);
            self.writes.push((address, data.len()));
            Ok(())
        }

        fn page_size(&self, _chip: StorageChip) -> usize {
            32
        }

        fn capacity(&self, chip: StorageChip) -> usize {
            match chip {
                StorageChip::Control => self.control.len(),
                _ => self.image.len(),
            }
        }
    }

    /// A factory marker reads the record from the fixed offset.
    #[test]
    fn boot_reads_factory_record() {
        let stored = DeviceConfig {
            revision: Revision::new(b'C', 1),
            voltage_ceiling: [3300, 1800],
            ..DeviceConfig::default()
        };
        let mut bank = MemBank::with_record(MARKER_FACTORY, &stored);
        let store = ConfigStore::boot(&mut bank, DeviceConfig::default());
        assert_eq!(store.record, stored);
    }

    /// A firmware-present marker trusts the RAM shadow and reads nothing
    /// further.
    #[test]
    fn boot_uses_shadow_when_firmware_present() {
        let shadow = DeviceConfig {
            revision: Revision::new(b'B', 0),
            ..DeviceConfig::default()
        };
        let mut bank = MemBank::new();
        bank.control[0] = MARKER_FIRMWARE;
        let store = ConfigStore::boot(&mut bank, shadow);
        assert_eq!(store.record, shadow);
    }

    /// An unknown marker or an unreadable store substitutes defaults.
    #[test]
    fn boot_defaults_on_corruption() {
        let mut blank = MemBank::new();
        let store = ConfigStore::boot(&mut blank, DeviceConfig::default());
        assert_eq!(store.record, DeviceConfig::default());

        let mut broken = MemBank::new();
        broken.fail_reads = true;
        let store = ConfigStore::boot(&mut broken, DeviceConfig::default());
        assert_eq!(store.record, DeviceConfig::default());
    }

    /// A legacy ASCII revision tag is rewritten in the nibble encoding
    /// and the old marker is invalidated so older firmware defaults
    /// rather than misreads.
    #[test]
    fn boot_migrates_legacy_revision() {
        let mut raw = DeviceConfig::default().encode();
        raw[0] = b'B';
        let mut bank = MemBank::new();
        bank.control[0] = MARKER_FACTORY;
        bank.control[8192 - RECORD_SIZE..].copy_from_slice(&raw);

        let store = ConfigStore::boot(&mut bank, DeviceConfig::default());
        assert_eq!(store.record.revision, Revision::new(b'B', 0));
        assert_eq!(bank.control[0], MARKER_MIGRATED);
        assert_eq!(bank.control[8192 - RECORD_SIZE], 0x20);

        // Forward only: booting again must not touch the record.
        bank.writes.clear();
        let again = ConfigStore::boot(&mut bank, DeviceConfig::default());
        assert_eq!(again.record.revision, Revision::new(b'B', 0));
        assert!(bank.writes.is_empty());
    }

    /// A structured revision whose byte happens to land in ASCII (E3
    /// encodes as 0x53, the letter 'S') must not be mistaken for a
    /// legacy tag behind the factory marker.
    #[test]
    fn boot_keeps_structured_revision_behind_factory_marker() {
        let stored = DeviceConfig {
            revision: Revision::new(b'E', 3),
            ..DeviceConfig::default()
        };
        let mut bank = MemBank::with_record(MARKER_FACTORY, &stored);

        let store = ConfigStore::boot(&mut bank, DeviceConfig::default());
        assert_eq!(store.record.revision, Revision::new(b'E', 3));
        assert_eq!(bank.control[0], MARKER_FACTORY);
        assert!(bank.writes.is_empty());
    }

    /// Persisting a field writes only that field's bytes.
    #[test]
    fn persist_writes_only_the_field() {
        let record = DeviceConfig::default();
        let mut bank = MemBank::with_record(MARKER_FACTORY, &record);
        let mut store = ConfigStore::boot(&mut bank, DeviceConfig::default());

        bank.writes.clear();
        store.record.voltage_ceiling = [1800, 5500];
        store
            .persist(&mut bank, ConfigField::VoltageCeiling)
            .unwrap();

        let base = 8192 - RECORD_SIZE as u16;
        assert_eq!(bank.writes, vec![(base + 37, 4)]);
        let reload = ConfigStore::boot(&mut bank, DeviceConfig::default());
        assert_eq!(reload.record.voltage_ceiling, [1800, 5500]);
    }

    /// Writes that straddle a page boundary are split at the boundary.
    #[test]
    fn persist_respects_page_boundaries() {
        // Record starts at 8128; the image-id field spans 8149..8165,
        // crossing the 32-byte page boundary at 8160.
        let record = DeviceConfig::default();
        let mut bank = MemBank::with_record(MARKER_FACTORY, &record);
        let mut store = ConfigStore::boot(&mut bank, DeviceConfig::default());

        bank.writes.clear();
        store.record.image_id = [0x5A; 16];
        store.persist(&mut bank, ConfigField::ImageId).unwrap();
        assert_eq!(bank.writes, vec![(8149, 11), (8160, 5)]);
    }
}
