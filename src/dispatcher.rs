//! The command dispatcher and safety supervisor main loop.
//!
//! [`Device`] owns all mutable device state (status latch, configuration
//! store, FPGA channel state) and runs it single-threaded: interrupt
//! handlers only flip [`Signals`] flags, and [`Device::poll`] drains
//! them from the main loop. Hardware access goes through the [`Board`]
//! trait, so the whole dispatcher runs unchanged against mocks on the
//! host.

use crate::alert::Signals;
use crate::analog::{
    AlertWindow, AnalogPorts, MAX_VOLTAGE_MV, MIN_VOLTAGE_MV, Port, PortMask, PullState,
};
use crate::commands::{ControlPipe, ControlRequest, Direction, MAX_CHUNK, RequestCode};
use crate::config::{ConfigField, DeviceConfig};
use crate::error::Error;
use crate::fpga::{ConfigLink, FpgaChannel, MAX_LOAD_CHUNK, RegisterBus};
use crate::status::{Indicators, StatusLatch};
use crate::storage::{ConfigStore, StorageBank, StorageChip};

/// Protocol compatibility level reported to the host.
///
/// Bumped whenever a request changes incompatibly, so host software can
/// refuse to drive firmware it does not understand.
pub const API_LEVEL: u8 = 1;

/// Everything the dispatcher needs from the hardware.
///
/// Board support code implements this once per board; the associated
/// types keep each peripheral mockable on its own.
pub trait Board {
    /// The non-volatile storage bank.
    type Storage: StorageBank;
    /// The FPGA configuration link and register bus.
    type Link: ConfigLink + RegisterBus;
    /// The analog port peripherals.
    type Ports: AnalogPorts;
    /// The USB control endpoint.
    type Control: ControlPipe;
    /// The status indicator LEDs.
    type Leds: Indicators;

    /// The non-volatile storage bank.
    fn storage(&mut self) -> &mut Self::Storage;
    /// The FPGA configuration link and register bus.
    fn link(&mut self) -> &mut Self::Link;
    /// The analog port peripherals.
    fn ports(&mut self) -> &mut Self::Ports;
    /// The USB control endpoint.
    fn control(&mut self) -> &mut Self::Control;
    /// The status indicator LEDs.
    fn leds(&mut self) -> &mut Self::Leds;
    /// Mask or unmask the alert-line interrupt at the pin level.
    fn set_alert_detection(&mut self, enabled: bool);
    /// The configuration record loaded into RAM by the boot ROM, used
    /// when the store carries the firmware-present marker.
    fn config_shadow(&self) -> DeviceConfig;
}

/// The device's single-threaded core.
pub struct Device<'a, B: Board> {
    board: B,
    signals: &'a Signals,
    status: StatusLatch,
    store: ConfigStore,
    channel: FpgaChannel,
    last_index: u16,
}

impl<'a, B: Board> Device<'a, B> {
    /// Bring the device up: load the configuration record, take the
    /// FPGA's current readiness as the status baseline and light the
    /// LEDs accordingly.
    ///
    /// The FPGA may already be running at this point, when a warm
    /// restart re-entered the firmware without a power cycle.
    pub fn new(mut board: B, signals: &'a Signals) -> Self {
        let shadow = board.config_shadow();
        let store = ConfigStore::boot(board.storage(), shadow);
        let ready = board.link().is_ready();
        let mut status = StatusLatch::new();
        status.set_fpga_ready(ready);
        let mut device = Device {
            board,
            signals,
            status,
            store,
            channel: FpgaChannel::new(ready),
            last_index: 0,
        };
        device.sync_leds();
        device
    }

    /// The board, for interrupt wiring and endpoint service.
    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    /// The active configuration record.
    pub fn config(&self) -> &DeviceConfig {
        &self.store.record
    }

    /// Run one main-loop iteration: handle a tripped alert first, then
    /// at most one admitted control request.
    ///
    /// Admission stays closed until the request has fully completed, so
    /// a request that arrives mid-processing is held off rather than
    /// interleaved.
    pub fn poll(&mut self) {
        if self.signals.take_trip() {
            self.handle_alert_trip();
        }
        if self.signals.command_pending() {
            self.process_command();
            self.signals.finish_command();
        }
    }

    fn process_command(&mut self) {
        let setup = self.board.control().setup();
        let outcome = match ControlRequest::parse(&setup) {
            Ok(request) => self.execute(request),
            Err(error) => Err(error),
        };
        if let Err(error) = outcome {
            warn!("request failed: {}", error);
            if !error.is_protocol() {
                self.status.raise_error();
                self.sync_leds();
            }
            self.board.control().reject();
        }
    }

    fn execute(&mut self, request: ControlRequest) -> Result<(), Error> {
        debug!(
            "request {} value {=u16:x} index {=u16:x} length {=u16}",
            request.code, request.value, request.index, request.length
        );
        match request.code {
            RequestCode::NvStorage => {
                let chip = StorageChip::from_selector(request.index)?;
                self.nv_storage(request, chip)
            }
            RequestCode::LegacyStorage => self.nv_storage(request, StorageChip::Control),
            RequestCode::FpgaConfig => self.fpga_config(request),
            RequestCode::Status => self.report_status(request),
            RequestCode::FpgaRegister => self.fpga_register(request),
            RequestCode::Voltage => self.voltage(request),
            RequestCode::SenseVoltage => self.sense_voltage(request),
            RequestCode::AlertWindow => self.alert_window(request),
            RequestCode::PollAlert => self.poll_alert(request),
            RequestCode::ImageId => self.image_id(request),
            RequestCode::BufferEnable => self.buffer_enable(request),
            RequestCode::VoltageCeiling => self.voltage_ceiling(request),
            RequestCode::Pull => self.pull(request),
            RequestCode::ApiLevel => self.api_level(request),
        }
    }

    /// Raw storage access, `value` as the start address. Long transfers
    /// stream through the endpoint in [`MAX_CHUNK`] pieces.
    fn nv_storage(&mut self, request: ControlRequest, chip: StorageChip) -> Result<(), Error> {
        let mut address = request.value;
        let mut remaining = request.length as usize;
        let mut buffer = [0u8; MAX_CHUNK];
        while remaining > 0 {
            let run = remaining.min(MAX_CHUNK);
            match request.direction {
                Direction::Out => {
                    self.board.control().read(&mut buffer[..run])?;
                    self.board.storage().write(chip, address, &buffer[..run])?;
                }
                Direction::In => {
                    self.board.storage().read(chip, address, &mut buffer[..run])?;
                    self.board.control().write(&buffer[..run])?;
                }
            }
            address = address.wrapping_add(run as u16);
            remaining -= run;
        }
        self.board.control().accept();
        Ok(())
    }

    /// Bitstream loading. A zero-length request starts the FPGA; data
    /// requests carry `index` as a sequence number so a dropped transfer
    /// cannot silently corrupt the bitstream.
    fn fpga_config(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_direction(Direction::Out)?;
        if request.length == 0 {
            let started = self.channel.start(self.board.link())?;
            self.status.set_fpga_ready(started);
            if !started {
                self.status.raise_error();
            }
            self.sync_leds();
            self.board.control().accept();
            return Ok(());
        }

        if request.index == 0 {
            self.status.set_fpga_ready(false);
            self.sync_leds();
            self.channel.begin(self.board.link())?;
            // The running image is gone. Invalidate its identifier now so
            // a reset mid-load cannot leave a stale one behind.
            self.store.record.image_id = [0; 16];
            if let Err(error) = self.store.persist(self.board.storage(), ConfigField::ImageId) {
                warn!("image id invalidation failed: {}", error);
                self.status.raise_error();
                self.sync_leds();
            }
        } else {
            let expected = self.last_index.wrapping_add(1);
            if request.index != expected {
                return Err(Error::BadChunkIndex {
                    expected,
                    received: request.index,
                });
            }
        }

        let mut remaining = request.length as usize;
        let mut buffer = [0u8; MAX_LOAD_CHUNK];
        while remaining > 0 {
            let run = remaining.min(MAX_LOAD_CHUNK);
            self.board.control().read(&mut buffer[..run])?;
            self.channel.load(self.board.link(), &buffer[..run])?;
            remaining -= run;
        }
        self.last_index = request.index;
        self.board.control().accept();
        Ok(())
    }

    fn report_status(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_direction(Direction::In)?;
        request.expect_length(1)?;
        let report = self.status.snapshot();
        self.sync_leds();
        self.board.control().write(&[report])?;
        self.board.control().accept();
        Ok(())
    }

    /// Register-bus access to a started FPGA, `value` as the register
    /// address. Single transfer of at most [`MAX_CHUNK`] bytes.
    fn fpga_register(&mut self, request: ControlRequest) -> Result<(), Error> {
        if !self.channel.is_started() {
            return Err(Error::FpgaNotStarted);
        }
        let run = request.length as usize;
        if run > MAX_CHUNK {
            return Err(Error::BadLength);
        }
        let register = request.value as u8;
        let mut buffer = [0u8; MAX_CHUNK];
        match request.direction {
            Direction::Out => {
                self.board.control().read(&mut buffer[..run])?;
                let link = self.board.link();
                link.select(register)?;
                link.write(&buffer[..run])?;
            }
            Direction::In => {
                let link = self.board.link();
                link.select(register)?;
                link.read(&mut buffer[..run])?;
                self.board.control().write(&buffer[..run])?;
            }
        }
        self.board.control().accept();
        Ok(())
    }

    /// Output voltage set/get in millivolts, `index` as the port mask.
    /// Sets are checked against each selected port's ceiling before any
    /// hardware is touched.
    fn voltage(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_length(2)?;
        match request.direction {
            Direction::Out => {
                let ports = PortMask::from_wire(request.index)?;
                let mut raw = [0u8; 2];
                self.board.control().read(&mut raw)?;
                let millivolts = u16::from_le_bytes(raw);
                if millivolts != 0 {
                    if !(MIN_VOLTAGE_MV..=MAX_VOLTAGE_MV).contains(&millivolts) {
                        return Err(Error::VoltageOutOfRange(millivolts));
                    }
                    for port in ports.iter() {
                        let ceiling = self.store.record.voltage_ceiling[port.index()];
                        if millivolts > ceiling {
                            return Err(Error::AboveCeiling {
                                requested: millivolts,
                                ceiling,
                            });
                        }
                    }
                }
                self.board.ports().set_voltage(ports, millivolts)?;
                self.board.control().accept();
                Ok(())
            }
            Direction::In => {
                let port = Port::from_selector(request.index)?;
                let millivolts = self.board.ports().get_voltage(port)?;
                self.board.control().write(&millivolts.to_le_bytes())?;
                self.board.control().accept();
                Ok(())
            }
        }
    }

    fn sense_voltage(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_direction(Direction::In)?;
        request.expect_length(2)?;
        let port = Port::from_selector(request.index)?;
        let millivolts = self.board.ports().measure_voltage(port)?;
        self.board.control().write(&millivolts.to_le_bytes())?;
        self.board.control().accept();
        Ok(())
    }

    /// Alert window set/get as two little-endian millivolt levels,
    /// `index` as the port mask (set) or port selector (get).
    fn alert_window(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_length(4)?;
        match request.direction {
            Direction::Out => {
                let ports = PortMask::from_wire(request.index)?;
                let mut raw = [0u8; 4];
                self.board.control().read(&mut raw)?;
                let window = AlertWindow {
                    low_mv: u16::from_le_bytes([raw[0], raw[1]]),
                    high_mv: u16::from_le_bytes([raw[2], raw[3]]),
                };
                self.board.ports().set_alert_window(ports, window)?;
                self.board.control().accept();
                Ok(())
            }
            Direction::In => {
                let port = Port::from_selector(request.index)?;
                let window = self.board.ports().get_alert_window(port)?;
                let mut raw = [0u8; 4];
                raw[..2].copy_from_slice(&window.low_mv.to_le_bytes());
                raw[2..].copy_from_slice(&window.high_mv.to_le_bytes());
                self.board.control().write(&raw)?;
                self.board.control().accept();
                Ok(())
            }
        }
    }

    /// Report which ports alerted, release their latches and
    /// acknowledge the sticky ALERT status bit.
    fn poll_alert(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_direction(Direction::In)?;
        request.expect_length(1)?;
        let alerted = self.board.ports().poll_alert()?;
        self.board.ports().clear_alert(alerted)?;
        self.status.acknowledge_alert();
        self.sync_leds();
        self.board.control().write(&[alerted.bits()])?;
        self.board.control().accept();
        Ok(())
    }

    /// Image identifier get/set. Writing is only meaningful after a
    /// successful configuration, so it is gated on a started FPGA.
    fn image_id(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_length(16)?;
        match request.direction {
            Direction::Out => {
                if !self.channel.is_started() {
                    return Err(Error::FpgaNotStarted);
                }
                let mut id = [0u8; 16];
                self.board.control().read(&mut id)?;
                self.store.record.image_id = id;
                self.store.persist(self.board.storage(), ConfigField::ImageId)?;
                self.board.control().accept();
                Ok(())
            }
            Direction::In => {
                let id = self.store.record.image_id;
                self.board.control().write(&id)?;
                self.board.control().accept();
                Ok(())
            }
        }
    }

    /// Output buffer toggle; the flag rides in `value`, no data phase.
    fn buffer_enable(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_direction(Direction::Out)?;
        request.expect_length(0)?;
        self.board.ports().enable_buffers(request.value != 0)?;
        self.board.control().accept();
        Ok(())
    }

    /// Per-port voltage-ceiling get/set. Lowering a ceiling below the
    /// port's current output forces the output down first, so the limit
    /// is never violated even transiently.
    fn voltage_ceiling(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_length(2)?;
        match request.direction {
            Direction::Out => {
                let ports = PortMask::from_wire(request.index)?;
                let mut raw = [0u8; 2];
                self.board.control().read(&mut raw)?;
                let ceiling = u16::from_le_bytes(raw);
                if ceiling != 0 && !(MIN_VOLTAGE_MV..=MAX_VOLTAGE_MV).contains(&ceiling) {
                    return Err(Error::VoltageOutOfRange(ceiling));
                }
                for port in ports.iter() {
                    let current = self.board.ports().get_voltage(port)?;
                    if current > ceiling {
                        self.board.ports().set_voltage(port.mask(), ceiling)?;
                    }
                    self.store.record.voltage_ceiling[port.index()] = ceiling;
                }
                self.store
                    .persist(self.board.storage(), ConfigField::VoltageCeiling)?;
                self.board.control().accept();
                Ok(())
            }
            Direction::In => {
                let port = Port::from_selector(request.index)?;
                let ceiling = self.store.record.voltage_ceiling[port.index()];
                self.board.control().write(&ceiling.to_le_bytes())?;
                self.board.control().accept();
                Ok(())
            }
        }
    }

    fn pull(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_length(2)?;
        let port = Port::from_selector(request.index)?;
        match request.direction {
            Direction::Out => {
                let mut raw = [0u8; 2];
                self.board.control().read(&mut raw)?;
                let pull = PullState {
                    enabled: raw[0],
                    level: raw[1],
                };
                self.board.ports().set_pull(port, pull)?;
                self.board.control().accept();
                Ok(())
            }
            Direction::In => {
                let pull = self.board.ports().get_pull(port)?;
                self.board.control().write(&[pull.enabled, pull.level])?;
                self.board.control().accept();
                Ok(())
            }
        }
    }

    fn api_level(&mut self, request: ControlRequest) -> Result<(), Error> {
        request.expect_direction(Direction::In)?;
        request.expect_length(1)?;
        self.board.control().write(&[API_LEVEL])?;
        self.board.control().accept();
        Ok(())
    }

    /// React to an asserted alert line: cut power to the offending
    /// ports, latch the sticky ALERT bit and re-arm detection.
    ///
    /// The monitors' own latches are left set; the host reads and
    /// releases them through the poll-alert request.
    fn handle_alert_trip(&mut self) {
        let alerted = match self.board.ports().poll_alert() {
            // The line asserted but no monitor owns up (or we cannot
            // ask): assume the worst and cut every port.
            Ok(mask) if mask.is_empty() => PortMask::ALL,
            Ok(mask) => mask,
            Err(_) => PortMask::ALL,
        };
        warn!("alert tripped, cutting ports {=u8:b}", alerted.bits());
        if self.board.ports().set_voltage(alerted, 0).is_err() {
            self.status.raise_error();
        }
        self.status.raise_alert();
        self.sync_leds();
        self.signals.rearm();
        self.board.set_alert_detection(true);
    }

    fn sync_leds(&mut self) {
        let fault = self.status.error() || self.status.alert();
        let fpga = self.status.fpga_ready();
        let leds = self.board.leds();
        leds.set_fault(fault);
        leds.set_fpga(fpga);
    }
}
