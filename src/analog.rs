//! Analog port control: voltages, alert windows, pull resistors.
//!
//! The dispatcher and the safety supervisor talk to the hardware through
//! the [`AnalogPorts`] trait with millivolt-level semantics. Two
//! peripheral stacks implement it; [`PortDriver`] selects one at boot
//! from the configuration record's hardware revision.

pub mod monitor;
pub mod power_monitor;
pub mod pull;
pub mod regulator;

use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::I2c;

use crate::config::{DriverFamily, Revision};
use crate::error::Error;
use monitor::ThresholdMonitor;
use power_monitor::PowerMonitor;
use pull::PullExpander;
use regulator::RailRegulator;

/// Number of independently powered I/O ports.
pub const PORT_COUNT: usize = 2;

/// Lowest programmable output voltage in millivolts.
pub const MIN_VOLTAGE_MV: u16 = 1650;

/// Highest programmable output voltage in millivolts.
pub const MAX_VOLTAGE_MV: u16 = 5500;

/// One of the tool's I/O ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Port {
    /// Port A.
    A,
    /// Port B.
    B,
}

impl Port {
    /// Both ports, in mask-bit order.
    pub const ALL: [Port; PORT_COUNT] = [Port::A, Port::B];

    /// Index into per-port arrays (and the record's ceiling field).
    pub fn index(self) -> usize {
        match self {
            Port::A => 0,
            Port::B => 1,
        }
    }

    /// The single-port mask for this port.
    pub fn mask(self) -> PortMask {
        PortMask(1 << self.index())
    }

    /// Resolve a wire selector that must name exactly one port.
    pub fn from_selector(selector: u16) -> Result<Self, Error> {
        PortMask::from_wire(selector)?
            .single()
            .ok_or(Error::UnknownPort(selector as u8))
    }
}

/// A set of ports, one bit per port (bit 0 = A, bit 1 = B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortMask(u8);

impl PortMask {
    /// No ports.
    pub const NONE: PortMask = PortMask(0);
    /// Every port.
    pub const ALL: PortMask = PortMask((1 << PORT_COUNT) - 1);

    /// Decode a wire mask, rejecting bits beyond the fitted ports.
    pub fn from_wire(raw: u16) -> Result<Self, Error> {
        if raw & !(Self::ALL.0 as u16) != 0 {
            Err(Error::UnknownPort(raw as u8))
        } else {
            Ok(PortMask(raw as u8))
        }
    }

    /// The raw mask bits as reported to the host.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether no port is selected.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether `port` is in the set.
    pub fn contains(self, port: Port) -> bool {
        self.0 & port.mask().0 != 0
    }

    /// Add `port` to the set.
    pub fn insert(&mut self, port: Port) {
        self.0 |= port.mask().0;
    }

    /// The ports in the set, in mask-bit order.
    pub fn iter(self) -> impl Iterator<Item = Port> {
        Port::ALL.into_iter().filter(move |port| self.contains(*port))
    }

    /// The contained port if exactly one is selected.
    pub fn single(self) -> Option<Port> {
        let mut ports = self.iter();
        match (ports.next(), ports.next()) {
            (Some(port), None) => Some(port),
            _ => None,
        }
    }
}

/// An over/under-voltage alert window in millivolts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlertWindow {
    /// Under-voltage limit; alerts below this level.
    pub low_mv: u16,
    /// Over-voltage limit; alerts above this level.
    pub high_mv: u16,
}

impl AlertWindow {
    /// The canonical "alerting disabled" window: nothing is below 0 and
    /// nothing legal is above the maximum voltage.
    pub const DISABLED: AlertWindow = AlertWindow {
        low_mv: 0,
        high_mv: MAX_VOLTAGE_MV,
    };

    /// Whether this is the disabled sentinel.
    pub fn is_disabled(&self) -> bool {
        *self == Self::DISABLED
    }
}

/// Pull-resistor state for the eight lines of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PullState {
    /// Which lines have their pull resistor connected, one bit per line.
    pub enabled: u8,
    /// Pull direction per line: 1 pulls up, 0 pulls down.
    pub level: u8,
}

/// The analog peripheral operations the dispatcher and safety supervisor
/// rely on.
///
/// Millivolt values are clamped by implementations to the device range
/// [`MIN_VOLTAGE_MV`]..=[`MAX_VOLTAGE_MV`]; 0 is the canonical "output
/// disabled" sentinel, distinct from any real measurement. Voltage
/// ceilings are *not* enforced here; the dispatcher owns the record and
/// checks them before calling in.
pub trait AnalogPorts {
    /// Program the output voltage of every port in `ports`. 0 disables
    /// the outputs.
    fn set_voltage(&mut self, ports: PortMask, millivolts: u16) -> Result<(), Error>;
    /// The commanded output voltage of `port`; 0 when disabled.
    fn get_voltage(&mut self, port: Port) -> Result<u16, Error>;
    /// Measure the actual rail voltage of `port`.
    fn measure_voltage(&mut self, port: Port) -> Result<u16, Error>;
    /// Program the alert window of every port in `ports`.
    fn set_alert_window(&mut self, ports: PortMask, window: AlertWindow) -> Result<(), Error>;
    /// The alert window of `port`; the disabled sentinel when alerting
    /// is off.
    fn get_alert_window(&mut self, port: Port) -> Result<AlertWindow, Error>;
    /// Which ports are currently alerting. Non-destructive: the alert
    /// state survives for [`clear_alert`](Self::clear_alert).
    fn poll_alert(&mut self) -> Result<PortMask, Error>;
    /// Release the alert state of every port in `ports` and re-arm their
    /// alert outputs.
    fn clear_alert(&mut self, ports: PortMask) -> Result<(), Error>;
    /// Program the pull resistors of `port`.
    fn set_pull(&mut self, port: Port, pull: PullState) -> Result<(), Error>;
    /// The pull-resistor state of `port`.
    fn get_pull(&mut self, port: Port) -> Result<PullState, Error>;
    /// Enable or disable the output buffers.
    fn enable_buffers(&mut self, on: bool) -> Result<(), Error>;
}

/// The monitor variant fitted on a board.
enum MonitorKind {
    Threshold(ThresholdMonitor),
    Power(PowerMonitor),
}

/// Production [`AnalogPorts`] implementation over one shared I2C bus.
///
/// Combines the DAC-programmed regulators, the revision's voltage
/// monitors and the pull-resistor expanders. The monitor variant is the
/// only revision-dependent part; everything else is common across
/// hardware revisions.
pub struct PortDriver<B, EN, BUF> {
    bus: B,
    regulator: RailRegulator<EN>,
    monitor: MonitorKind,
    pull: PullExpander,
    buffers: BUF,
}

impl<B, EN, BUF> PortDriver<B, EN, BUF>
where
    B: I2c,
    EN: OutputPin,
    BUF: OutputPin,
{
    /// Build the driver stack for a known hardware revision, or `None`
    /// when the revision (and so the fitted monitor) is unknown.
    ///
    /// `enable` are the per-port regulator enable lines and `buffers`
    /// the active-low output-buffer enable line.
    pub fn for_revision(
        revision: Revision,
        bus: B,
        enable: [EN; PORT_COUNT],
        buffers: BUF,
    ) -> Option<Self> {
        let monitor = match revision.family()? {
            DriverFamily::ThresholdMonitor => MonitorKind::Threshold(ThresholdMonitor::new()),
            DriverFamily::PowerMonitor => MonitorKind::Power(PowerMonitor::new()),
        };
        Some(Self {
            bus,
            regulator: RailRegulator::new(enable),
            monitor,
            pull: PullExpander::new(),
            buffers,
        })
    }
}

impl<B, EN, BUF> AnalogPorts for PortDriver<B, EN, BUF>
where
    B: I2c,
    EN: OutputPin,
    BUF: OutputPin,
{
    fn set_voltage(&mut self, ports: PortMask, millivolts: u16) -> Result<(), Error> {
        self.regulator.set_voltage(&mut self.bus, ports, millivolts)
    }

    fn get_voltage(&mut self, port: Port) -> Result<u16, Error> {
        self.regulator.get_voltage(&mut self.bus, port)
    }

    fn measure_voltage(&mut self, port: Port) -> Result<u16, Error> {
        match &mut self.monitor {
            MonitorKind::Threshold(monitor) => monitor.measure(&mut self.bus, port),
            MonitorKind::Power(monitor) => monitor.measure(&mut self.bus, port),
        }
    }

    fn set_alert_window(&mut self, ports: PortMask, window: AlertWindow) -> Result<(), Error> {
        match &mut self.monitor {
            MonitorKind::Threshold(monitor) => monitor.set_window(&mut self.bus, ports, window),
            MonitorKind::Power(monitor) => monitor.set_window(&mut self.bus, ports, window),
        }
    }

    fn get_alert_window(&mut self, port: Port) -> Result<AlertWindow, Error> {
        match &mut self.monitor {
            MonitorKind::Threshold(monitor) => monitor.get_window(&mut self.bus, port),
            MonitorKind::Power(monitor) => monitor.get_window(&mut self.bus, port),
        }
    }

    fn poll_alert(&mut self) -> Result<PortMask, Error> {
        match &mut self.monitor {
            MonitorKind::Threshold(monitor) => monitor.poll(&mut self.bus),
            MonitorKind::Power(monitor) => monitor.poll(&mut self.bus),
        }
    }

    fn clear_alert(&mut self, ports: PortMask) -> Result<(), Error> {
        match &mut self.monitor {
            MonitorKind::Threshold(monitor) => monitor.clear(&mut self.bus, ports),
            MonitorKind::Power(monitor) => monitor.clear(&mut self.bus, ports),
        }
    }

    fn set_pull(&mut self, port: Port, pull: PullState) -> Result<(), Error> {
        self.pull.set(&mut self.bus, port, pull)
    }

    fn get_pull(&mut self, port: Port) -> Result<PullState, Error> {
        self.pull.get(&mut self.bus, port)
    }

    fn enable_buffers(&mut self, on: bool) -> Result<(), Error> {
        // The output-enable line is active low.
        let result = if on {
            self.buffers.set_low()
        } else {
            self.buffers.set_high()
        };
        result.map_err(|_| Error::Pin)
    }
}

#[cfg(test)]
pub(crate) mod testbus {
    use std::collections::VecDeque;

    use embedded_hal::i2c::{ErrorType, I2c, Operation};

    /// Scripted I2C bus: records every write and serves reads from a
    /// prepared queue.
    #[derive(Default)]
    pub(crate) struct BusLog {
        pub(crate) writes: Vec<(u8, Vec<u8>)>,
        pub(crate) replies: VecDeque<Vec<u8>>,
    }

    impl BusLog {
        pub(crate) fn replying(replies: &[&[u8]]) -> Self {
            BusLog {
                writes: Vec::new(),
                replies: replies.iter().map(|reply| reply.to_vec()).collect(),
            }
        }
    }

    impl ErrorType for BusLog {
        type Error = core::convert::Infallible;
    }

    impl I2c for BusLog {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            for operation in operations {
                match operation {
                    Operation::Write(data) => {
                        self.writes.push((address, data.to_vec()));
                    }
                    Operation::Read(buffer) => {
                        let reply = self.replies.pop_front().unwrap_or_default();
                        buffer.copy_from_slice(&reply[..buffer.len()]);
                    }
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wire masks beyond the fitted ports are protocol faults.
    #[test]
    fn mask_rejects_unknown_bits() {
        assert_eq!(PortMask::from_wire(0b01), Ok(Port::A.mask()));
        assert_eq!(PortMask::from_wire(0b11), Ok(PortMask::ALL));
        assert_eq!(PortMask::from_wire(0b100), Err(Error::UnknownPort(4)));
    }

    /// Single-port selectors accept exactly one bit.
    #[test]
    fn selector_needs_exactly_one_port() {
        assert_eq!(Port::from_selector(0b01), Ok(Port::A));
        assert_eq!(Port::from_selector(0b10), Ok(Port::B));
        assert!(Port::from_selector(0b11).is_err());
        assert!(Port::from_selector(0).is_err());
    }

    /// Mask iteration visits ports in bit order.
    #[test]
    fn mask_iteration() {
        let ports: Vec<Port> = PortMask::ALL.iter().collect();
        assert_eq!(ports, [Port::A, Port::B]);
        assert!(PortMask::NONE.iter().next().is_none());
    }

    /// The disabled window is the documented sentinel pair.
    #[test]
    fn disabled_window_sentinel() {
        assert!(AlertWindow::DISABLED.is_disabled());
        assert_eq!(AlertWindow::DISABLED.low_mv, 0);
        assert_eq!(AlertWindow::DISABLED.high_mv, MAX_VOLTAGE_MV);
    }
}
