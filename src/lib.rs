#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

#[macro_use]
mod fmt;

pub mod alert;
pub mod analog;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fpga;
pub mod status;
pub mod storage;

pub use alert::Signals;
pub use analog::{AnalogPorts, Port, PortMask};
pub use commands::ControlPipe;
pub use config::DeviceConfig;
pub use dispatcher::{Board, Device};
pub use error::Error;
pub use fpga::{ConfigLink, RegisterBus};
pub use status::Indicators;
pub use storage::StorageBank;
