//! Userspace control of GPIO pins through the Linux sysfs GPIO class
//! directory.
//!
//! A [`PinController`] translates channels into hardware pin numbers,
//! exports pins, sets their direction, reads and writes values and reports
//! value changes as [`ChangeEvent`]s.

pub mod backend;
pub mod config;
pub mod error;
pub mod gpio;
pub mod pins;
pub mod watch;

pub use backend::{MockGpioBackend, MockOperation, SysfsBackend};
pub use config::{ControllerConfig, Direction, NamingMode};
pub use error::{GpioError, Result};
pub use gpio::{GpioBackend, PinController};
pub use pins::PinMapping;
pub use watch::{ChangeEvent, ChangeStream, ValueStamp};
