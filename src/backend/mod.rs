pub mod mock;
pub mod sysfs;

pub use mock::{MockGpioBackend, MockOperation};
pub use sysfs::SysfsBackend;
