//! Various utilities functions and types

mod fd;
mod serial;

pub use self::fd::{DevPath, DeviceFd};
pub use self::serial::{Serial, SerialCounter, SERIAL_COUNTER};
