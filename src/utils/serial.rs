use std::sync::atomic::{AtomicU32, Ordering};

/// The global [`SerialCounter`] handing out pixmap change serials.
///
/// Bumping the serial of a drawable's pixmap tells the double-buffering protocol layer
/// that previously handed out buffers are stale and have to be requested again.
pub static SERIAL_COUNTER: SerialCounter = SerialCounter::new();

/// A change serial
///
/// Serials wrap around, zero is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Serial(u32);

impl Serial {
    /// Whether this serial was handed out after `other`
    pub fn is_newer_than(&self, other: Serial) -> bool {
        self.0 != other.0 && self.0.wrapping_sub(other.0) < u32::MAX / 2
    }
}

impl From<Serial> for u32 {
    fn from(serial: Serial) -> u32 {
        serial.0
    }
}

/// A counter for generating serials
#[derive(Debug)]
pub struct SerialCounter(AtomicU32);

impl SerialCounter {
    /// A counter starting at 1
    pub const fn new() -> SerialCounter {
        SerialCounter(AtomicU32::new(1))
    }

    /// Retrieve the next serial from the counter
    pub fn next_serial(&self) -> Serial {
        loop {
            let serial = self.0.fetch_add(1, Ordering::AcqRel);
            if serial != 0 {
                return Serial(serial);
            }
        }
    }
}

impl Default for SerialCounter {
    fn default() -> Self {
        SerialCounter::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::{Serial, SerialCounter};

    #[test]
    fn serials_increase() {
        let counter = SerialCounter::new();
        let first = counter.next_serial();
        let second = counter.next_serial();
        assert!(second.is_newer_than(first));
        assert!(!first.is_newer_than(second));
        assert!(!first.is_newer_than(first));
    }

    #[test]
    fn wrap_around_skips_zero() {
        let counter = SerialCounter(AtomicU32::new(u32::MAX));
        let last = counter.next_serial();
        let wrapped = counter.next_serial();

        assert_eq!(u32::from(last), u32::MAX);
        assert_eq!(wrapped, Serial(1));
        assert!(wrapped.is_newer_than(last));
    }
}
