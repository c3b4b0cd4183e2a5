//! Runtime options
//!
//! Options are read once at start-up, usually through [`Options::from_env`], and handed to
//! every screen on construction.
//!
//! | Variable                    | Effect                                              |
//! |-----------------------------|-----------------------------------------------------|
//! | `ARMSOC_NO_FLIP`            | never page flip, always copy                        |
//! | `ARMSOC_DEVICE`             | drm node to open, `/dev/dri/card0` if unset         |
//! | `ARMSOC_DRIVER`             | use the SoC backend of this kernel driver           |
//! | `ARMSOC_POST_FLIP_DELAY`    | iterations of the post-flip delay, off if unset     |
//! | `ARMSOC_POST_FLIP_DELAY_US` | length of one post-flip delay iteration, default 1  |
//! | `ARMSOC_DMABUF_TIMEOUT_MS`  | dma-buf wait before warning, default 10000          |
//!
//! Boolean variables accept `1`, `true`, `yes` and `y`, in any case.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

/// Node opened when nothing else is configured
pub const DEFAULT_DEVICE: &str = "/dev/dri/card0";

/// Default time to wait for a dma-buf before logging a warning
pub const DEFAULT_DMABUF_TIMEOUT: Duration = Duration::from_secs(10);

/// Busy wait run after a flip that did not move any crtc.
///
/// Some GPU drivers reuse a buffer too early if the server finishes such a flip right
/// away. Sleeping a little before completing it papers over that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostFlipDelay {
    /// Number of sleeps
    pub iterations: u32,
    /// Length of one sleep
    pub interval: Duration,
}

impl PostFlipDelay {
    /// Run the delay
    pub fn run(&self) {
        for _ in 0..self.iterations {
            std::thread::sleep(self.interval);
        }
    }
}

/// Options of an armsoc screen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Never page flip
    pub no_flip: bool,
    /// Drm node to open
    pub device: PathBuf,
    /// Kernel driver name overriding the detected one
    pub driver: Option<String>,
    /// Delay after fake flips, disabled if `None`
    pub post_flip_delay: Option<PostFlipDelay>,
    /// Time to wait for a dma-buf before warning
    pub dmabuf_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            no_flip: false,
            device: PathBuf::from(DEFAULT_DEVICE),
            driver: None,
            post_flip_delay: None,
            dmabuf_timeout: DEFAULT_DMABUF_TIMEOUT,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "1" || value == "true" || value == "yes" || value == "y"
}

fn parse_number(name: &str, value: &str) -> Option<u64> {
    match value.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}, `{}` is not a number", name, value);
            None
        }
    }
}

impl Options {
    /// Read the options from the environment of the process
    pub fn from_env() -> Options {
        Options::from_vars(|name| std::env::var(name).ok())
    }

    /// Read the options through `var`, which returns the value of a variable if it is set
    pub fn from_vars<F>(var: F) -> Options
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Options::default();

        if var("ARMSOC_NO_FLIP").map(|x| parse_flag(&x)).unwrap_or(false) {
            info!("ARMSOC_NO_FLIP is set. Page flipping disabled.");
            options.no_flip = true;
        }
        if let Some(device) = var("ARMSOC_DEVICE") {
            options.device = PathBuf::from(device);
        }
        options.driver = var("ARMSOC_DRIVER").filter(|x| !x.is_empty());

        let iterations =
            var("ARMSOC_POST_FLIP_DELAY").and_then(|x| parse_number("ARMSOC_POST_FLIP_DELAY", &x));
        if let Some(iterations) = iterations.filter(|&x| x > 0) {
            let interval = var("ARMSOC_POST_FLIP_DELAY_US")
                .and_then(|x| parse_number("ARMSOC_POST_FLIP_DELAY_US", &x))
                .unwrap_or(1);
            options.post_flip_delay = Some(PostFlipDelay {
                iterations: iterations.min(u32::MAX as u64) as u32,
                interval: Duration::from_micros(interval),
            });
        }

        if let Some(timeout) =
            var("ARMSOC_DMABUF_TIMEOUT_MS").and_then(|x| parse_number("ARMSOC_DMABUF_TIMEOUT_MS", &x))
        {
            options.dmabuf_timeout = Duration::from_millis(timeout);
        }

        options
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;

    use super::{Options, PostFlipDelay, DEFAULT_DMABUF_TIMEOUT};

    fn options(vars: &[(&str, &str)]) -> Options {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Options::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let options = options(&[]);
        assert_eq!(options, Options::default());
        assert_eq!(options.device, Path::new("/dev/dri/card0"));
        assert_eq!(options.dmabuf_timeout, DEFAULT_DMABUF_TIMEOUT);
        assert!(options.post_flip_delay.is_none());
    }

    #[test]
    fn boolean_spellings() {
        for value in ["1", "true", "TRUE", "Yes", "y"] {
            assert!(options(&[("ARMSOC_NO_FLIP", value)]).no_flip, "{}", value);
        }
        for value in ["0", "false", "no", ""] {
            assert!(!options(&[("ARMSOC_NO_FLIP", value)]).no_flip, "{}", value);
        }
    }

    #[test]
    fn post_flip_delay() {
        let options = options(&[("ARMSOC_POST_FLIP_DELAY", "200")]);
        assert_eq!(
            options.post_flip_delay,
            Some(PostFlipDelay {
                iterations: 200,
                interval: Duration::from_micros(1),
            })
        );

        let options = super::Options::from_vars(|name| match name {
            "ARMSOC_POST_FLIP_DELAY" => Some("0".into()),
            "ARMSOC_POST_FLIP_DELAY_US" => Some("5".into()),
            _ => None,
        });
        assert!(options.post_flip_delay.is_none());
    }

    #[test]
    fn device_driver_and_timeout() {
        let options = options(&[
            ("ARMSOC_DEVICE", "/dev/dri/card1"),
            ("ARMSOC_DRIVER", "pl111"),
            ("ARMSOC_DMABUF_TIMEOUT_MS", "250"),
        ]);
        assert_eq!(options.device, Path::new("/dev/dri/card1"));
        assert_eq!(options.driver.as_deref(), Some("pl111"));
        assert_eq!(options.dmabuf_timeout, Duration::from_millis(250));

        let options = self::options(&[("ARMSOC_DMABUF_TIMEOUT_MS", "soon")]);
        assert_eq!(options.dmabuf_timeout, DEFAULT_DMABUF_TIMEOUT);
    }
}
