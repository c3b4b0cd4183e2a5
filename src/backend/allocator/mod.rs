//! Buffer object allocation and management.
//!
//! A [`Device`] wraps an open drm node together with the [`SocBackend`] describing how
//! buffers have to be requested from its kernel driver. [`BufferObject`]s created from
//! it are reference counted GEM objects: cloning one takes a reference, dropping the last
//! clone removes its framebuffer, unmaps it and frees the kernel object.
//!
//! ```rust,ignore
//! let options = Options::from_env();
//! let device = Device::from_options(&registry, &options)?;
//! let bo = device.create_bo(1920, 1080, 24, 32, BufferKind::Scanout)?;
//! bo.attach_framebuffer()?;
//! bo.clear()?;
//! device.set_scanout(Some(bo));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info_span};

use crate::backend::drm::{Connection, ConnectionRegistry, Error as DrmError, KmsDevice};
use crate::backend::soc::SocBackend;
use crate::config::Options;

mod bo;
pub mod format;

pub use self::bo::BufferObject;

/// Whether a buffer has to be usable by the display controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Memory the display controller can scan out of
    Scanout,
    /// Any other memory
    NonScanout,
}

bitflags::bitflags! {
    /// Kind of CPU access to a buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GemOp: u32 {
        /// The CPU reads from the buffer
        const READ = 0x01;
        /// The CPU writes to the buffer
        const WRITE = 0x02;
    }
}

/// Errors of buffer object operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The kernel refused to create the buffer
    #[error("Failed to create a {width}x{height}@{bpp} {kind:?} buffer")]
    Create {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Requested bits per pixel
        bpp: u32,
        /// Requested kind
        kind: BufferKind,
        /// Underlying kernel error
        #[source]
        source: std::io::Error,
    },
    /// Mapping the buffer failed
    #[error("Failed to map the buffer")]
    Map(#[source] std::io::Error),
    /// The kernel rejected the framebuffer
    #[error("Failed to add a framebuffer")]
    AddFramebuffer(#[source] std::io::Error),
    /// The framebuffer could not be removed
    #[error("Failed to remove the framebuffer")]
    RemoveFramebuffer(#[source] std::io::Error),
    /// The new geometry does not fit into the original allocation
    #[error("Resizing needs {required} bytes, but only {available} are allocated")]
    ResizeTooLarge {
        /// Bytes needed by the new geometry
        required: u64,
        /// Bytes originally allocated
        available: u64,
    },
    /// Creating a flink name failed
    #[error("Failed to create a flink name")]
    Flink(#[source] std::io::Error),
    /// Exporting a dma-buf failed
    #[error("Failed to export a dma-buf")]
    Export(#[source] std::io::Error),
    /// Synchronizing CPU access failed
    #[error("Failed to synchronize CPU access")]
    Sync(#[source] std::io::Error),
}

pub(crate) struct DeviceInner {
    pub(crate) kms: Arc<dyn KmsDevice>,
    pub(crate) soc: SocBackend,
    pub(crate) alpha_supported: AtomicBool,
    pub(crate) dmabuf_timeout: Duration,
    pub(crate) span: tracing::Span,
    // keeps the node registered for as long as buffers can be allocated from it
    connection: Option<Connection>,
}

impl fmt::Debug for DeviceInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInner")
            .field("connection", &self.connection)
            .field("kms", &self.kms)
            .field("soc", &self.soc)
            .field("alpha_supported", &self.alpha_supported)
            .finish()
    }
}

/// A display adapter buffers are allocated from
#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
    scanout: Arc<Mutex<Option<BufferObject>>>,
}

impl Device {
    /// Create a new device for `kms` using the parameters of `soc`
    pub fn new(kms: Arc<dyn KmsDevice>, soc: SocBackend, options: &Options) -> Device {
        Device::with_connection(kms, soc, options, None)
    }

    fn with_connection(
        kms: Arc<dyn KmsDevice>,
        soc: SocBackend,
        options: &Options,
        connection: Option<Connection>,
    ) -> Device {
        let span = info_span!("armsoc_device", soc = soc.info().driver);
        Device {
            inner: Arc::new(DeviceInner {
                kms,
                soc,
                alpha_supported: AtomicBool::new(true),
                dmabuf_timeout: options.dmabuf_timeout,
                span,
                connection,
            }),
            scanout: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a device on an open connection, selecting the SoC backend from its driver.
    ///
    /// The device keeps the connection open until its last clone is dropped.
    pub fn open(connection: Connection, options: &Options) -> Result<Device, DrmError> {
        let soc = SocBackend::select(&**connection.kms(), options)?;
        let kms = connection.kms().clone();
        Ok(Device::with_connection(kms, soc, options, Some(connection)))
    }

    /// Open the node named by [`Options::device`] through `registry` and create a device on it
    pub fn from_options(registry: &ConnectionRegistry, options: &Options) -> Result<Device, DrmError> {
        let connection = registry.open(&options.device)?;
        debug!(path = ?connection.path(), "Opening device from options");
        Device::open(connection, options)
    }

    /// Connection the device was opened on, `None` for devices built with [`Device::new`]
    pub fn connection(&self) -> Option<&Connection> {
        self.inner.connection.as_ref()
    }

    /// Kernel interface of this device
    pub fn kms(&self) -> &Arc<dyn KmsDevice> {
        &self.inner.kms
    }

    /// SoC backend of this device
    pub fn soc(&self) -> SocBackend {
        self.inner.soc
    }

    /// Whether the kernel accepted framebuffers with an alpha channel so far
    pub fn alpha_supported(&self) -> bool {
        self.inner.alpha_supported.load(Ordering::SeqCst)
    }

    /// Allocate a new buffer object
    pub fn create_bo(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        bpp: u32,
        kind: BufferKind,
    ) -> Result<BufferObject, Error> {
        BufferObject::new(self, width, height, depth, bpp, kind)
    }

    /// The buffer currently shown on screen
    pub fn scanout(&self) -> Option<BufferObject> {
        self.scanout.lock().unwrap().clone()
    }

    /// Replace the buffer shown on screen, returning the previous one
    pub fn set_scanout(&self, bo: Option<BufferObject>) -> Option<BufferObject> {
        let mut scanout = self.scanout.lock().unwrap();
        debug!(
            parent: &self.inner.span,
            new = ?bo.as_ref().map(|bo| bo.handle()),
            "Updating scanout buffer"
        );
        std::mem::replace(&mut *scanout, bo)
    }

    pub(crate) fn inner(&self) -> &Arc<DeviceInner> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{BufferKind, Device};
    use crate::backend::drm::{test::DummyKms, ConnectionRegistry, Error as DrmError, KmsDevice};
    use crate::backend::soc::SocBackend;
    use crate::config::Options;

    fn dummy(driver: &str) -> Arc<dyn KmsDevice> {
        Arc::new(DummyKms::new(driver))
    }

    #[test]
    fn open_selects_backend() {
        let registry = ConnectionRegistry::new();
        let connection = registry
            .open_with("/dev/dri/card0", |_| Ok(dummy("exynos")))
            .unwrap();
        let device = Device::open(connection, &Options::default()).unwrap();
        assert_eq!(device.soc(), SocBackend::Exynos);
        assert!(device.alpha_supported());
        assert_eq!(registry.len(), 1);

        let clone = device.clone();
        drop(device);
        assert_eq!(registry.len(), 1);
        drop(clone);
        assert!(registry.is_empty());
    }

    #[test]
    fn from_options_opens_the_configured_node() {
        let registry = ConnectionRegistry::new();
        let options = Options {
            device: "/dev/dri/card7".into(),
            ..Options::default()
        };
        let first = registry
            .open_with("/dev/dri/card7", |_| Ok(dummy("rockchip")))
            .unwrap();

        let device = Device::from_options(&registry, &options).unwrap();
        assert_eq!(device.soc(), SocBackend::Rockchip);
        assert_eq!(device.connection().unwrap().path(), options.device);
        assert!(Arc::ptr_eq(device.kms(), first.kms()));
        drop(first);
        assert_eq!(registry.len(), 1);
        drop(device);
        assert!(registry.is_empty());
    }

    #[test]
    fn from_options_reports_the_missing_node() {
        let registry = ConnectionRegistry::new();
        let options = Options {
            device: "/nonexistent/armsoc/card0".into(),
            ..Options::default()
        };
        match Device::from_options(&registry, &options) {
            Err(DrmError::UnableToOpenNode { path, .. }) => assert_eq!(path, options.device),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn unsupported_driver_closes_the_connection() {
        let registry = ConnectionRegistry::new();
        let connection = registry
            .open_with("/dev/dri/card0", |_| Ok(dummy("nouveau")))
            .unwrap();
        assert!(matches!(
            Device::open(connection, &Options::default()),
            Err(DrmError::UnsupportedDriver(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn scanout_holds_a_reference() {
        let kms = Arc::new(DummyKms::new("pl111"));
        let device = Device::new(kms.clone(), SocBackend::Pl111, &Options::default());
        let bo = device.create_bo(64, 64, 24, 32, BufferKind::Scanout).unwrap();

        assert!(device.set_scanout(Some(bo.clone())).is_none());
        assert_eq!(bo.ref_count(), 2);
        drop(bo);
        assert_eq!(kms.live_buffers(), 1);

        let previous = device.set_scanout(None).unwrap();
        assert_eq!(previous.ref_count(), 1);
        drop(previous);
        assert_eq!(kms.live_buffers(), 0);
    }
}
