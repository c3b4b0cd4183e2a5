//! The kernel ioctl surface used by this crate
//!
//! Everything armsoc asks of the kernel goes through the [`KmsDevice`] trait. The layout of
//! the underlying ioctls is fixed by the DRM uAPI; the trait only exists so the buffer and
//! swap machinery can be driven by something other than a real device node, most notably
//! the in-memory [`DummyKms`](super::test::DummyKms) used by the tests.

use std::fmt;
use std::io;
use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::ptr::NonNull;
use std::time::Duration;

use drm::buffer::Handle as GemHandle;
use drm::control::{crtc, framebuffer};

mod fd;
pub use self::fd::DrmDeviceFd;

/// Kernel view of a freshly created GEM object
///
/// The kernel is free to realign the pitch and to round up the size, so these values are
/// authoritative and must not be recomputed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemAllocation {
    /// Handle of the object, local to the open file description
    pub handle: GemHandle,
    /// Row stride in bytes
    pub pitch: u32,
    /// Size of the allocation in bytes
    pub size: u64,
}

/// Description of a framebuffer to be created around a GEM object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    /// GEM object backing the framebuffer
    pub handle: GemHandle,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row stride in bytes
    pub pitch: u32,
    /// Color depth
    pub depth: u32,
    /// Bits per pixel
    pub bpp: u32,
}

/// Events read back from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmsEvent {
    /// A page flip queued on `crtc` has been latched by the hardware
    PageFlip {
        /// Crtc that flipped
        crtc: crtc::Handle,
        /// Frame counter at the time of the flip
        frame: u32,
        /// Timestamp of the flip
        time: Duration,
    },
    /// A requested vblank event fired
    Vblank {
        /// Crtc that generated the vblank
        crtc: crtc::Handle,
        /// Frame counter of the vblank
        frame: u32,
        /// Timestamp of the vblank
        time: Duration,
        /// Value passed to [`KmsDevice::request_vblank_event`]
        user_data: usize,
    },
}

/// Reply of a vblank query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankReply {
    /// Current frame counter
    pub sequence: u32,
    /// Timestamp of the last vblank
    pub time: Duration,
}

/// Kernel DRM operations needed to manage buffer objects and page flips.
///
/// All methods map onto a single ioctl (or mmap family call) of the DRM uAPI. Failures
/// are reported verbatim, interpretation is left to the caller.
pub trait KmsDevice: fmt::Debug + Send + Sync {
    /// Path of the device node, if known. Only used for diagnostics.
    fn device_path(&self) -> Option<PathBuf> {
        None
    }

    /// Name of the kernel driver bound to this device
    fn driver_name(&self) -> io::Result<String>;

    /// Become DRM master
    fn acquire_master(&self) -> io::Result<()>;

    /// Drop DRM master
    fn release_master(&self) -> io::Result<()>;

    /// `DRM_IOCTL_MODE_CREATE_DUMB` with driver specific `flags`
    fn create_dumb(&self, width: u32, height: u32, bpp: u32, flags: u32) -> io::Result<GemAllocation>;

    /// `DRM_IOCTL_EXYNOS_GEM_CREATE`
    fn create_exynos_gem(&self, size: u64, flags: u32) -> io::Result<GemHandle>;

    /// `DRM_IOCTL_MODE_DESTROY_DUMB`
    fn destroy_dumb(&self, handle: GemHandle) -> io::Result<()>;

    /// Map `len` bytes of the object into the address space of this process
    fn map_dumb(&self, handle: GemHandle, len: usize) -> io::Result<NonNull<u8>>;

    /// Remove a mapping created by [`KmsDevice::map_dumb`].
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe a live mapping returned by `map_dumb`, and no
    /// reference into it may outlive this call.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Write back and invalidate the CPU caches covering a mapping
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe a live mapping returned by `map_dumb`.
    unsafe fn sync_mapping(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// `DRM_IOCTL_MODE_ADDFB`
    fn add_framebuffer(&self, info: &FramebufferInfo) -> io::Result<framebuffer::Handle>;

    /// `DRM_IOCTL_MODE_RMFB`
    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()>;

    /// `DRM_IOCTL_GEM_FLINK`
    fn flink(&self, handle: GemHandle) -> io::Result<u32>;

    /// `DRM_IOCTL_PRIME_HANDLE_TO_FD`
    fn export_prime(&self, handle: GemHandle) -> io::Result<OwnedFd>;

    /// Wait until a dma-buf is ready for CPU reads (or writes, if `write` is set).
    ///
    /// Returns `Ok(false)` if `timeout` expired first.
    fn wait_dmabuf(&self, dmabuf: BorrowedFd<'_>, write: bool, timeout: Duration) -> io::Result<bool>;

    /// `DRM_IOCTL_MODE_PAGE_FLIP`, optionally requesting a completion event
    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle, event: bool) -> io::Result<()>;

    /// Read all pending events from the device
    fn receive_events(&self) -> io::Result<Vec<KmsEvent>>;

    /// Block until events are available, or `timeout` expired.
    ///
    /// Returns `Ok(false)` on timeout.
    fn wait_for_events(&self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Query the current vblank counter of the first crtc
    fn query_vblank(&self) -> io::Result<VblankReply>;

    /// Ask for a [`KmsEvent::Vblank`] once the first crtc reaches `target`
    fn request_vblank_event(&self, target: u32, user_data: usize) -> io::Result<()>;
}
