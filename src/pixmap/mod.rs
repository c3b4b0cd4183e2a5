//! Off-screen surfaces and their backing memory
//!
//! The 2D acceleration layer works on [`Pixmap`]s. The [`PixmapBridge`] decides per pixmap
//! whether it lives in a GEM [`BufferObject`] (accelerated) or in plain host memory, and
//! implements the hooks the acceleration layer calls around CPU access.
//!
//! Only pixmaps that may end up on screen or get shared with a DRI client are accelerated,
//! see [`PixmapBridge::classify`]. Every other pixmap is a throwaway surface that would only
//! pay for the kernel round-trips.
//!
//! While a pixmap is wrapped by a DRI2 buffer, it is registered for external access. Its
//! buffer object is then exported as a dma-buf on the next CPU access, so that CPU access
//! waits for whatever the external client still has in flight.

use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info_span, instrument, trace, warn};

use crate::backend::allocator::{
    format::{aligned_pitch, bytes_per_pixel},
    BufferKind, BufferObject, Device, Error as BoError, GemOp,
};
use crate::utils::{Serial, SERIAL_COUNTER};

/// Usage hint given when a pixmap is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageHint {
    /// Generic off-screen surface, only ever touched by the CPU
    Normal,
    /// Surface that is going to be scanned out
    Scanout,
    /// Backing store shared with a client
    Backing,
}

/// Outcome of [`PixmapBridge::classify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceleration {
    /// Backed by a buffer object
    Accelerated,
    /// Backed by host memory
    Unaccelerated,
}

/// Role of a pixmap in the operation it is accessed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessRole {
    /// Source of a copy or composite
    Source,
    /// Mask of a composite
    Mask,
    /// Destination
    Destination,
    /// Auxiliary source
    AuxSource,
    /// Auxiliary mask
    AuxMask,
    /// Auxiliary destination
    AuxDestination,
}

impl AccessRole {
    /// CPU operations implied by the role
    pub fn gem_op(self) -> GemOp {
        match self {
            AccessRole::Source | AccessRole::Mask | AccessRole::AuxSource | AccessRole::AuxMask => {
                GemOp::READ
            }
            AccessRole::Destination | AccessRole::AuxDestination => GemOp::READ | GemOp::WRITE,
        }
    }
}

/// An axis aligned rectangle in pixmap coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rectangle {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

impl Rectangle {
    /// Create a new rectangle
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Rectangle {
        Rectangle { x, y, width, height }
    }

    /// Intersection with `(0, 0, width, height)`, `None` if empty
    pub fn clip_to(&self, width: u32, height: u32) -> Option<Rectangle> {
        let x0 = (self.x as i64).max(0);
        let y0 = (self.y as i64).max(0);
        let x1 = (self.x as i64 + self.width as i64).min(width as i64);
        let y1 = (self.y as i64 + self.height as i64).min(height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rectangle {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Errors of the pixmap bridge
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No buffer object could be allocated, not even a non-scanout one
    #[error("Failed to allocate backing memory for a {width}x{height} pixmap")]
    Allocation {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Error of the last attempt
        #[source]
        source: BoError,
    },
    /// The geometry needs more memory than can be addressed
    #[error("A {width}x{height} pixmap of {bpp} bits per pixel is too large")]
    TooLarge {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Requested bits per pixel
        bpp: u32,
    },
    /// The pixmap has no backing memory to access
    #[error("The pixmap has no backing memory")]
    NoBacking,
    /// Source and destination of a copy have different pixel sizes
    #[error("Cannot copy between pixmaps of {0} and {1} bits per pixel")]
    BppMismatch(u32, u32),
    /// Accessing the buffer object failed
    #[error(transparent)]
    BufferObject(#[from] BoError),
}

enum Store {
    Empty,
    Bo(BufferObject),
    Host(Box<[u8]>),
    // memory handed in by the caller, not owned by us
    Foreign(NonNull<u8>),
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Store::Empty => f.write_str("Empty"),
            Store::Bo(bo) => f.debug_tuple("Bo").field(&bo.handle()).finish(),
            Store::Host(data) => f.debug_tuple("Host").field(&data.len()).finish(),
            Store::Foreign(ptr) => f.debug_tuple("Foreign").field(ptr).finish(),
        }
    }
}

#[derive(Debug)]
struct PixmapPrivate {
    usage: UsageHint,
    width: u32,
    height: u32,
    depth: u32,
    bpp: u32,
    pitch: u32,
    serial: Serial,
    ext_access: usize,
    store: Store,
    ptr: Option<NonNull<u8>>,
}

/// A surface of the acceleration layer
///
/// Clones refer to the same surface.
#[derive(Debug, Clone)]
pub struct Pixmap(Arc<Mutex<PixmapPrivate>>);

impl PartialEq for Pixmap {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Pixmap {}

impl Pixmap {
    fn new(
        usage: UsageHint,
        width: u32,
        height: u32,
        depth: u32,
        bpp: u32,
        pitch: u32,
        store: Store,
    ) -> Pixmap {
        Pixmap(Arc::new(Mutex::new(PixmapPrivate {
            usage,
            width,
            height,
            depth,
            bpp,
            pitch,
            serial: SERIAL_COUNTER.next_serial(),
            ext_access: 0,
            store,
            ptr: None,
        })))
    }

    fn private(&self) -> MutexGuard<'_, PixmapPrivate> {
        self.0.lock().unwrap()
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.private().width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.private().height
    }

    /// Color depth
    pub fn depth(&self) -> u32 {
        self.private().depth
    }

    /// Bits per pixel
    pub fn bpp(&self) -> u32 {
        self.private().bpp
    }

    /// Row stride in bytes
    pub fn pitch(&self) -> u32 {
        self.private().pitch
    }

    /// Usage hint the pixmap was created with
    pub fn usage(&self) -> UsageHint {
        self.private().usage
    }

    /// Buffer object backing the pixmap, if accelerated
    pub fn bo(&self) -> Option<BufferObject> {
        match &self.private().store {
            Store::Bo(bo) => Some(bo.clone()),
            _ => None,
        }
    }

    /// Change serial of the pixmap
    pub fn serial(&self) -> Serial {
        self.private().serial
    }

    /// Give the pixmap a new change serial, invalidating buffers handed out for it
    pub fn bump_serial(&self) -> Serial {
        let serial = SERIAL_COUNTER.next_serial();
        self.private().serial = serial;
        serial
    }

    /// Number of DRI2 buffers wrapping this pixmap
    pub fn external_access(&self) -> usize {
        self.private().ext_access
    }

    /// Pointer to the pixels while the CPU has access
    pub fn data(&self) -> Option<NonNull<u8>> {
        self.private().ptr
    }

    /// Number of clones of this handle
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub(crate) fn release_external(&self) {
        let mut private = self.private();
        assert!(private.ext_access > 0, "pixmap is not registered for external access");
        private.ext_access -= 1;
        if private.ext_access == 0 {
            if let Store::Bo(bo) = &private.store {
                if bo.has_dmabuf() {
                    bo.close_dmabuf();
                }
            }
        }
    }
}

/// Geometry update for [`PixmapBridge::modify_header`], `None` fields stay unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PixmapHeader {
    /// New width
    pub width: Option<u32>,
    /// New height
    pub height: Option<u32>,
    /// New depth
    pub depth: Option<u32>,
    /// New bits per pixel
    pub bpp: Option<u32>,
    /// New row stride, only used with `data`
    pub pitch: Option<u32>,
    /// Memory the caller wants the pixmap to use
    pub data: Option<NonNull<u8>>,
}

// zeroed host memory with an aligned stride
fn host_memory(width: u32, height: u32, bpp: u32) -> Result<(u32, Box<[u8]>), Error> {
    let too_large = || Error::TooLarge { width, height, bpp };
    let pitch = aligned_pitch(width, bpp).ok_or_else(too_large)?;
    let size = usize::try_from(pitch as u64 * height as u64).map_err(|_| too_large())?;
    let mut data = Vec::new();
    data.try_reserve_exact(size).map_err(|_| too_large())?;
    data.resize(size, 0u8);
    Ok((pitch, data.into_boxed_slice()))
}

/// Binds pixmaps of the acceleration layer to buffer objects of a [`Device`]
#[derive(Debug)]
pub struct PixmapBridge {
    device: Device,
    span: tracing::Span,
}

impl PixmapBridge {
    /// Create a bridge allocating from `device`
    pub fn new(device: Device) -> PixmapBridge {
        PixmapBridge {
            device,
            span: info_span!("armsoc_pixmap"),
        }
    }

    /// Device buffers are allocated from
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether pixmaps created with `usage` are backed by buffer objects
    pub fn classify(usage: UsageHint) -> Acceleration {
        match usage {
            UsageHint::Scanout | UsageHint::Backing => Acceleration::Accelerated,
            UsageHint::Normal => Acceleration::Unaccelerated,
        }
    }

    fn allocate_bo(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        bpp: u32,
        usage: UsageHint,
    ) -> Result<BufferObject, Error> {
        let kind = match usage {
            UsageHint::Scanout => BufferKind::Scanout,
            _ => BufferKind::NonScanout,
        };
        match self.device.create_bo(width, height, depth, bpp, kind) {
            Ok(bo) => Ok(bo),
            Err(err) if kind == BufferKind::Scanout => {
                warn!(
                    ?err,
                    width,
                    height,
                    "Failed to allocate scanout buffer, falling back to non-scanout"
                );
                self.device
                    .create_bo(width, height, depth, bpp, BufferKind::NonScanout)
                    .map_err(|source| Error::Allocation { width, height, source })
            }
            Err(source) => Err(Error::Allocation { width, height, source }),
        }
    }

    /// Create a new pixmap.
    ///
    /// Pixmaps with a zero dimension get their memory once a geometry is set through
    /// [`PixmapBridge::modify_header`].
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    #[profiling::function]
    pub fn create(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        bpp: u32,
        usage: UsageHint,
    ) -> Result<Pixmap, Error> {
        if width == 0 || height == 0 {
            return Ok(Pixmap::new(usage, width, height, depth, bpp, 0, Store::Empty));
        }
        match PixmapBridge::classify(usage) {
            Acceleration::Accelerated => {
                let bo = self.allocate_bo(width, height, depth, bpp, usage)?;
                let pitch = bo.pitch();
                Ok(Pixmap::new(usage, width, height, depth, bpp, pitch, Store::Bo(bo)))
            }
            Acceleration::Unaccelerated => {
                let (pitch, data) = host_memory(width, height, bpp)?;
                Ok(Pixmap::new(usage, width, height, depth, bpp, pitch, Store::Host(data)))
            }
        }
    }

    /// Update the geometry or the memory of a pixmap.
    ///
    /// If `header.data` is the mapping of the current scanout buffer, the pixmap is bound
    /// to that buffer. Any other `data` is foreign memory: the backing store is released
    /// and [`Acceleration::Unaccelerated`] is returned so the caller handles the pixmap on
    /// its own. Without `data`, memory is only reallocated if the geometry changed.
    #[instrument(level = "trace", parent = &self.span, skip(self, pixmap))]
    pub fn modify_header(
        &self,
        pixmap: &Pixmap,
        header: PixmapHeader,
    ) -> Result<Acceleration, Error> {
        let mut private = pixmap.private();
        let width = header.width.unwrap_or(private.width);
        let height = header.height.unwrap_or(private.height);
        let depth = header.depth.unwrap_or(private.depth);
        let bpp = header.bpp.unwrap_or(private.bpp);

        if let Some(data) = header.data {
            let scanout = self
                .device
                .scanout()
                .filter(|bo| bo.mapping() == Some(data));
            let (pitch, store, accel) = match scanout {
                Some(bo) => {
                    debug!(handle = ?bo.handle(), "Binding pixmap to the scanout buffer");
                    (bo.pitch(), Store::Bo(bo), Acceleration::Accelerated)
                }
                None => {
                    trace!("Pixmap redirected to foreign memory");
                    let pitch = match header.pitch {
                        Some(pitch) => pitch,
                        None => aligned_pitch(width, bpp).ok_or(Error::TooLarge { width, height, bpp })?,
                    };
                    (pitch, Store::Foreign(data), Acceleration::Unaccelerated)
                }
            };
            private.width = width;
            private.height = height;
            private.depth = depth;
            private.bpp = bpp;
            private.pitch = pitch;
            private.store = store;
            return Ok(accel);
        }

        let accel = PixmapBridge::classify(private.usage);
        let unchanged = width == private.width
            && height == private.height
            && bpp == private.bpp
            && !matches!(private.store, Store::Empty | Store::Foreign(_));
        if unchanged {
            private.depth = depth;
            return Ok(accel);
        }

        // drop the old memory first, the new allocation might need the space
        private.store = Store::Empty;
        private.width = width;
        private.height = height;
        private.depth = depth;
        private.bpp = bpp;
        private.pitch = 0;
        if width == 0 || height == 0 {
            return Ok(accel);
        }

        match accel {
            Acceleration::Accelerated => {
                let bo = self.allocate_bo(width, height, depth, bpp, private.usage)?;
                private.pitch = bo.pitch();
                private.store = Store::Bo(bo);
            }
            Acceleration::Unaccelerated => {
                let (pitch, data) = host_memory(width, height, bpp)?;
                private.pitch = pitch;
                private.store = Store::Host(data);
            }
        }
        Ok(accel)
    }

    /// Drop a reference to a pixmap, releasing its memory with the last one.
    ///
    /// Panics if the pixmap is still wrapped by a DRI2 buffer at that point.
    pub fn destroy(&self, pixmap: Pixmap) {
        if pixmap.ref_count() > 1 {
            return;
        }
        let mut private = pixmap.private();
        assert_eq!(
            private.ext_access, 0,
            "destroying a pixmap that is still wrapped by a DRI2 buffer"
        );
        private.store = Store::Empty;
        private.ptr = None;
    }

    /// Whether the pixmap is backed by a buffer object
    pub fn is_offscreen(&self, pixmap: &Pixmap) -> bool {
        matches!(pixmap.private().store, Store::Bo(_))
    }

    /// Make the pixmap memory available to the CPU for `role`
    #[profiling::function]
    pub fn prepare_access(&self, pixmap: &Pixmap, role: AccessRole) -> Result<(), Error> {
        let mut guard = pixmap.private();
        let private = &mut *guard;
        let bo = match &mut private.store {
            Store::Empty => return Err(Error::NoBacking),
            Store::Host(data) => {
                private.ptr = NonNull::new(data.as_mut_ptr());
                return Ok(());
            }
            Store::Foreign(ptr) => {
                private.ptr = Some(*ptr);
                return Ok(());
            }
            Store::Bo(bo) => bo.clone(),
        };

        let ptr = bo.map()?;
        if private.ext_access > 0 && !bo.has_dmabuf() {
            bo.export_dmabuf()?;
        }
        bo.cpu_prepare(role.gem_op())?;
        private.ptr = Some(ptr);
        Ok(())
    }

    /// End CPU access started with [`PixmapBridge::prepare_access`]
    #[profiling::function]
    pub fn finish_access(&self, pixmap: &Pixmap, role: AccessRole) -> Result<(), Error> {
        let mut private = pixmap.private();
        private.ptr = None;
        if let Store::Bo(bo) = &private.store {
            bo.cpu_finish(role.gem_op())?;
        }
        Ok(())
    }

    /// A DRI2 buffer started wrapping the pixmap
    pub fn register_external(&self, pixmap: &Pixmap) {
        pixmap.private().ext_access += 1;
    }

    /// A DRI2 buffer stopped wrapping the pixmap.
    ///
    /// The dma-buf export is closed once nobody wraps the pixmap anymore.
    pub fn deregister_external(&self, pixmap: &Pixmap) {
        pixmap.release_external();
    }

    /// Swap the backing memory of two pixmaps
    #[instrument(level = "trace", parent = &self.span, skip_all)]
    pub fn exchange(&self, a: &Pixmap, b: &Pixmap) {
        if a == b {
            return;
        }
        let mut a = a.private();
        let mut b = b.private();
        std::mem::swap(&mut a.store, &mut b.store);
        std::mem::swap(&mut a.pitch, &mut b.pitch);

        // a buffer must not keep its export once nobody needs the synchronization
        let dangling = |private: &PixmapPrivate| match &private.store {
            Store::Bo(bo) if private.ext_access == 0 && bo.has_dmabuf() => Some(bo.clone()),
            _ => None,
        };
        let a_dangling = dangling(&*a);
        let b_dangling = dangling(&*b);
        assert!(
            a_dangling.is_none() || b_dangling.is_none(),
            "both exchanged pixmaps carry a dma-buf nobody uses"
        );
        if let Some(bo) = a_dangling.or(b_dangling) {
            bo.close_dmabuf();
        }
    }

    /// Copy `area` from `src` to the same position in `dst` with the CPU
    #[profiling::function]
    pub fn copy_area(&self, src: &Pixmap, dst: &Pixmap, area: Rectangle) -> Result<(), Error> {
        let (src_bpp, dst_bpp) = (src.bpp(), dst.bpp());
        if src_bpp != dst_bpp {
            return Err(Error::BppMismatch(src_bpp, dst_bpp));
        }
        let Some(area) = area
            .clip_to(src.width(), src.height())
            .and_then(|area| area.clip_to(dst.width(), dst.height()))
        else {
            return Ok(());
        };

        self.prepare_access(dst, AccessRole::Destination)?;
        if src != dst {
            if let Err(err) = self.prepare_access(src, AccessRole::Source) {
                let _ = self.finish_access(dst, AccessRole::Destination);
                return Err(err);
            }
        }

        if let (Some(src_ptr), Some(dst_ptr)) = (src.data(), dst.data()) {
            let bytespp = bytes_per_pixel(src_bpp) as usize;
            let (src_pitch, dst_pitch) = (src.pitch() as usize, dst.pitch() as usize);
            let row = area.width as usize * bytespp;
            for y in area.y as usize..(area.y as usize + area.height as usize) {
                let offset = area.x as usize * bytespp;
                // SAFETY: `area` is clipped to both pixmaps, whose memory is mapped and
                // covers `pitch * height` bytes. `copy` tolerates overlap for src == dst.
                unsafe {
                    std::ptr::copy(
                        src_ptr.as_ptr().add(y * src_pitch + offset),
                        dst_ptr.as_ptr().add(y * dst_pitch + offset),
                        row,
                    );
                }
            }
        }

        let src_result = if src != dst {
            self.finish_access(src, AccessRole::Source)
        } else {
            Ok(())
        };
        self.finish_access(dst, AccessRole::Destination)?;
        src_result
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::Arc;

    use super::{Acceleration, AccessRole, Error, PixmapBridge, PixmapHeader, Rectangle, UsageHint};
    use crate::backend::allocator::{BufferKind, Device, GemOp};
    use crate::backend::drm::test::DummyKms;
    use crate::backend::soc::{SocBackend, PL111_BO_SCANOUT};
    use crate::config::Options;

    fn bridge() -> (Arc<DummyKms>, PixmapBridge) {
        let kms = Arc::new(DummyKms::new("pl111"));
        let device = Device::new(kms.clone(), SocBackend::Pl111, &Options::default());
        (kms, PixmapBridge::new(device))
    }

    #[test]
    fn classification() {
        assert_eq!(PixmapBridge::classify(UsageHint::Scanout), Acceleration::Accelerated);
        assert_eq!(PixmapBridge::classify(UsageHint::Backing), Acceleration::Accelerated);
        assert_eq!(PixmapBridge::classify(UsageHint::Normal), Acceleration::Unaccelerated);
        assert_eq!(AccessRole::Mask.gem_op(), GemOp::READ);
        assert_eq!(AccessRole::AuxDestination.gem_op(), GemOp::READ | GemOp::WRITE);
    }

    #[test]
    fn create_accelerated_and_host() {
        let (kms, bridge) = bridge();
        let accel = bridge.create(100, 10, 24, 32, UsageHint::Backing).unwrap();
        assert!(bridge.is_offscreen(&accel));
        assert_eq!(accel.pitch(), 448);

        let host = bridge.create(100, 10, 24, 32, UsageHint::Normal).unwrap();
        assert!(!bridge.is_offscreen(&host));
        assert_eq!(host.pitch(), 448);
        assert_eq!(kms.live_buffers(), 1);
    }

    #[test]
    fn oversized_host_pixmaps_are_rejected() {
        let (_kms, bridge) = bridge();
        assert!(matches!(
            bridge.create(0x4000_0001, 1, 24, 32, UsageHint::Normal),
            Err(Error::TooLarge { width: 0x4000_0001, height: 1, bpp: 32 })
        ));
        // the stride fits, the whole allocation can never be reserved
        assert!(matches!(
            bridge.create(0x3fff_fff0, u32::MAX, 24, 32, UsageHint::Normal),
            Err(Error::TooLarge { .. })
        ));

        let pixmap = bridge.create(8, 8, 24, 32, UsageHint::Normal).unwrap();
        let header = PixmapHeader {
            width: Some(0x4000_0000),
            ..Default::default()
        };
        assert!(matches!(
            bridge.modify_header(&pixmap, header),
            Err(Error::TooLarge { .. })
        ));
        assert_eq!(pixmap.pitch(), 0);
        assert!(matches!(
            bridge.prepare_access(&pixmap, AccessRole::Source),
            Err(Error::NoBacking)
        ));
    }

    #[test]
    fn oversized_accelerated_pixmaps_fail_allocation() {
        let (kms, bridge) = bridge();
        assert!(matches!(
            bridge.create(0x4000_0001, 1, 24, 32, UsageHint::Scanout),
            Err(Error::Allocation { .. })
        ));
        assert_eq!(kms.live_buffers(), 0);
    }

    #[test]
    fn foreign_memory_without_pitch_keeps_geometry_on_overflow() {
        let (_kms, bridge) = bridge();
        let pixmap = bridge.create(8, 8, 24, 32, UsageHint::Normal).unwrap();
        let mut foreign = vec![0u8; 64];
        let header = PixmapHeader {
            width: Some(u32::MAX),
            data: NonNull::new(foreign.as_mut_ptr()),
            ..Default::default()
        };
        assert!(matches!(
            bridge.modify_header(&pixmap, header),
            Err(Error::TooLarge { .. })
        ));
        assert_eq!((pixmap.width(), pixmap.pitch()), (8, 64));
    }

    #[test]
    fn scanout_falls_back_to_non_scanout() {
        let (kms, bridge) = bridge();
        kms.fail_creates_with_flags(PL111_BO_SCANOUT);
        let pixmap = bridge.create(64, 64, 24, 32, UsageHint::Scanout).unwrap();
        assert_eq!(pixmap.bo().unwrap().kind(), BufferKind::NonScanout);

        kms.fail_all_creates();
        assert!(matches!(
            bridge.create(64, 64, 24, 32, UsageHint::Scanout),
            Err(Error::Allocation { .. })
        ));
    }

    #[test]
    fn modify_header_binds_scanout() {
        let (_kms, bridge) = bridge();
        let scanout = bridge
            .device()
            .create_bo(64, 64, 24, 32, BufferKind::Scanout)
            .unwrap();
        let ptr = scanout.map().unwrap();
        bridge.device().set_scanout(Some(scanout.clone()));

        let root = bridge.create(0, 0, 24, 32, UsageHint::Normal).unwrap();
        let header = PixmapHeader {
            width: Some(64),
            height: Some(64),
            data: Some(ptr),
            ..Default::default()
        };
        assert_eq!(bridge.modify_header(&root, header).unwrap(), Acceleration::Accelerated);
        assert_eq!(root.bo(), Some(scanout));
        assert_eq!(root.pitch(), 256);
    }

    #[test]
    fn modify_header_foreign_memory_releases_backing() {
        let (kms, bridge) = bridge();
        let pixmap = bridge.create(64, 64, 24, 32, UsageHint::Backing).unwrap();
        let mut foreign = vec![0u8; 64 * 256];
        let header = PixmapHeader {
            data: NonNull::new(foreign.as_mut_ptr()),
            ..Default::default()
        };
        assert_eq!(bridge.modify_header(&pixmap, header).unwrap(), Acceleration::Unaccelerated);
        assert!(pixmap.bo().is_none());
        assert_eq!(kms.live_buffers(), 0);
    }

    #[test]
    fn modify_header_reallocates_only_on_change() {
        let (kms, bridge) = bridge();
        let pixmap = bridge.create(64, 64, 24, 32, UsageHint::Backing).unwrap();
        let bo = pixmap.bo().unwrap();

        let same = PixmapHeader {
            width: Some(64),
            height: Some(64),
            ..Default::default()
        };
        bridge.modify_header(&pixmap, same).unwrap();
        assert_eq!(pixmap.bo(), Some(bo.clone()));

        let bigger = PixmapHeader {
            width: Some(128),
            ..Default::default()
        };
        bridge.modify_header(&pixmap, bigger).unwrap();
        assert_ne!(pixmap.bo(), Some(bo.clone()));
        assert_eq!(pixmap.width(), 128);
        drop(bo);
        assert_eq!(kms.live_buffers(), 1);
    }

    #[test]
    #[should_panic(expected = "still wrapped")]
    fn destroy_with_external_access_panics() {
        let (_kms, bridge) = bridge();
        let pixmap = bridge.create(64, 64, 24, 32, UsageHint::Backing).unwrap();
        bridge.register_external(&pixmap);
        bridge.destroy(pixmap);
    }

    #[test]
    fn destroy_releases_with_last_reference() {
        let (kms, bridge) = bridge();
        let pixmap = bridge.create(64, 64, 24, 32, UsageHint::Backing).unwrap();
        let extra = pixmap.clone();
        bridge.destroy(extra);
        assert_eq!(kms.live_buffers(), 1);
        bridge.destroy(pixmap);
        assert_eq!(kms.live_buffers(), 0);
    }

    #[test]
    fn access_exports_dmabuf_for_external_pixmaps() {
        let (kms, bridge) = bridge();
        let pixmap = bridge.create(64, 64, 24, 32, UsageHint::Backing).unwrap();

        bridge.prepare_access(&pixmap, AccessRole::Source).unwrap();
        assert!(pixmap.data().is_some());
        assert!(!pixmap.bo().unwrap().has_dmabuf());
        bridge.finish_access(&pixmap, AccessRole::Source).unwrap();
        assert!(pixmap.data().is_none());

        bridge.register_external(&pixmap);
        bridge.prepare_access(&pixmap, AccessRole::Destination).unwrap();
        assert!(pixmap.bo().unwrap().has_dmabuf());
        bridge.finish_access(&pixmap, AccessRole::Destination).unwrap();
        assert_eq!(kms.stats().dmabuf_waits, 1);
        assert_eq!(kms.stats().syncs, 2);

        bridge.deregister_external(&pixmap);
        assert!(!pixmap.bo().unwrap().has_dmabuf());
    }

    #[test]
    fn failed_access_leaves_no_pointer_behind() {
        let (kms, bridge) = bridge();
        let pixmap = bridge.create(64, 64, 24, 32, UsageHint::Backing).unwrap();
        bridge.register_external(&pixmap);
        kms.fail_export();

        assert!(matches!(
            bridge.prepare_access(&pixmap, AccessRole::Destination),
            Err(Error::BufferObject(_))
        ));
        assert!(pixmap.data().is_none());
        assert!(!pixmap.bo().unwrap().has_dmabuf());
        bridge.deregister_external(&pixmap);
    }

    #[test]
    fn exchange_is_symmetric() {
        let (_kms, bridge) = bridge();
        let a = bridge.create(64, 64, 24, 32, UsageHint::Backing).unwrap();
        let b = bridge.create(64, 64, 24, 32, UsageHint::Backing).unwrap();
        bridge.register_external(&a);
        let (bo_a, bo_b) = (a.bo().unwrap(), b.bo().unwrap());

        bridge.exchange(&a, &b);
        assert_eq!(a.bo().unwrap(), bo_b);
        assert_eq!(b.bo().unwrap(), bo_a);
        bridge.exchange(&a, &b);
        assert_eq!(a.bo().unwrap(), bo_a);
        assert_eq!(b.bo().unwrap(), bo_b);
        assert_eq!((a.external_access(), b.external_access()), (1, 0));
    }

    #[test]
    fn exchange_closes_dangling_export() {
        let (_kms, bridge) = bridge();
        let a = bridge.create(64, 64, 24, 32, UsageHint::Backing).unwrap();
        let b = bridge.create(64, 64, 24, 32, UsageHint::Backing).unwrap();
        bridge.register_external(&a);
        bridge.prepare_access(&a, AccessRole::Source).unwrap();
        bridge.finish_access(&a, AccessRole::Source).unwrap();
        let exported = a.bo().unwrap();
        assert!(exported.has_dmabuf());

        bridge.exchange(&a, &b);
        assert_eq!(b.bo().unwrap(), exported);
        assert!(!exported.has_dmabuf());
    }

    #[test]
    fn copy_area_clips() {
        let (_kms, bridge) = bridge();
        let src = bridge.create(16, 16, 24, 32, UsageHint::Backing).unwrap();
        let dst = bridge.create(8, 8, 24, 32, UsageHint::Normal).unwrap();

        bridge.prepare_access(&src, AccessRole::Destination).unwrap();
        let ptr = src.data().unwrap();
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x42, (src.pitch() * 16) as usize) };
        bridge.finish_access(&src, AccessRole::Destination).unwrap();

        bridge.copy_area(&src, &dst, Rectangle::new(4, 4, 16, 16)).unwrap();

        bridge.prepare_access(&dst, AccessRole::Source).unwrap();
        let ptr = dst.data().unwrap();
        let pitch = dst.pitch() as usize;
        let pixels = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), pitch * 8) };
        assert_eq!(pixels[3 * pitch + 3 * 4], 0);
        assert_eq!(pixels[4 * pitch + 4 * 4], 0x42);
        assert_eq!(pixels[7 * pitch + 7 * 4 + 3], 0x42);
        bridge.finish_access(&dst, AccessRole::Source).unwrap();
    }

    #[test]
    fn copy_area_rejects_bpp_mismatch() {
        let (_kms, bridge) = bridge();
        let src = bridge.create(8, 8, 16, 16, UsageHint::Normal).unwrap();
        let dst = bridge.create(8, 8, 24, 32, UsageHint::Normal).unwrap();
        assert!(matches!(
            bridge.copy_area(&src, &dst, Rectangle::new(0, 0, 8, 8)),
            Err(Error::BppMismatch(16, 32))
        ));
    }

    #[test]
    fn rectangle_clipping() {
        assert_eq!(
            Rectangle::new(-4, 2, 10, 10).clip_to(8, 8),
            Some(Rectangle::new(0, 2, 6, 6))
        );
        assert_eq!(Rectangle::new(9, 0, 4, 4).clip_to(8, 8), None);
    }
}
