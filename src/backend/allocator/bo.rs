//! Reference counted GEM buffer objects

use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::unix::io::{AsFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use drm::buffer::Handle as GemHandle;
use drm::control::framebuffer;
use tracing::{debug, error, instrument, trace, warn};

use super::format::{aligned_pitch, bytes_per_pixel, depth_bpp, fourcc_for, get_opaque, has_alpha};
use super::{BufferKind, Device, DeviceInner, Error, GemOp};
use crate::backend::drm::FramebufferInfo;

#[derive(Debug, Clone, Copy)]
struct Mapping(NonNull<u8>);

// SAFETY: the mapping is plain shared memory, it stays valid until the buffer object
// unmaps it on drop and access to the pointer itself is guarded by the state mutex.
unsafe impl Send for Mapping {}

#[derive(Debug)]
struct BoState {
    width: u32,
    height: u32,
    depth: u32,
    bpp: u32,
    pitch: u32,
    size: u64,
    name: Option<u32>,
    fb: Option<framebuffer::Handle>,
    dmabuf: Option<OwnedFd>,
    map: Option<Mapping>,
}

struct BoInner {
    device: Arc<DeviceInner>,
    handle: GemHandle,
    kind: BufferKind,
    original_size: u64,
    state: Mutex<BoState>,
}

impl fmt::Debug for BoInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("original_size", &self.original_size)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for BoInner {
    fn drop(&mut self) {
        let _guard = self.device.span.enter();
        let kms = &self.device.kms;
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(Mapping(ptr)) = state.map.take() {
            // SAFETY: the mapping was created by `map_dumb` with this length and the last
            // reference to the buffer object is going away.
            if let Err(err) = unsafe { kms.unmap(ptr, self.original_size as usize) } {
                warn!(handle = ?self.handle, ?err, "Failed to unmap buffer object");
            }
        }
        // the kernel refuses to destroy a buffer that is still a framebuffer
        if let Some(fb) = state.fb.take() {
            if let Err(err) = kms.destroy_framebuffer(fb) {
                warn!(handle = ?self.handle, ?fb, ?err, "Failed to remove framebuffer");
            }
        }
        state.dmabuf.take();
        match kms.destroy_dumb(self.handle) {
            Ok(()) => trace!(handle = ?self.handle, "Destroyed buffer object"),
            Err(err) => error!(handle = ?self.handle, ?err, "Failed to destroy buffer object"),
        }
    }
}

/// A GEM object with its CPU mapping, framebuffer and dma-buf export
///
/// Cloning a `BufferObject` takes a reference on it, dropping releases the reference.
/// The kernel object is freed together with the last reference.
#[derive(Debug, Clone)]
pub struct BufferObject(Arc<BoInner>);

impl PartialEq for BufferObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for BufferObject {}

impl Hash for BufferObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}

impl BufferObject {
    /// Allocate a new buffer object on `device`.
    ///
    /// Pitch and size are taken from the kernel, which may align them further.
    #[instrument(level = "debug", parent = &device.inner().span, skip(device))]
    #[profiling::function]
    pub fn new(
        device: &Device,
        width: u32,
        height: u32,
        depth: u32,
        bpp: u32,
        kind: BufferKind,
    ) -> Result<BufferObject, Error> {
        let inner = device.inner();
        let allocation = inner
            .soc
            .create_gem(&*inner.kms, width, height, bpp, kind)
            .map_err(|source| Error::Create {
                width,
                height,
                bpp,
                kind,
                source,
            })?;
        debug!(
            handle = ?allocation.handle,
            pitch = allocation.pitch,
            size = allocation.size,
            "Created buffer object"
        );

        Ok(BufferObject(Arc::new(BoInner {
            device: inner.clone(),
            handle: allocation.handle,
            kind,
            original_size: allocation.size,
            state: Mutex::new(BoState {
                width,
                height,
                depth,
                bpp,
                pitch: allocation.pitch,
                size: allocation.size,
                name: None,
                fb: None,
                dmabuf: None,
                map: None,
            }),
        })))
    }

    fn state(&self) -> MutexGuard<'_, BoState> {
        self.0.state.lock().unwrap()
    }

    /// Kernel handle of the object
    pub fn handle(&self) -> GemHandle {
        self.0.handle
    }

    /// Kind the buffer was allocated as
    pub fn kind(&self) -> BufferKind {
        self.0.kind
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.state().width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.state().height
    }

    /// Color depth
    pub fn depth(&self) -> u32 {
        self.state().depth
    }

    /// Bits per pixel
    pub fn bpp(&self) -> u32 {
        self.state().bpp
    }

    /// Row stride in bytes
    pub fn pitch(&self) -> u32 {
        self.state().pitch
    }

    /// Size of the current geometry in bytes
    pub fn size(&self) -> u64 {
        self.state().size
    }

    /// Size the kernel allocated initially, in bytes
    pub fn original_size(&self) -> u64 {
        self.0.original_size
    }

    /// Attached framebuffer, if any
    pub fn framebuffer(&self) -> Option<framebuffer::Handle> {
        self.state().fb
    }

    /// Whether a dma-buf is currently exported
    pub fn has_dmabuf(&self) -> bool {
        self.state().dmabuf.is_some()
    }

    /// Number of live references
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Flink name of the object, created on first use
    pub fn name(&self) -> Result<u32, Error> {
        let mut state = self.state();
        if let Some(name) = state.name {
            return Ok(name);
        }
        let name = self.0.device.kms.flink(self.0.handle).map_err(|err| {
            error!(handle = ?self.0.handle, ?err, "Failed to flink buffer object");
            Error::Flink(err)
        })?;
        state.name = Some(name);
        Ok(name)
    }

    /// Map the whole original allocation into memory.
    ///
    /// The mapping is created once and stays valid, at the same address, until the buffer
    /// object is destroyed, regardless of resizes.
    #[profiling::function]
    pub fn map(&self) -> Result<NonNull<u8>, Error> {
        let mut state = self.state();
        if let Some(Mapping(ptr)) = state.map {
            return Ok(ptr);
        }
        let ptr = self
            .0
            .device
            .kms
            .map_dumb(self.0.handle, self.0.original_size as usize)
            .map_err(|err| {
                error!(handle = ?self.0.handle, ?err, "Failed to map buffer object");
                Error::Map(err)
            })?;
        state.map = Some(Mapping(ptr));
        Ok(ptr)
    }

    /// Current mapping, without creating one
    pub fn mapping(&self) -> Option<NonNull<u8>> {
        self.state().map.map(|Mapping(ptr)| ptr)
    }

    /// Create a scanout framebuffer for the current geometry.
    ///
    /// If the kernel rejects a format with alpha, the device stops trying alpha formats
    /// and falls back to the opaque variant for this and every later buffer.
    ///
    /// Panics if a framebuffer is already attached.
    #[instrument(
        level = "debug",
        parent = &self.0.device.span,
        skip(self),
        fields(handle = ?self.0.handle)
    )]
    pub fn attach_framebuffer(&self) -> Result<framebuffer::Handle, Error> {
        let device = &self.0.device;
        let mut state = self.state();
        assert!(state.fb.is_none(), "buffer object already has a framebuffer attached");

        let mut info = FramebufferInfo {
            handle: self.0.handle,
            width: state.width,
            height: state.height,
            pitch: state.pitch,
            depth: state.depth,
            bpp: state.bpp,
        };
        let opaque_depth = fourcc_for(info.depth, info.bpp)
            .filter(|&format| has_alpha(format))
            .and_then(get_opaque)
            .and_then(depth_bpp)
            .map(|(depth, _)| depth);
        if let Some(depth) = opaque_depth {
            if !device.alpha_supported.load(Ordering::SeqCst) {
                info.depth = depth;
            }
        }

        let fb = match device.kms.add_framebuffer(&info) {
            Ok(fb) => fb,
            Err(err) => match opaque_depth {
                Some(depth) if device.alpha_supported.swap(false, Ordering::SeqCst) => {
                    warn!(
                        ?err,
                        depth,
                        "Framebuffers with alpha are not supported, falling back to an opaque \
                         format. Transparency will be lost."
                    );
                    info.depth = depth;
                    device.kms.add_framebuffer(&info).map_err(Error::AddFramebuffer)?
                }
                _ => {
                    warn!(?err, "Failed to add framebuffer");
                    return Err(Error::AddFramebuffer(err));
                }
            },
        };

        state.fb = Some(fb);
        Ok(fb)
    }

    /// Remove the attached framebuffer.
    ///
    /// Panics if no framebuffer is attached.
    pub fn detach_framebuffer(&self) -> Result<(), Error> {
        let mut state = self.state();
        let fb = state.fb.expect("buffer object has no framebuffer attached");
        self.0.device.kms.destroy_framebuffer(fb).map_err(|err| {
            error!(handle = ?self.0.handle, ?fb, ?err, "Failed to remove framebuffer");
            Error::RemoveFramebuffer(err)
        })?;
        state.fb = None;
        Ok(())
    }

    /// Change the geometry without reallocating.
    ///
    /// Fails, leaving the buffer untouched, if the new geometry needs more memory than
    /// the original allocation holds. Panics if a framebuffer is attached.
    pub fn resize(&self, width: u32, height: u32) -> Result<(), Error> {
        let mut state = self.state();
        assert!(state.fb.is_none(), "resizing a buffer object that has a framebuffer attached");

        // the last row only needs its pixels, not the whole stride
        let geometry = aligned_pitch(width, state.bpp).and_then(|pitch| {
            let row = width as u64 * bytes_per_pixel(state.bpp) as u64;
            let size = match height {
                0 => 0,
                h => (h as u64 - 1).checked_mul(pitch as u64)?.checked_add(row)?,
            };
            Some((pitch, size))
        });
        let (pitch, required) = match geometry {
            Some((pitch, size)) if size <= self.0.original_size => (pitch, size),
            _ => {
                let required = geometry.map_or(u64::MAX, |(_, size)| size);
                debug!(
                    handle = ?self.0.handle,
                    required,
                    available = self.0.original_size,
                    "Buffer object too small for new geometry"
                );
                return Err(Error::ResizeTooLarge {
                    required,
                    available: self.0.original_size,
                });
            }
        };

        state.width = width;
        state.height = height;
        state.pitch = pitch;
        state.size = required;
        Ok(())
    }

    /// Export the object as a dma-buf for external synchronization.
    ///
    /// Panics if a dma-buf is already exported.
    pub fn export_dmabuf(&self) -> Result<(), Error> {
        let mut state = self.state();
        assert!(state.dmabuf.is_none(), "buffer object already exported a dma-buf");
        let fd = self.0.device.kms.export_prime(self.0.handle).map_err(|err| {
            error!(handle = ?self.0.handle, ?err, "Failed to export dma-buf");
            Error::Export(err)
        })?;
        state.dmabuf = Some(fd);
        Ok(())
    }

    /// Close the exported dma-buf.
    ///
    /// Panics if none is exported.
    pub fn close_dmabuf(&self) {
        let mut state = self.state();
        assert!(state.dmabuf.is_some(), "buffer object has no dma-buf to close");
        state.dmabuf = None;
    }

    /// Wait until the CPU may access the buffer for `op`.
    ///
    /// Only does something while a dma-buf is exported. Waits for as long as it takes,
    /// logging a warning whenever the configured timeout passes.
    #[profiling::function]
    pub fn cpu_prepare(&self, op: GemOp) -> Result<(), Error> {
        let state = self.state();
        let Some(dmabuf) = state.dmabuf.as_ref() else {
            return Ok(());
        };
        let device = &self.0.device;
        let write = op.contains(GemOp::WRITE);
        loop {
            match device.kms.wait_dmabuf(dmabuf.as_fd(), write, device.dmabuf_timeout) {
                Ok(true) => return Ok(()),
                Ok(false) => warn!(
                    handle = ?self.0.handle,
                    timeout = ?device.dmabuf_timeout,
                    "Timed out waiting for dma-buf, still waiting"
                ),
                Err(err) => {
                    error!(handle = ?self.0.handle, ?err, "Failed to wait for dma-buf");
                    return Err(Error::Sync(err));
                }
            }
        }
    }

    /// Write back and invalidate CPU caches after an access for `op`
    #[profiling::function]
    pub fn cpu_finish(&self, op: GemOp) -> Result<(), Error> {
        let state = self.state();
        let Some(Mapping(ptr)) = state.map else {
            return Ok(());
        };
        trace!(handle = ?self.0.handle, ?op, "Flushing CPU access");
        // SAFETY: the mapping covers the original allocation and lives as long as `self`.
        let res = unsafe { self.0.device.kms.sync_mapping(ptr, self.0.original_size as usize) };
        res.map_err(Error::Sync)
    }

    /// Zero the contents of the current geometry
    pub fn clear(&self) -> Result<(), Error> {
        let ptr = self.map()?;
        self.cpu_prepare(GemOp::WRITE)?;
        let size = self.size() as usize;
        // SAFETY: `size` never exceeds the original allocation, all of which is mapped.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        self.cpu_finish(GemOp::WRITE)
    }
}
