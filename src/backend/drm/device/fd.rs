use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use drm::buffer::{Buffer as DrmBuffer, DrmFourcc, Handle as GemHandle};
use drm::control::{
    crtc, framebuffer, Device as ControlDevice, Event, PageFlipFlags,
};
use drm::{Device as BasicDevice, VblankWaitFlags, VblankWaitTarget};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::mm::{mmap, msync, munmap, MapFlags, MsyncFlags, ProtFlags};
use tracing::{error, info, trace};

use super::{FramebufferInfo, GemAllocation, KmsDevice, KmsEvent, VblankReply};
use crate::backend::allocator::format::fourcc_for;
use crate::utils::{DevPath, DeviceFd};

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: DeviceFd,
    privileged: AtomicBool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.fd.dev_path());
        if self.privileged.load(Ordering::SeqCst) {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd`.
    ///
    /// Unlike opening the node directly, master state is not touched here. It is managed by
    /// the [`ConnectionRegistry`](crate::backend::drm::ConnectionRegistry), which only
    /// talks to the kernel on the first acquire and the last release. Whatever is still
    /// held when the last clone is dropped gets released.
    pub fn new(fd: DeviceFd) -> DrmDeviceFd {
        DrmDeviceFd(Arc::new(InternalDrmDeviceFd {
            fd,
            privileged: AtomicBool::new(false),
        }))
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

mod exynos {
    #[repr(C)]
    #[derive(Debug)]
    pub struct DrmExynosGemCreate {
        pub size: u64,
        pub flags: u32,
        pub handle: u32,
    }

    // DRM_COMMAND_BASE + DRM_EXYNOS_GEM_CREATE
    nix::ioctl_readwrite!(gem_create, b'd', 0x40, DrmExynosGemCreate);
}

fn gem_handle(raw: u32) -> io::Result<GemHandle> {
    drm::control::from_u32(raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "kernel returned null handle"))
}

// Wrapper handing the legacy ADDFB path what it needs from a GEM object
struct GemFramebuffer<'a>(&'a FramebufferInfo);

impl<'a> DrmBuffer for GemFramebuffer<'a> {
    fn size(&self) -> (u32, u32) {
        (self.0.width, self.0.height)
    }

    fn format(&self) -> DrmFourcc {
        fourcc_for(self.0.depth, self.0.bpp).unwrap_or(DrmFourcc::Xrgb8888)
    }

    fn pitch(&self) -> u32 {
        self.0.pitch
    }

    fn handle(&self) -> GemHandle {
        self.0.handle
    }
}

impl KmsDevice for DrmDeviceFd {
    fn device_path(&self) -> Option<PathBuf> {
        DevPath::dev_path(self)
    }

    fn driver_name(&self) -> io::Result<String> {
        let driver = self.get_driver()?;
        Ok(driver.name().to_string_lossy().into_owned())
    }

    fn acquire_master(&self) -> io::Result<()> {
        self.acquire_master_lock()?;
        self.0.privileged.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release_master(&self) -> io::Result<()> {
        self.release_master_lock()?;
        self.0.privileged.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32, flags: u32) -> io::Result<GemAllocation> {
        let reply = drm_ffi::mode::dumbbuffer::create(self.as_fd(), width, height, bpp, flags)?;
        Ok(GemAllocation {
            handle: gem_handle(reply.handle)?,
            pitch: reply.pitch,
            size: reply.size,
        })
    }

    fn create_exynos_gem(&self, size: u64, flags: u32) -> io::Result<GemHandle> {
        let mut arg = exynos::DrmExynosGemCreate {
            size,
            flags,
            handle: 0,
        };
        // SAFETY: `arg` has the layout of `struct drm_exynos_gem_create` and outlives the call
        unsafe { exynos::gem_create(self.as_raw_fd(), &mut arg) }?;
        gem_handle(arg.handle)
    }

    fn destroy_dumb(&self, handle: GemHandle) -> io::Result<()> {
        drm_ffi::mode::dumbbuffer::destroy(self.as_fd(), u32::from(handle))?;
        Ok(())
    }

    fn map_dumb(&self, handle: GemHandle, len: usize) -> io::Result<NonNull<u8>> {
        let reply = drm_ffi::mode::dumbbuffer::map(self.as_fd(), u32::from(handle), 0, 0)?;
        // SAFETY: a fresh shared mapping of the offset handed out by the kernel,
        // nothing else refers to the returned range yet.
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                self,
                reply.offset,
            )?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: guaranteed by the caller
        unsafe { munmap(ptr.as_ptr().cast(), len)? };
        Ok(())
    }

    unsafe fn sync_mapping(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: guaranteed by the caller
        unsafe { msync(ptr.as_ptr().cast(), len, MsyncFlags::SYNC | MsyncFlags::INVALIDATE)? };
        Ok(())
    }

    fn add_framebuffer(&self, info: &FramebufferInfo) -> io::Result<framebuffer::Handle> {
        ControlDevice::add_framebuffer(self, &GemFramebuffer(info), info.depth, info.bpp)
    }

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        ControlDevice::destroy_framebuffer(self, fb)
    }

    fn flink(&self, handle: GemHandle) -> io::Result<u32> {
        Ok(drm_ffi::gem::flink(self.as_fd(), u32::from(handle))?.name)
    }

    fn export_prime(&self, handle: GemHandle) -> io::Result<OwnedFd> {
        self.buffer_to_prime_fd(handle, (libc::O_CLOEXEC | libc::O_RDWR) as u32)
    }

    fn wait_dmabuf(&self, dmabuf: BorrowedFd<'_>, write: bool, timeout: Duration) -> io::Result<bool> {
        let flags = if write { PollFlags::OUT } else { PollFlags::IN };
        let timeout = timeout.as_millis().min(i32::MAX as u128) as i32;
        loop {
            let mut fds = [PollFd::new(&dmabuf, flags)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(rustix::io::Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle, event: bool) -> io::Result<()> {
        let flags = if event {
            PageFlipFlags::EVENT
        } else {
            PageFlipFlags::empty()
        };
        ControlDevice::page_flip(self, crtc, fb, flags, None)
    }

    fn receive_events(&self) -> io::Result<Vec<KmsEvent>> {
        let mut events = Vec::new();
        for event in ControlDevice::receive_events(self)? {
            match event {
                Event::PageFlip(event) => events.push(KmsEvent::PageFlip {
                    crtc: event.crtc,
                    frame: event.frame,
                    time: event.duration,
                }),
                Event::Vblank(event) => events.push(KmsEvent::Vblank {
                    crtc: event.crtc,
                    frame: event.frame,
                    time: event.time,
                    user_data: event.user_data,
                }),
                _ => trace!("Got an unhandled event on device '{:?}'.", DevPath::dev_path(self)),
            }
        }
        Ok(events)
    }

    fn wait_for_events(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout = timeout
            .map(|t| t.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        loop {
            let mut fds = [PollFd::new(self, PollFlags::IN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(rustix::io::Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn query_vblank(&self) -> io::Result<VblankReply> {
        let reply = self.wait_vblank(VblankWaitTarget::Relative(0), VblankWaitFlags::empty(), 0, 0)?;
        Ok(VblankReply {
            sequence: reply.frame(),
            time: reply.time().unwrap_or_default(),
        })
    }

    fn request_vblank_event(&self, target: u32, user_data: usize) -> io::Result<()> {
        self.wait_vblank(
            VblankWaitTarget::Absolute(target),
            VblankWaitFlags::EVENT,
            0,
            user_data,
        )?;
        Ok(())
    }
}
