//! Client visible double-buffering slots

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use drm::control::framebuffer;

use crate::pixmap::Pixmap;

/// Role of a buffer in the double-buffering protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attachment {
    /// Front buffer of the left (or only) eye, the drawable itself
    FrontLeft,
    /// Back buffer of the left (or only) eye
    BackLeft,
    /// Front buffer of the right eye
    FrontRight,
    /// Back buffer of the right eye
    BackRight,
    /// Fake front buffer of the left eye
    FakeFrontLeft,
    /// Fake front buffer of the right eye
    FakeFrontRight,
    /// Depth buffer
    Depth,
    /// Stencil buffer
    Stencil,
    /// Combined depth and stencil buffer
    DepthStencil,
}

#[derive(Debug)]
struct BufferState {
    name: u32,
    previous_canflip: Option<bool>,
}

pub(super) struct BufferInner {
    attachment: Attachment,
    format: u32,
    cpp: u32,
    pixmap: Pixmap,
    state: Mutex<BufferState>,
}

impl fmt::Debug for BufferInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dri2Buffer")
            .field("attachment", &self.attachment)
            .field("format", &self.format)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.pixmap.release_external();
    }
}

/// A buffer handed out to a DRI2 client
///
/// Cloning takes a reference. Once the last reference is gone, the pixmap is no longer
/// registered for external access and the buffer's own reference to it is dropped.
#[derive(Debug, Clone)]
pub struct Dri2Buffer(pub(super) Arc<BufferInner>);

impl PartialEq for Dri2Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Dri2Buffer {}

impl Dri2Buffer {
    /// Wrap `pixmap`, which has to be registered for external access already
    pub(super) fn new(attachment: Attachment, format: u32, name: u32, pixmap: Pixmap) -> Dri2Buffer {
        let cpp = (pixmap.bpp() + 7) / 8;
        Dri2Buffer(Arc::new(BufferInner {
            attachment,
            format,
            cpp,
            pixmap,
            state: Mutex::new(BufferState {
                name,
                previous_canflip: None,
            }),
        }))
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.0.state.lock().unwrap()
    }

    /// Attachment of the buffer
    pub fn attachment(&self) -> Attachment {
        self.0.attachment
    }

    /// Format requested by the client
    pub fn format(&self) -> u32 {
        self.0.format
    }

    /// Bytes per pixel
    pub fn cpp(&self) -> u32 {
        self.0.cpp
    }

    /// Row stride in bytes
    pub fn pitch(&self) -> u32 {
        self.0.pixmap.pitch()
    }

    /// Flink name the client opens the buffer by
    pub fn name(&self) -> u32 {
        self.state().name
    }

    /// Pixmap wrapped by the buffer
    pub fn pixmap(&self) -> &Pixmap {
        &self.0.pixmap
    }

    /// Framebuffer of the wrapped buffer object, if one is attached
    pub fn framebuffer(&self) -> Option<framebuffer::Handle> {
        self.0.pixmap.bo().and_then(|bo| bo.framebuffer())
    }

    /// Whether the drawable could be flipped the last time this buffer was swapped
    pub fn previous_canflip(&self) -> Option<bool> {
        self.state().previous_canflip
    }

    pub(super) fn set_previous_canflip(&self, canflip: bool) {
        self.state().previous_canflip = Some(canflip);
    }

    /// Number of live references
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub(super) fn exchange_names(a: &Dri2Buffer, b: &Dri2Buffer) {
        if a == b {
            return;
        }
        let mut a = a.state();
        let mut b = b.state();
        std::mem::swap(&mut a.name, &mut b.name);
    }
}
