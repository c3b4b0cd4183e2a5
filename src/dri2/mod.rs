//! DRI2 double-buffering
//!
//! A [`Dri2Screen`] implements the driver side of the DRI2 protocol: it hands out
//! [`Dri2Buffer`]s for drawables, copies between them and presents back buffers.
//!
//! Presenting a back buffer either flips the display to it, if the drawable covers the
//! whole screen and both buffers have a framebuffer of the same size, or copies it into
//! the front buffer otherwise. Flips complete asynchronously: the screen keeps every
//! outstanding swap in a table keyed by [`SubmissionId`] and finishes it once the kernel
//! reported a completed flip for every crtc it was queued on. Call
//! [`Dri2Screen::dispatch_events`] whenever the drm node becomes readable, e.g. from a
//! [`KmsEventSource`](crate::backend::drm::KmsEventSource).
//!
//! Everything the screen needs to know about the windowing system is asked from a
//! [`DrawableHost`], which also receives the completion notifications.

use std::collections::HashMap;
use std::io;

use tracing::{debug, error, info_span, instrument, trace, warn};

use crate::backend::allocator::{Device, Error as BoError};
use crate::backend::drm::{Completion, PageFlipBackend, SubmissionId};
use crate::config::Options;
use crate::pixmap::{self, Pixmap, PixmapBridge, Rectangle, UsageHint};

mod buffer;
mod swap;

pub use self::buffer::{Attachment, Dri2Buffer};
pub use self::swap::SwapKind;

use self::swap::SwapCommand;

/// Identifier of a drawable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrawableId(pub u32);

/// Identifier of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

/// Kind of a drawable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawableKind {
    /// A window
    Window,
    /// A pixmap
    Pixmap,
}

/// What the screen needs to know about a drawable
#[derive(Debug, Clone)]
pub struct Drawable {
    /// Identifier of the drawable
    pub id: DrawableId,
    /// Window or pixmap
    pub kind: DrawableKind,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Color depth
    pub depth: u32,
    /// Bits per pixel
    pub bpp: u32,
    /// Pixmap holding the contents, the window pixmap for windows
    pub pixmap: Pixmap,
}

/// Notification that a scheduled swap has completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapEvent {
    /// Client that scheduled the swap
    pub client: ClientId,
    /// Drawable that was swapped
    pub drawable: DrawableId,
    /// How the swap was carried out
    pub kind: SwapKind,
    /// Frame counter of the completion, 0 if unknown
    pub frame: u64,
    /// Timestamp of the completion in microseconds, 0 if unknown
    pub ust: u64,
    /// Value passed to [`Dri2Screen::schedule_swap`]
    pub user_data: u64,
}

/// Notification that a frame counter target was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitMscEvent {
    /// Client waiting
    pub client: ClientId,
    /// Drawable waited on
    pub drawable: DrawableId,
    /// Frame counter reached
    pub msc: u64,
    /// Timestamp in microseconds
    pub ust: u64,
    /// Value passed to [`Dri2Screen::schedule_wait_msc`]
    pub user_data: u64,
}

/// The windowing system side of DRI2
pub trait DrawableHost {
    /// Look up a drawable, `None` if it was destroyed in the meantime
    fn lookup_drawable(&self, id: DrawableId) -> Option<Drawable>;

    /// Whether the windowing system allows flipping to `drawable`, i.e. whether it is a
    /// fullscreen, unobstructed window
    fn can_flip(&self, drawable: &Drawable) -> bool;

    /// A swap has completed
    fn swap_complete(&mut self, event: SwapEvent);

    /// A frame counter target was reached
    fn wait_msc_complete(&mut self, event: WaitMscEvent);
}

/// Errors of the DRI2 layer
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The pixmap of a buffer is not backed by a buffer object
    #[error("The pixmap is not backed by a buffer object")]
    NotAccelerated,
    /// A pixmap operation failed
    #[error(transparent)]
    Pixmap(#[from] pixmap::Error),
    /// A buffer object operation failed
    #[error(transparent)]
    BufferObject(#[from] BoError),
    /// Talking to the kernel failed
    #[error("Failed to process drm events")]
    Kms(#[from] io::Error),
}

#[derive(Debug)]
struct WaitCommand {
    client: ClientId,
    drawable: DrawableId,
    user_data: u64,
}

#[derive(Debug)]
enum Pending {
    Swap(SwapCommand),
    WaitMsc(WaitCommand),
}

/// Driver side of DRI2 for one screen
#[derive(Debug)]
pub struct Dri2Screen<B: PageFlipBackend> {
    device: Device,
    bridge: PixmapBridge,
    backend: B,
    options: Options,
    pending: HashMap<SubmissionId, Pending>,
    next_id: u64,
    pending_flips: usize,
    span: tracing::Span,
}

impl<B: PageFlipBackend> Dri2Screen<B> {
    /// Create a new screen allocating from `device` and flipping through `backend`
    pub fn new(device: Device, backend: B, options: Options) -> Dri2Screen<B> {
        Dri2Screen {
            bridge: PixmapBridge::new(device.clone()),
            device,
            backend,
            options,
            pending: HashMap::new(),
            next_id: 1,
            pending_flips: 0,
            span: info_span!("armsoc_dri2"),
        }
    }

    /// The device of the screen
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The pixmap bridge of the screen
    pub fn bridge(&self) -> &PixmapBridge {
        &self.bridge
    }

    /// The page-flip backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the page-flip backend, e.g. to update its crtcs
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Number of swaps that have not completed yet
    pub fn pending_flips(&self) -> usize {
        self.pending_flips
    }

    fn next_submission(&mut self) -> SubmissionId {
        let id = SubmissionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Whether the windowing system currently allows flipping to `drawable`
    fn window_can_flip<H: DrawableHost>(&self, host: &H, drawable: &Drawable) -> bool {
        !self.options.no_flip && drawable.kind == DrawableKind::Window && host.can_flip(drawable)
    }

    /// Create a buffer for `attachment` of `drawable`.
    ///
    /// The front buffer wraps the drawable's own pixmap. `format` is the bits per pixel of
    /// the new buffer, 0 for the drawable's.
    #[instrument(
        level = "debug",
        parent = &self.span,
        skip(self, host, drawable),
        fields(drawable = ?drawable.id)
    )]
    pub fn create_buffer<H: DrawableHost>(
        &mut self,
        host: &H,
        drawable: &Drawable,
        attachment: Attachment,
        format: u32,
    ) -> Result<Dri2Buffer, Error> {
        let canflip = self.window_can_flip(host, drawable);
        let pixmap = if attachment == Attachment::FrontLeft {
            drawable.pixmap.clone()
        } else {
            let bpp = if format != 0 { format } else { drawable.bpp };
            let usage = if canflip {
                UsageHint::Scanout
            } else {
                UsageHint::Backing
            };
            self.bridge
                .create(drawable.width, drawable.height, drawable.depth, bpp, usage)?
        };

        let bo = pixmap.bo().ok_or(Error::NotAccelerated)?;
        let name = bo.name()?;

        if canflip && attachment != Attachment::FrontLeft && bo.framebuffer().is_none() {
            if let Err(err) = bo.attach_framebuffer() {
                warn!(?err, "Failed to add framebuffer to back buffer, falling back to blit");
            }
        }

        self.bridge.register_external(&pixmap);
        debug!(name, ?attachment, "Created DRI2 buffer");
        Ok(Dri2Buffer::new(attachment, format, name, pixmap))
    }

    /// Take another reference on `buffer`
    pub fn reference_buffer(&self, buffer: &Dri2Buffer) -> Dri2Buffer {
        buffer.clone()
    }

    /// Release a reference on `buffer`, destroying it with the last one
    pub fn destroy_buffer(&self, buffer: Dri2Buffer) {
        trace!(name = buffer.name(), refs = buffer.ref_count(), "Releasing DRI2 buffer");
        drop(buffer);
    }

    /// Copy `region` of `src` into `dst`
    #[profiling::function]
    pub fn copy_region(&self, region: &[Rectangle], dst: &Dri2Buffer, src: &Dri2Buffer) -> Result<(), Error> {
        for area in region {
            self.bridge.copy_area(src.pixmap(), dst.pixmap(), *area)?;
        }
        Ok(())
    }

    /// Current `(ust, msc)`, `(0, 0)` if the device does not support vblank queries
    pub fn get_msc(&self) -> Result<(u64, u64), Error> {
        match self.backend.query_msc() {
            Ok(Some(pair)) => Ok(pair),
            Ok(None) => Ok((0, 0)),
            Err(err) => {
                error!(parent: &self.span, ?err, "Failed to query vblank counter");
                Err(err.into())
            }
        }
    }

    /// Notify `client` once the frame counter reaches `target_msc`
    pub fn schedule_wait_msc<H: DrawableHost>(
        &mut self,
        host: &mut H,
        client: ClientId,
        drawable: DrawableId,
        target_msc: u64,
        user_data: u64,
    ) -> Result<(), Error> {
        let (ust, msc) = match self.backend.query_msc()? {
            Some(pair) => pair,
            None => {
                host.wait_msc_complete(WaitMscEvent {
                    client,
                    drawable,
                    msc: 0,
                    ust: 0,
                    user_data,
                });
                return Ok(());
            }
        };
        if msc >= target_msc {
            host.wait_msc_complete(WaitMscEvent {
                client,
                drawable,
                msc,
                ust,
                user_data,
            });
            return Ok(());
        }

        let id = self.next_submission();
        self.backend.queue_vblank(target_msc, id)?;
        self.pending.insert(
            id,
            Pending::WaitMsc(WaitCommand {
                client,
                drawable,
                user_data,
            }),
        );
        Ok(())
    }

    /// Read pending kernel events and complete the swaps and waits they belong to
    #[profiling::function]
    pub fn dispatch_events<H: DrawableHost>(&mut self, host: &mut H) -> Result<(), Error> {
        let completions = self.backend.dispatch_events()?;
        for completion in completions {
            self.handle_completion(host, completion);
        }
        Ok(())
    }

    fn handle_completion<H: DrawableHost>(&mut self, host: &mut H, completion: Completion) {
        match completion {
            Completion::PageFlip { id, frame, time, .. } => {
                let done = match self.pending.get_mut(&id) {
                    Some(Pending::Swap(cmd)) => cmd.flip_done(frame as u64, time.as_micros() as u64),
                    _ => {
                        trace!(parent: &self.span, ?id, "Page flip without pending swap");
                        return;
                    }
                };
                if done {
                    if let Some(Pending::Swap(cmd)) = self.pending.remove(&id) {
                        self.finalize_swap(host, cmd);
                    }
                }
            }
            Completion::Vblank { id, frame, time } => match self.pending.remove(&id) {
                Some(Pending::WaitMsc(wait)) => host.wait_msc_complete(WaitMscEvent {
                    client: wait.client,
                    drawable: wait.drawable,
                    msc: frame as u64,
                    ust: time.as_micros() as u64,
                    user_data: wait.user_data,
                }),
                Some(other) => {
                    self.pending.insert(id, other);
                }
                None => trace!(parent: &self.span, ?id, "Vblank without pending wait"),
            },
        }
    }

    /// Wait for every swap in flight to complete.
    ///
    /// Swaps hold references to buffers, they have to be done before the device goes away.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn close<H: DrawableHost>(&mut self, host: &mut H) -> Result<(), Error> {
        while self.pending_flips > 0 {
            debug!(pending = self.pending_flips, "Waiting for swaps in flight");
            for completion in self.backend.wait_for_event()? {
                self.handle_completion(host, completion);
            }
        }
        Ok(())
    }
}
