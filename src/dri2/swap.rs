//! Presenting back buffers

use tracing::{debug, instrument, trace, warn};

use super::{
    ClientId, Drawable, DrawableHost, DrawableId, DrawableKind, Dri2Buffer, Dri2Screen, Pending, SwapEvent,
};
use crate::backend::allocator::BufferObject;
use crate::backend::drm::PageFlipBackend;
use crate::pixmap::Rectangle;

/// How a swap was carried out
///
/// [`Dri2Screen::schedule_swap`] only reports [`SwapKind::Flip`] and [`SwapKind::Blit`].
/// A completed flip exchanges the buffers as well but is still reported as a flip.
/// [`SwapKind::Exchange`] completes the set of DRI2 completion types for hosts that
/// translate events coming from elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapKind {
    /// The display was flipped to the back buffer
    Flip,
    /// Front and back buffer were exchanged without touching the display
    Exchange,
    /// The back buffer was copied into the front buffer
    Blit,
}

/// A swap waiting for its completion
#[derive(Debug)]
pub(super) struct SwapCommand {
    client: ClientId,
    drawable: DrawableId,
    src: Dri2Buffer,
    dst: Dri2Buffer,
    // the buffer objects are held separately, the slots hand them over on exchange
    src_bo: Option<BufferObject>,
    dst_bo: Option<BufferObject>,
    kind: SwapKind,
    failed: bool,
    fake: bool,
    remaining: usize,
    user_data: u64,
    frame: u64,
    ust: u64,
}

impl SwapCommand {
    /// One crtc finished flipping, returns whether the swap is done
    pub(super) fn flip_done(&mut self, frame: u64, ust: u64) -> bool {
        self.frame = frame;
        self.ust = ust;
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }
}

impl<B: PageFlipBackend> Dri2Screen<B> {
    /// Present `back` in place of `front` for `drawable`.
    ///
    /// The display is flipped to `back` if the windowing system allows it and both
    /// buffers carry a framebuffer of the same size, otherwise `back` is copied into
    /// `front`. Either way `host` is notified exactly once, possibly from a later
    /// [`Dri2Screen::dispatch_events`]. Failures only show up in the log, the swap then
    /// completes without changing the visible frame.
    #[instrument(
        level = "trace",
        parent = &self.span,
        skip(self, host, drawable, front, back),
        fields(drawable = ?drawable.id)
    )]
    #[profiling::function]
    pub fn schedule_swap<H: DrawableHost>(
        &mut self,
        host: &mut H,
        client: ClientId,
        drawable: &Drawable,
        front: &Dri2Buffer,
        back: &Dri2Buffer,
        user_data: u64,
    ) {
        let window_flippable = self.window_can_flip(host, drawable);

        // buffers handed out for the old state have the wrong kind of memory
        let transition = [front, back].iter().any(|buffer| {
            matches!(buffer.previous_canflip(), Some(prev) if prev != window_flippable)
        });
        if transition && drawable.kind == DrawableKind::Window {
            let serial = drawable.pixmap.bump_serial();
            debug!(?serial, flippable = window_flippable, "Flip eligibility changed");
        }
        front.set_previous_canflip(window_flippable);
        back.set_previous_canflip(window_flippable);

        let same_size = front.pixmap().width() == back.pixmap().width()
            && front.pixmap().height() == back.pixmap().height();
        let fb = back.framebuffer().filter(|_| front.framebuffer().is_some());

        let mut cmd = SwapCommand {
            client,
            drawable: drawable.id,
            src: back.clone(),
            dst: front.clone(),
            src_bo: back.pixmap().bo(),
            dst_bo: front.pixmap().bo(),
            kind: SwapKind::Blit,
            failed: false,
            fake: false,
            remaining: 0,
            user_data,
            frame: 0,
            ust: 0,
        };
        self.pending_flips += 1;

        match fb {
            Some(fb) if window_flippable && same_size => {
                cmd.kind = SwapKind::Flip;
                let id = self.next_submission();
                let events = self.backend.uses_flip_events();
                match self.backend.page_flip(fb, id) {
                    Ok(0) => {
                        trace!("No crtc flipped");
                        cmd.fake = true;
                        if let Some(delay) = self.options.post_flip_delay {
                            delay.run();
                        }
                    }
                    Ok(queued) => {
                        if events {
                            cmd.remaining = queued;
                        }
                    }
                    Err(err) => {
                        warn!(?err, "Page flip failed");
                        cmd.failed = true;
                        if events {
                            cmd.remaining = err.queued;
                        }
                    }
                }

                if cmd.remaining > 0 {
                    self.pending.insert(id, Pending::Swap(cmd));
                    return;
                }
            }
            _ => {
                let area = Rectangle::new(0, 0, drawable.width, drawable.height);
                if let Err(err) = self.bridge.copy_area(back.pixmap(), front.pixmap(), area) {
                    warn!(?err, "Blit failed");
                    cmd.failed = true;
                }
            }
        }

        self.finalize_swap(host, cmd);
    }

    pub(super) fn finalize_swap<H: DrawableHost>(&mut self, host: &mut H, cmd: SwapCommand) {
        if host.lookup_drawable(cmd.drawable).is_none() {
            debug!(
                parent: &self.span,
                drawable = ?cmd.drawable,
                "Drawable went away before its swap completed"
            );
        } else {
            if cmd.kind == SwapKind::Flip && !cmd.failed && !cmd.fake {
                Dri2Buffer::exchange_names(&cmd.dst, &cmd.src);
                self.bridge.exchange(cmd.dst.pixmap(), cmd.src.pixmap());
                // the front pixmap now owns what used to be the back buffer
                self.device.set_scanout(cmd.src_bo.clone());
            }
            host.swap_complete(SwapEvent {
                client: cmd.client,
                drawable: cmd.drawable,
                kind: cmd.kind,
                frame: cmd.frame,
                ust: cmd.ust,
                user_data: cmd.user_data,
            });
        }

        trace!(
            parent: &self.span,
            src = ?cmd.src_bo.as_ref().map(|bo| bo.handle()),
            dst = ?cmd.dst_bo.as_ref().map(|bo| bo.handle()),
            "Swap finished"
        );
        drop(cmd);
        self.pending_flips -= 1;
    }
}
