//! Page-flip submission and completion
//!
//! The swap machinery in [`crate::dri2`] does not talk to crtcs directly. It hands a
//! framebuffer and a [`SubmissionId`] to a [`PageFlipBackend`] and later gets the id back
//! in a [`Completion`] once the kernel reports the flip. The kernel event itself only
//! names the crtc that flipped, so the backend keeps the crtc to submission mapping.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use drm::control::{crtc, framebuffer};
use smallvec::SmallVec;
use tracing::{debug, info_span, instrument, trace, warn};

use super::{KmsDevice, KmsEvent};

/// Identifier of a submitted swap or wait, unique per screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(pub u64);

/// A page flip could not be queued on every crtc
#[derive(thiserror::Error, Debug)]
#[error("Page flip failed after queueing {queued} crtc(s)")]
pub struct FlipError {
    /// Number of crtcs that did get a flip queued before or after the failure
    pub queued: usize,
    /// The last kernel error
    #[source]
    pub source: io::Error,
}

/// Something the kernel finished on behalf of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// One crtc finished flipping
    PageFlip {
        /// Submission the flip belonged to
        id: SubmissionId,
        /// Crtc that flipped
        crtc: crtc::Handle,
        /// Frame counter
        frame: u32,
        /// Timestamp of the flip
        time: Duration,
    },
    /// A requested vblank was reached
    Vblank {
        /// Submission waiting for the vblank
        id: SubmissionId,
        /// Frame counter
        frame: u32,
        /// Timestamp of the vblank
        time: Duration,
    },
}

/// The primitives the mode-setting layer has to provide for presentation
pub trait PageFlipBackend {
    /// Whether [`Completion::PageFlip`] events will be delivered for queued flips
    fn uses_flip_events(&self) -> bool;

    /// Queue a flip to `fb` on every enabled crtc.
    ///
    /// Returns the number of crtcs a flip was queued on. No rollback happens if only some
    /// crtcs fail, the error reports how many were queued anyway.
    fn page_flip(&mut self, fb: framebuffer::Handle, id: SubmissionId) -> Result<usize, FlipError>;

    /// Read pending kernel events without blocking
    fn dispatch_events(&mut self) -> io::Result<Vec<Completion>>;

    /// Block until at least one kernel event arrived and dispatch it
    fn wait_for_event(&mut self) -> io::Result<Vec<Completion>>;

    /// Current `(ust, msc)` pair, `None` if vblank queries are not supported
    fn query_msc(&self) -> io::Result<Option<(u64, u64)>>;

    /// Deliver a [`Completion::Vblank`] for `id` once `target_msc` is reached
    fn queue_vblank(&mut self, target_msc: u64, id: SubmissionId) -> io::Result<()>;
}

/// [`PageFlipBackend`] flipping a set of crtcs through the legacy page-flip ioctl
#[derive(Debug)]
pub struct KmsFlipper {
    kms: Arc<dyn KmsDevice>,
    crtcs: SmallVec<[crtc::Handle; 4]>,
    flip_events: bool,
    vblank_query: bool,
    in_flight: HashMap<crtc::Handle, SubmissionId>,
    span: tracing::Span,
}

impl KmsFlipper {
    /// Create a new flipper for `crtcs`.
    ///
    /// `flip_events` and `vblank_query` come from the SoC backend of the device.
    pub fn new(
        kms: Arc<dyn KmsDevice>,
        crtcs: impl IntoIterator<Item = crtc::Handle>,
        flip_events: bool,
        vblank_query: bool,
    ) -> KmsFlipper {
        KmsFlipper {
            kms,
            crtcs: crtcs.into_iter().collect(),
            flip_events,
            vblank_query,
            in_flight: HashMap::new(),
            span: info_span!("armsoc_flip"),
        }
    }

    /// Replace the set of enabled crtcs, e.g. after a mode set
    pub fn set_crtcs(&mut self, crtcs: impl IntoIterator<Item = crtc::Handle>) {
        self.crtcs = crtcs.into_iter().collect();
    }

    /// Currently enabled crtcs
    pub fn crtcs(&self) -> &[crtc::Handle] {
        &self.crtcs
    }

    /// Number of crtcs with a flip event outstanding
    pub fn flips_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn translate(&mut self, events: Vec<KmsEvent>) -> Vec<Completion> {
        events
            .into_iter()
            .filter_map(|event| match event {
                KmsEvent::PageFlip { crtc, frame, time } => match self.in_flight.remove(&crtc) {
                    Some(id) => Some(Completion::PageFlip { id, crtc, frame, time }),
                    None => {
                        trace!(?crtc, "Ignoring page-flip event without submission");
                        None
                    }
                },
                KmsEvent::Vblank {
                    frame, time, user_data, ..
                } => Some(Completion::Vblank {
                    id: SubmissionId(user_data as u64),
                    frame,
                    time,
                }),
            })
            .collect()
    }
}

impl PageFlipBackend for KmsFlipper {
    fn uses_flip_events(&self) -> bool {
        self.flip_events
    }

    #[instrument(level = "trace", parent = &self.span, skip(self))]
    #[profiling::function]
    fn page_flip(&mut self, fb: framebuffer::Handle, id: SubmissionId) -> Result<usize, FlipError> {
        let mut queued = 0;
        let mut failure = None;

        // if we can flip, we are fullscreen, so every crtc shows this buffer
        for &crtc in self.crtcs.iter() {
            match self.kms.page_flip(crtc, fb, self.flip_events) {
                Ok(()) => {
                    queued += 1;
                    if self.flip_events {
                        self.in_flight.insert(crtc, id);
                    }
                }
                Err(err) => {
                    warn!(?crtc, ?err, "Flip queue failed");
                    failure = Some(err);
                }
            }
        }

        match failure {
            Some(source) => Err(FlipError { queued, source }),
            None => {
                trace!(queued, "Page flip queued");
                Ok(queued)
            }
        }
    }

    fn dispatch_events(&mut self) -> io::Result<Vec<Completion>> {
        let events = self.kms.receive_events()?;
        Ok(self.translate(events))
    }

    fn wait_for_event(&mut self) -> io::Result<Vec<Completion>> {
        loop {
            if self.kms.wait_for_events(None)? {
                let completions = self.dispatch_events()?;
                if !completions.is_empty() {
                    return Ok(completions);
                }
            }
        }
    }

    fn query_msc(&self) -> io::Result<Option<(u64, u64)>> {
        if !self.vblank_query {
            return Ok(None);
        }
        let reply = self.kms.query_vblank()?;
        Ok(Some((reply.time.as_micros() as u64, reply.sequence as u64)))
    }

    fn queue_vblank(&mut self, target_msc: u64, id: SubmissionId) -> io::Result<()> {
        debug!(target_msc, ?id, "Queueing vblank event");
        self.kms.request_vblank_event(target_msc as u32, id.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use drm::control::framebuffer;

    use super::{Completion, KmsFlipper, PageFlipBackend, SubmissionId};
    use crate::backend::drm::test::{crtc, fb, DummyKms};
    use crate::backend::drm::{FramebufferInfo, KmsDevice};

    fn framebuffer(kms: &DummyKms) -> framebuffer::Handle {
        let gem = kms.create_dumb(64, 64, 32, 0).unwrap();
        kms.add_framebuffer(&FramebufferInfo {
            handle: gem.handle,
            width: 64,
            height: 64,
            pitch: gem.pitch,
            depth: 24,
            bpp: 32,
        })
        .unwrap()
    }

    #[test]
    fn flips_every_crtc_and_maps_events_back() {
        let kms = Arc::new(DummyKms::new("exynos"));
        let mut flipper = KmsFlipper::new(kms.clone(), [crtc(1), crtc(2)], true, true);
        let fb = framebuffer(&kms);

        assert_eq!(flipper.page_flip(fb, SubmissionId(3)).unwrap(), 2);
        assert_eq!(flipper.flips_in_flight(), 2);
        assert_eq!(kms.stats().flips, 2);

        let completions = flipper.dispatch_events().unwrap();
        assert_eq!(completions.len(), 2);
        assert!(completions
            .iter()
            .all(|c| matches!(c, Completion::PageFlip { id: SubmissionId(3), .. })));
        assert_eq!(flipper.flips_in_flight(), 0);
    }

    #[test]
    fn partial_failure_reports_queued_crtcs() {
        let kms = Arc::new(DummyKms::new("exynos"));
        kms.fail_flip_on(crtc(3));
        let mut flipper = KmsFlipper::new(kms.clone(), [crtc(1), crtc(2), crtc(3)], true, true);
        let fb = framebuffer(&kms);

        let err = flipper.page_flip(fb, SubmissionId(1)).unwrap_err();
        assert_eq!(err.queued, 2);
        assert_eq!(flipper.flips_in_flight(), 2);
        assert_eq!(kms.stats().flips, 2);
    }

    #[test]
    fn unknown_framebuffer_queues_nothing() {
        let kms = Arc::new(DummyKms::new("exynos"));
        let mut flipper = KmsFlipper::new(kms.clone(), [crtc(1), crtc(2)], true, true);

        let err = flipper.page_flip(fb(7), SubmissionId(1)).unwrap_err();
        assert_eq!(err.queued, 0);
        assert_eq!(flipper.flips_in_flight(), 0);
        assert_eq!(kms.stats().flips, 0);
    }

    #[test]
    fn no_tracking_without_flip_events() {
        let kms = Arc::new(DummyKms::new("pl111"));
        let mut flipper = KmsFlipper::new(kms.clone(), [crtc(1)], false, false);
        let fb = framebuffer(&kms);

        assert_eq!(flipper.page_flip(fb, SubmissionId(1)).unwrap(), 1);
        assert_eq!(kms.stats().flips, 1);
        assert_eq!(flipper.flips_in_flight(), 0);
        assert!(flipper.dispatch_events().unwrap().is_empty());
        assert_eq!(flipper.query_msc().unwrap(), None);
    }
}
