//! Kernel mode-setting plumbing
//!
//! This module holds everything that talks to a DRM device node directly:
//!
//! - [`KmsDevice`], the set of ioctls the rest of the crate is built on, and
//!   [`DrmDeviceFd`], its implementation for a real device node
//! - [`ConnectionRegistry`], sharing one open node (and its master state) between screens
//! - [`KmsFlipper`], queueing page flips on a set of crtcs and mapping the resulting
//!   kernel events back to the swap they belong to
//! - [`KmsEventSource`], a calloop source firing whenever the node has events to read
//!
//! ## Event dispatching
//!
//! Page-flip and vblank completions arrive as readable events on the device node. Insert a
//! [`KmsEventSource`] into your event loop and call
//! [`Dri2Screen::dispatch_events`](crate::dri2::Dri2Screen::dispatch_events) from its
//! callback:
//!
//! ```rust,ignore
//! let source = KmsEventSource::new(device_fd.clone());
//! event_loop.handle().insert_source(source, |_, _, state| {
//!     if let Err(err) = state.screen.dispatch_events(&mut state.host) {
//!         tracing::error!(?err, "Failed to dispatch drm events");
//!     }
//! })?;
//! ```

use std::io;

use calloop::{
    generic::Generic, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory,
};

mod device;
pub mod error;
mod flip;
mod registry;

pub use self::device::{
    DrmDeviceFd, FramebufferInfo, GemAllocation, KmsDevice, KmsEvent, VblankReply,
};
pub use self::error::{AccessError, Error};
pub use self::flip::{Completion, FlipError, KmsFlipper, PageFlipBackend, SubmissionId};
pub use self::registry::{Connection, ConnectionRegistry};

/// Event source signaling pending events on a drm node
///
/// The source does not read the events itself, they belong to whoever owns the
/// [`PageFlipBackend`] of the node.
#[derive(Debug)]
pub struct KmsEventSource {
    fd: Generic<DrmDeviceFd>,
}

impl KmsEventSource {
    /// Watch `fd` for readable events
    pub fn new(fd: DrmDeviceFd) -> KmsEventSource {
        KmsEventSource {
            fd: Generic::new(fd, Interest::READ, Mode::Level),
        }
    }
}

impl EventSource for KmsEventSource {
    type Event = ();
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        self.fd.process_events(readiness, token, |_, _| {
            callback((), &mut ());
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.fd.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.fd.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.fd.unregister(poll)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::io::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use calloop::EventLoop;

    use super::{DrmDeviceFd, KmsEventSource};
    use crate::utils::DeviceFd;

    #[test]
    fn fires_once_the_node_is_readable() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let fd = DrmDeviceFd::new(DeviceFd::from(OwnedFd::from(reader)));

        let mut event_loop = EventLoop::<usize>::try_new().unwrap();
        event_loop
            .handle()
            .insert_source(KmsEventSource::new(fd), |(), _, fired| *fired += 1)
            .unwrap();

        let mut fired = 0;
        event_loop.dispatch(Some(Duration::ZERO), &mut fired).unwrap();
        assert_eq!(fired, 0);

        writer.write_all(&[1]).unwrap();
        event_loop
            .dispatch(Some(Duration::from_secs(1)), &mut fired)
            .unwrap();
        assert_eq!(fired, 1);
    }
}
