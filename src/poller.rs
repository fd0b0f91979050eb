//! Thin wrapper around the OS readiness-notification facility.
//!
//! The poller registers raw descriptors for readability and reports which of
//! them became ready, using system-level event notification (epoll on Linux)
//! so the listener never scans descriptors individually.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// Readiness observed on a single descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    /// Error and hangup conditions folded together; either way the peer side
    /// of the channel is gone.
    pub hangup: bool,
}

pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
        })
    }

    /// Registers a descriptor for readability notifications.
    ///
    /// The descriptor is keyed by its own value, so events map back to
    /// channels without a separate token table.
    pub fn add(&self, fd: RawFd) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Waits up to `timeout` for readiness events.
    ///
    /// Interrupted waits are retried rather than surfaced, so an empty result
    /// always means the timeout actually expired.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<(RawFd, Readiness)>> {
        loop {
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            ready.push((
                event.token().0 as RawFd,
                Readiness {
                    readable: event.is_readable(),
                    hangup: event.is_error() || event.is_read_closed(),
                },
            ));
        }
        Ok(ready)
    }
}
