//! Per-channel owner contract and channel state.
//!
//! Every managed channel is described by a [`ChannelHandler`] supplied by its
//! owner plus a small amount of listener-side bookkeeping. The listener never
//! interprets the bytes flowing over a channel; all I/O beyond readiness
//! detection happens inside the handler.

use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

/// Owner-side behavior of a single guest channel.
///
/// The listener drives every channel through these four callbacks. Whatever
/// state the implementor carries in `self` is passed unchanged into each
/// invocation, so per-channel context (VM id, socket path, protocol state)
/// lives entirely on the owner's side.
///
/// All callbacks run on the listener thread and must not block: a slow
/// callback stalls every other channel. This is part of the contract with
/// channel owners, not something the listener defends against.
pub trait ChannelHandler: Send {
    /// Produces a fresh pollable descriptor for this channel.
    ///
    /// Called synchronously inside [`Listener::register`] to obtain the first
    /// descriptor, and again after every failure that requires a new one. An
    /// error at registration time propagates to the caller; an error on the
    /// reconnect path drops the channel entirely.
    ///
    /// [`Listener::register`]: crate::listener::Listener::register
    fn create(&self) -> io::Result<RawFd>;

    /// Attempts to complete connection setup for the current descriptor.
    ///
    /// `Ok(true)` means the channel is connected and should be watched for
    /// readability. `Ok(false)` means connecting is not yet possible (e.g.
    /// the guest has not booted); repeated explicit failures move the channel
    /// into cooldown. An error is treated as a transient fault and does not
    /// count toward cooldown. Must be idempotent under repeated failed calls.
    fn connect(&self) -> io::Result<bool>;

    /// Invoked when the descriptor becomes readable.
    ///
    /// The readiness source is edge-triggered, so the handler must drain the
    /// descriptor before returning. `Ok(true)` reports the channel healthy;
    /// `Ok(false)` reports it dead and schedules a reconnect under a fresh
    /// descriptor. An error is logged and the channel is left untouched,
    /// since a callback fault is not evidence of a dead channel.
    fn read(&self) -> io::Result<bool>;

    /// Invoked when no read activity occurred within the configured interval.
    ///
    /// Errors are logged and ignored.
    fn timeout(&self) -> io::Result<()>;
}

/// Listener-side state for one managed channel.
///
/// The descriptor is owned by the channel's owner and is never closed here;
/// it is replaced (via [`ChannelHandler::create`]) on every reconnect.
pub(crate) struct Channel {
    pub(crate) fd: RawFd,
    pub(crate) handler: Box<dyn ChannelHandler>,
    /// Last successful read or last timeout notification.
    pub(crate) last_read: Instant,
    /// Consecutive explicit connect failures since the last success.
    pub(crate) failed_attempts: u32,
    /// Set when the channel entered cooldown; cleared once it expires.
    pub(crate) cooldown_since: Option<Instant>,
}

impl Channel {
    pub(crate) fn new(fd: RawFd, handler: Box<dyn ChannelHandler>) -> Self {
        Self {
            fd,
            handler,
            last_read: Instant::now(),
            failed_attempts: 0,
            cooldown_since: None,
        }
    }
}

/// Registration protocol messages submitted by owner threads.
///
/// Owners only ever enqueue; the listener thread drains the queue once per
/// idle cycle, in submission order.
pub(crate) enum Control {
    Add(Channel),
    Remove(RawFd),
}
