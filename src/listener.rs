//! The channel listener: public registration API plus the reactor loop.
//!
//! A single background thread owns the poller and the channel maps. Owner
//! threads only ever touch the lock-free control queue, so registration and
//! removal never block the reactor and the reactor never blocks on owners.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use metrics::{counter, gauge};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, ChannelHandler, Control};
use crate::poller::{Poller, Readiness};

/// Consecutive explicit connect failures before a channel enters cooldown.
const COOLDOWN_CONNECT_LIMIT: u32 = 5;

/// Upper bound on a single readiness wait. Registry maintenance, timeout
/// detection and reconnect attempts run only when a wait expires with no
/// events, so this also bounds their worst-case latency.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared between owner threads and the reactor thread.
struct Shared {
    control: SegQueue<Control>,
    quit: AtomicBool,
    running: AtomicBool,
    /// Global inactivity interval in seconds; 0 disables timeout detection.
    timeout_secs: AtomicU64,
}

/// An events-driven listener multiplexing guest VM channels.
///
/// Channels are registered from any thread; a dedicated reactor thread waits
/// for readiness, dispatches read callbacks, retries unconnected channels and
/// detects inactivity. Note that under sustained readiness traffic the
/// maintenance passes (merge, timeout, reconnect) only run once the poller
/// sees a full quiet second; burst handling is deliberately never starved by
/// registry upkeep.
pub struct Listener {
    shared: Arc<Shared>,
}

impl Listener {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                control: SegQueue::new(),
                quit: AtomicBool::new(false),
                running: AtomicBool::new(false),
                timeout_secs: AtomicU64::new(0),
            }),
        }
    }

    /// Spawns the reactor thread.
    ///
    /// One-shot: starting an already-started listener is an error.
    pub fn start(&self) -> io::Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(io::Error::other("vm channels listener is already running"));
        }
        let poller = match Poller::new() {
            Ok(poller) => poller,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let reactor = Reactor {
            shared: self.shared.clone(),
            poller,
            connected: HashMap::new(),
            pending: HashMap::new(),
        };
        let spawned = thread::Builder::new()
            .name("vmchannels-listener".into())
            .spawn(move || reactor.run());
        if let Err(e) = spawned {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Requests the reactor thread to stop.
    ///
    /// Cooperative: the flag is observed at the top of the next iteration, so
    /// in-flight work for the current cycle completes. Does not join.
    pub fn stop(&self) {
        info!("vm channels listener stop requested");
        self.shared.quit.store(true, Ordering::SeqCst);
    }

    /// Sets the inactivity timeout (in seconds) for all channels.
    ///
    /// 0 disables timeout detection. May be changed while running.
    pub fn set_timeout(&self, seconds: u64) {
        info!("setting channels' timeout to {seconds} seconds");
        self.shared.timeout_secs.store(seconds, Ordering::SeqCst);
    }

    /// Registers a new channel with the listener.
    ///
    /// Calls [`ChannelHandler::create`] synchronously and returns the
    /// resulting descriptor. The channel stays invisible to the reactor until
    /// the next idle cycle merges it into the unconnected set.
    pub fn register<H>(&self, handler: H) -> io::Result<RawFd>
    where
        H: ChannelHandler + 'static,
    {
        let handler: Box<dyn ChannelHandler> = Box::new(handler);
        let fd = handler.create()?;
        debug!("adding fd {fd} to the listener's channels");
        counter!("vmchannels_registered_total").increment(1);
        self.shared.control.push(Control::Add(Channel::new(fd, handler)));
        Ok(fd)
    }

    /// Unregisters the channel currently using `fd`.
    ///
    /// Applied at the start of the next merge pass; from that point no further
    /// callback is invoked for the channel. A callback already in flight is
    /// allowed to complete.
    pub fn unregister(&self, fd: RawFd) {
        debug!("removing fd {fd} from the listener");
        self.shared.control.push(Control::Remove(fd));
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

/// Reactor-thread state: the poller plus the two channel maps.
///
/// Invariant: a descriptor lives in at most one of `connected` / `pending`,
/// and is registered with the poller exactly when it is in `connected`.
struct Reactor {
    shared: Arc<Shared>,
    poller: Poller,
    connected: HashMap<RawFd, Channel>,
    pending: HashMap<RawFd, Channel>,
}

impl Reactor {
    fn run(mut self) {
        info!("starting vm channels listener thread");
        while !self.shared.quit.load(Ordering::SeqCst) {
            if let Err(e) = self.cycle() {
                error!("unhandled error in vm channels listener thread: {e}");
                break;
            }
        }
        info!("vm channels listener thread has ended");
    }

    /// One reactor iteration: wait, then either dispatch events or, on a
    /// true wait expiry, run the maintenance passes in fixed order.
    fn cycle(&mut self) -> io::Result<()> {
        let events = self.poller.wait(WAIT_TIMEOUT)?;
        if events.is_empty() {
            self.merge_pending();
            let interval = self.timeout_interval();
            if let Some(interval) = interval {
                self.scan_timeouts(interval);
            }
            self.connect_pending(interval)?;
        } else {
            for (fd, readiness) in events {
                self.dispatch(fd, readiness);
            }
        }
        Ok(())
    }

    fn timeout_interval(&self) -> Option<Duration> {
        match self.shared.timeout_secs.load(Ordering::SeqCst) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Handles one readiness event.
    fn dispatch(&mut self, fd: RawFd, readiness: Readiness) {
        if readiness.hangup {
            if self.connected.contains_key(&fd) {
                error!("error/hangup readiness on fd {fd}");
                self.schedule_reconnect(fd);
            } else {
                debug!("error/hangup readiness on fd {fd} already removed from the listener");
            }
            return;
        }
        if !readiness.readable {
            return;
        }
        let healthy = match self.connected.get_mut(&fd) {
            Some(channel) => match channel.handler.read() {
                Ok(true) => {
                    channel.failed_attempts = 0;
                    channel.last_read = Instant::now();
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    warn!("read callback failed on fd {fd}: {e}");
                    true
                }
            },
            // The event raced with a removal earlier in this batch.
            None => return,
        };
        if !healthy {
            self.schedule_reconnect(fd);
        }
    }

    /// Moves a broken channel out of the connected set and back into the
    /// unconnected set under a fresh descriptor.
    ///
    /// Failure counters and cooldown state carry over unchanged; only connect
    /// failures escalate toward cooldown, not read failures.
    fn schedule_reconnect(&mut self, fd: RawFd) {
        let Some(mut channel) = self.connected.remove(&fd) else {
            return;
        };
        gauge!("vmchannels_connected_current").decrement(1.0);
        if let Err(e) = self.poller.remove(fd) {
            debug!("failed to deregister fd {fd}: {e}");
        }
        match channel.handler.create() {
            Ok(new_fd) => {
                counter!("vmchannels_reconnects_total").increment(1);
                debug!("fd {fd} was replaced by fd {new_fd}, awaiting reconnect");
                channel.fd = new_fd;
                self.pending.insert(new_fd, channel);
            }
            Err(e) => {
                error!("create callback failed for fd {fd}, dropping the channel: {e}");
            }
        }
    }

    /// Drains the control queue into the channel maps.
    ///
    /// The single synchronization point with owner threads. FIFO order makes
    /// a removal enqueued after an addition of the same descriptor win, so a
    /// register/unregister pair submitted between idle cycles results in no
    /// callback activity at all.
    fn merge_pending(&mut self) {
        while let Some(op) = self.shared.control.pop() {
            match op {
                Control::Add(channel) => {
                    debug!("fd {} was added to the unconnected channels", channel.fd);
                    self.pending.insert(channel.fd, channel);
                }
                Control::Remove(fd) => {
                    if self.connected.remove(&fd).is_some() {
                        gauge!("vmchannels_connected_current").decrement(1.0);
                        if let Err(e) = self.poller.remove(fd) {
                            debug!("failed to deregister fd {fd}: {e}");
                        }
                    }
                    self.pending.remove(&fd);
                    debug!("fd {fd} was removed from the listener");
                }
            }
        }
    }

    /// Notifies channels that have seen no read activity for `interval`.
    fn scan_timeouts(&mut self, interval: Duration) {
        let now = Instant::now();
        for (fd, channel) in self.connected.iter_mut() {
            if now.duration_since(channel.last_read) >= interval {
                debug!("timeout on fd {fd}");
                counter!("vmchannels_timeouts_total").increment(1);
                if let Err(e) = channel.handler.timeout() {
                    warn!("timeout callback failed on fd {fd}: {e}");
                }
                // Rearm regardless of the callback outcome so a silent
                // channel is notified once per interval, not once per cycle.
                channel.last_read = now;
            }
        }
    }

    /// Gives every unconnected channel a chance to connect.
    ///
    /// A channel in cooldown is skipped until one full timeout interval has
    /// elapsed since it entered; with timeout detection disabled the cooldown
    /// window is treated as already expired.
    fn connect_pending(&mut self, interval: Option<Duration>) -> io::Result<()> {
        let now = Instant::now();
        let fds: Vec<RawFd> = self.pending.keys().copied().collect();
        for fd in fds {
            let Some(channel) = self.pending.get_mut(&fd) else {
                continue;
            };
            if let Some(since) = channel.cooldown_since {
                let expired =
                    interval.is_none_or(|window| now.duration_since(since) >= window);
                if !expired {
                    continue;
                }
                channel.cooldown_since = None;
                trace!("cooldown expired, reconnect attempt on fd {fd}");
            }
            trace!("trying to connect fd {fd}");
            match channel.handler.connect() {
                Ok(true) => {
                    channel.failed_attempts = 0;
                    channel.cooldown_since = None;
                    channel.last_read = Instant::now();
                    debug!("connecting fd {fd} succeeded");
                    if let Some(ready) = self.pending.remove(&fd) {
                        self.poller.add(fd)?;
                        self.connected.insert(fd, ready);
                        gauge!("vmchannels_connected_current").increment(1.0);
                    }
                }
                Ok(false) => {
                    channel.failed_attempts += 1;
                    if channel.failed_attempts >= COOLDOWN_CONNECT_LIMIT {
                        channel.cooldown_since = Some(now);
                        counter!("vmchannels_cooldowns_total").increment(1);
                        trace!("fd {fd} was moved into cooldown");
                    }
                }
                Err(e) => {
                    warn!("connect callback failed on fd {fd}: {e}");
                }
            }
        }
        Ok(())
    }
}
