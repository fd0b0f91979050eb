//! An events-driven listener multiplexing guest VM channels over a single
//! reactor thread.
//!
//! Channels (guest-agent or console endpoints exposed as file descriptors)
//! register from any thread and are driven through an owner-supplied
//! [`ChannelHandler`]: the listener detects disconnects, retries connection
//! with bounded cooldown, and surfaces read activity and inactivity timeouts.
//! It consists of:
//!
//! - [`listener`]: The registration API and the reactor loop
//! - [`channel`]: The per-channel handler contract and state
//! - [`poller`]: The readiness-multiplexer wrapper
//!
//! # Example
//!
//! ```no_run
//! use std::io;
//! use std::os::fd::{AsRawFd, RawFd};
//! use std::os::unix::net::UnixStream;
//!
//! use vmchannels::{ChannelHandler, Listener};
//!
//! struct AgentChannel {
//!     stream: UnixStream,
//! }
//!
//! impl ChannelHandler for AgentChannel {
//!     fn create(&self) -> io::Result<RawFd> {
//!         Ok(self.stream.as_raw_fd())
//!     }
//!     fn connect(&self) -> io::Result<bool> {
//!         Ok(true)
//!     }
//!     fn read(&self) -> io::Result<bool> {
//!         // Drain the descriptor and hand the bytes to the guest protocol.
//!         Ok(true)
//!     }
//!     fn timeout(&self) -> io::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> io::Result<()> {
//!     let listener = Listener::new();
//!     listener.set_timeout(30);
//!     listener.start()?;
//!
//!     let (host, _guest) = UnixStream::pair()?;
//!     listener.register(AgentChannel { stream: host })?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod listener;
pub mod poller;

pub use channel::ChannelHandler;
pub use listener::Listener;
