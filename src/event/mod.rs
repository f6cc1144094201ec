//! Event-loop boundary.
//!
//! The launcher never owns the display server's event loop; it only needs
//! two services from it: level-triggered read/hangup readiness on the helper
//! socket, and a way to defer a callback until control is back at top-level
//! dispatch. [`Scheduler`] captures exactly that surface so the connection
//! logic stays independent of the concrete loop (and can be driven by hand
//! in tests).

use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

#[cfg(feature = "calloop")]
mod calloop;
#[cfg(feature = "calloop")]
pub use self::calloop::LoopScheduler;

/// Readiness state reported for a watched descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    /// Peer hangup or a socket error; both mean the channel is gone.
    pub hangup: bool,
}

/// Identifies one readiness registration, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u32);

/// The slice of an event loop the launcher depends on.
pub trait Scheduler {
    /// Watch `fd` for read readiness and hangup, level-triggered. The
    /// callback may be invoked on every loop turn while the condition
    /// holds. The caller keeps `fd` open until [`Scheduler::unwatch`].
    fn watch_fd(&self, fd: RawFd, callback: Rc<dyn Fn(Readiness)>) -> io::Result<SourceId>;

    /// Stop watching a previously registered descriptor.
    fn unwatch(&self, id: SourceId);

    /// Run `callback` once, after the current dispatch (and any synchronous
    /// operation in progress) has fully returned. Never runs re-entrantly.
    fn defer(&self, callback: Box<dyn FnOnce()>);
}
