//! vtlaunch - privileged launcher client for Linux display servers
//!
//! An unprivileged display server cannot open DRM device nodes or reconfigure
//! the virtual terminal on its own. A small privileged helper process keeps
//! those capabilities and brokers them over a socket pair inherited at
//! startup; this crate is the unprivileged side of that arrangement.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               Display server                     │
//! ├─────────────────────────────────────────────────┤
//! │  LauncherClient ──OPEN/OPEN_REPLY (+fd)──▶      │
//! │       │          ◀──ACTIVATE/DEACTIVATE──       │  privileged
//! │       │          ──DEACTIVATE_DONE──▶           │    helper
//! │       ▼                                         │
//! │  SessionHandle ──▶ backends (stop/resume        │
//! │                    drawing, drop/set master)    │
//! │  Terminal (VT/keyboard ioctls, restoration)     │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! The connection registers its socket with the compositor's event loop
//! (abstracted as [`event::Scheduler`]) for notifications, while device opens
//! are synchronous request/reply exchanges on the same channel. A DEACTIVATE
//! arriving mid-open is deferred to the loop's next idle turn so session
//! teardown never re-enters a backend that is still inside an open call. If
//! the helper vanishes, the console is restored (keyboard mode, text mode,
//! DRM master, VT_AUTO, in that order) before the process gives up.

pub mod console;
pub mod error;
pub mod event;
pub mod launcher;
pub mod protocol;
pub mod session;

pub use error::LaunchError;
pub use event::{Readiness, Scheduler, SourceId};
pub use launcher::{Launcher, LauncherClient, PostDispatch};
pub use session::SessionHandle;
