//! Connection to the privileged launcher helper.
//!
//! The display server runs unprivileged; a small privileged helper keeps the
//! real capabilities and brokers them over a SOCK_SEQPACKET socket pair
//! inherited at startup. Device opens are synchronous RPCs on that channel;
//! session activation changes arrive on the same channel as unsolicited
//! notifications. The one tricky interleaving: a DEACTIVATE can land while
//! an open request is still waiting for its reply. Processing it inline
//! would emit the session-state signal into backends that are mid-open on
//! that very device, so delivery is deferred to the event loop's next idle
//! turn and the receive loop keeps waiting for the reply.

use std::cell::RefCell;
use std::ffi::CString;
use std::io::{self, IoSliceMut};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::rc::{Rc, Weak};

use log::{debug, error, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{recv, recvmsg, send, ControlMessageOwned, MsgFlags};
use nix::sys::stat::{fstat, major};

use crate::console::{restore_console, ConsoleOps, Terminal, K_UNICODE};
use crate::error::LaunchError;
use crate::event::{Readiness, Scheduler, SourceId};
use crate::protocol::{Message, MAX_REPLY_SIZE};
use crate::session::SessionHandle;

/// Environment variable carrying the helper socket descriptor number.
pub const SOCKET_ENV: &str = "VTLAUNCH_SOCK";
/// Environment variable carrying the controlling terminal descriptor number.
pub const TTY_ENV: &str = "VTLAUNCH_TTY_FD";

/// Character-device major of DRM nodes (from linux/major.h). Opens of these
/// are remembered so mastership can be dropped during restoration.
const DRM_MAJOR: u64 = 226;

/// What the event loop should do after a dispatch turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostDispatch {
    /// Keep dispatching.
    Continue,
    /// The privileged channel is gone and console state has been restored;
    /// the process cannot continue.
    Exit,
}

/// Capability contract every launcher backend satisfies. Construction and
/// teardown are backend-specific (`connect` / `Drop` on the concrete type).
pub trait Launcher {
    /// Open a device node through the helper. The caller becomes the
    /// exclusive owner of the returned descriptor.
    fn open(&mut self, path: &Path, flags: OFlag) -> Result<OwnedFd, LaunchError>;
    /// Return a brokered descriptor.
    fn close(&mut self, device: OwnedFd);
    /// Request a switch to another VT. Completion is reported
    /// asynchronously as ACTIVATE/DEACTIVATE notifications, so failure is
    /// surfaced rather than retried.
    fn activate_vt(&mut self, vt: i32) -> io::Result<()>;
    /// The VT number of the session's terminal.
    fn vt(&self) -> io::Result<i32>;
}

/// Read a pre-opened descriptor number out of the environment, probe that it
/// is actually open, mark it close-on-exec, and erase the variable so it
/// cannot leak to children.
fn env_fd(name: &'static str) -> Result<OwnedFd, LaunchError> {
    let value = std::env::var(name).map_err(|_| LaunchError::EnvironmentMissing(name))?;
    let fd = value
        .trim()
        .parse::<RawFd>()
        .ok()
        .filter(|fd| *fd >= 0)
        .ok_or(LaunchError::EnvironmentMissing(name))?;

    let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(|_| LaunchError::EnvironmentMissing(name))?;
    let flags = FdFlag::from_bits_retain(flags) | FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(|_| LaunchError::EnvironmentMissing(name))?;
    std::env::remove_var(name);

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

struct Inner {
    // Declaration order doubles as teardown order: the socket closes first,
    // the terminal (inside the console) last.
    socket: OwnedFd,
    console: Box<dyn ConsoleOps>,
    session: SessionHandle,
    /// Keyboard mode restored on teardown. The true prior mode cannot be
    /// queried once the tty is delegated, so this is fixed at connect time.
    kb_mode: libc::c_int,
    /// Most recently brokered DRM device, referenced (not owned) for
    /// mastership drop during restoration.
    drm_fd: Option<RawFd>,
    /// A DEACTIVATE arrived during an open request and awaits delivery.
    deferred_deactivate: bool,
    /// The channel is unusable (hangup, transport or protocol failure).
    lost: bool,
    /// Restoration has run; it must never run twice.
    restored: bool,
}

impl Inner {
    fn send(&mut self, buf: &[u8]) -> Result<(), LaunchError> {
        loop {
            // NOSIGNAL: a vanished helper must surface as EPIPE, not kill
            // the process before restoration can run.
            match send(self.socket.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL) {
                Ok(n) if n == buf.len() => return Ok(()),
                Ok(n) => {
                    self.lost = true;
                    return Err(LaunchError::Transport(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short send: {} of {} bytes", n, buf.len()),
                    )));
                }
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    self.lost = true;
                    return Err(LaunchError::Transport(err.into()));
                }
            }
        }
    }

    /// Receive one datagram plus an optional SCM_RIGHTS descriptor.
    fn recv_with_fd(&mut self, buf: &mut [u8]) -> Result<(usize, Option<RawFd>), LaunchError> {
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        loop {
            let mut iov = [IoSliceMut::new(buf)];
            match recvmsg::<()>(
                self.socket.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => {
                    let fd = msg.cmsgs().find_map(|cmsg| match cmsg {
                        ControlMessageOwned::ScmRights(fds) => fds.first().copied(),
                        _ => None,
                    });
                    return Ok((msg.bytes, fd));
                }
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    self.lost = true;
                    return Err(LaunchError::Transport(err.into()));
                }
            }
        }
    }

    /// The single deactivation path, shared by direct and deferred delivery:
    /// flip the flag, signal observers, acknowledge. Exactly one
    /// DEACTIVATE_DONE per DEACTIVATE.
    fn handle_deactivate(&mut self) {
        self.session.set_active(false);
        if let Err(err) = self.send(&Message::DeactivateDone.encode()) {
            warn!("failed to acknowledge deactivation: {}", err);
        }
    }

    fn restore(&mut self) {
        restore_console(self.console.as_mut(), self.kb_mode, self.drm_fd);
        self.restored = true;
    }

    fn lose_channel(&mut self, reason: &str) -> PostDispatch {
        error!("launcher helper {}, restoring console state", reason);
        self.lost = true;
        self.restore();
        PostDispatch::Exit
    }

    /// Steady-state notification dispatch, driven by socket readiness.
    fn dispatch(&mut self, readiness: Readiness) -> PostDispatch {
        // A channel lost earlier (transport or protocol failure during an
        // open) stays fatal no matter what readiness reports.
        if self.lost {
            if !self.restored {
                self.restore();
            }
            return PostDispatch::Exit;
        }
        if readiness.hangup {
            return self.lose_channel("socket closed");
        }

        // A deactivation deferred during a device open is delivered before
        // anything else; its message was already consumed back then, so
        // nothing is read this turn.
        if self.deferred_deactivate {
            self.deferred_deactivate = false;
            self.handle_deactivate();
            return PostDispatch::Continue;
        }

        let mut buf = [0u8; MAX_REPLY_SIZE];
        let len = loop {
            match recv(self.socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(len) => break len,
                Err(Errno::EINTR) => continue,
                Err(err) => return self.lose_channel(&format!("socket failed ({})", err)),
            }
        };
        if len == 0 {
            return self.lose_channel("hung up");
        }

        match Message::decode(&buf[..len]) {
            Some(Message::Activate) => self.session.set_active(true),
            Some(Message::Deactivate) => self.handle_deactivate(),
            _ => {
                // Unrecognized notifications are skipped, not fatal; newer
                // helpers may know messages we do not.
                let tag = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
                warn!("unexpected event {} ({} bytes) from launcher helper", tag, len);
            }
        }
        PostDispatch::Continue
    }
}

fn dispatch_weak(inner: &Weak<RefCell<Inner>>, readiness: Readiness) -> PostDispatch {
    match inner.upgrade() {
        Some(inner) => inner.borrow_mut().dispatch(readiness),
        None => PostDispatch::Continue,
    }
}

/// A live connection to the launcher helper.
///
/// Single-owner and single-threaded: all operations run on the display
/// server's control thread, and at most one device open may be outstanding
/// at a time. Dropping the connection is the teardown path: a live channel
/// is closed without touching console state (the helper cleans up its side
/// on closure); a lost channel triggers the restoration sequence, exactly
/// once, before the terminal descriptor closes.
pub struct LauncherClient {
    inner: Rc<RefCell<Inner>>,
    scheduler: Rc<dyn Scheduler>,
    source: Option<SourceId>,
}

impl LauncherClient {
    /// Establish the connection from descriptors inherited in the
    /// environment ([`SOCKET_ENV`] and [`TTY_ENV`]) and register the socket
    /// with the event loop.
    ///
    /// `vt`, `seat_id` and `sync_drm` are part of the launcher capability
    /// contract but unused by this backend: the helper already picked the
    /// terminal before this process started. On any failure every acquired
    /// descriptor is released again.
    ///
    /// If the helper disappears later, the readiness callback registered
    /// here restores the console and terminates the process with a nonzero
    /// status; a session without its privileged channel cannot continue.
    pub fn connect(
        scheduler: Rc<dyn Scheduler>,
        session: SessionHandle,
        _vt: Option<i32>,
        _seat_id: &str,
        _sync_drm: bool,
    ) -> Result<Self, LaunchError> {
        let socket = env_fd(SOCKET_ENV)?;
        let tty = env_fd(TTY_ENV)?;
        Self::from_parts(scheduler, session, socket, Box::new(Terminal::new(tty)))
    }

    /// Build a connection from explicit parts. `connect` is the common entry
    /// point; this one serves embedders that obtain the descriptors some
    /// other way.
    pub fn from_parts(
        scheduler: Rc<dyn Scheduler>,
        session: SessionHandle,
        socket: OwnedFd,
        console: Box<dyn ConsoleOps>,
    ) -> Result<Self, LaunchError> {
        let raw = socket.as_raw_fd();
        let inner = Rc::new(RefCell::new(Inner {
            socket,
            console,
            session,
            kb_mode: K_UNICODE,
            drm_fd: None,
            deferred_deactivate: false,
            lost: false,
            restored: false,
        }));

        let weak = Rc::downgrade(&inner);
        let source = scheduler
            .watch_fd(
                raw,
                Rc::new(move |readiness| {
                    if dispatch_weak(&weak, readiness) == PostDispatch::Exit {
                        std::process::exit(1);
                    }
                }),
            )
            .map_err(LaunchError::Transport)?;

        Ok(Self {
            inner,
            scheduler,
            source: Some(source),
        })
    }

    /// Synchronous open RPC. Blocks until the helper replies; the helper is
    /// a cooperating peer, so there is deliberately no timeout.
    pub fn open(&mut self, path: &Path, flags: OFlag) -> Result<OwnedFd, LaunchError> {
        let path_c = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| LaunchError::OpenRejected(Errno::EINVAL))?;

        let mut inner = self.inner.borrow_mut();
        debug!("requesting open of {} from helper", path.display());
        inner.send(
            &Message::Open {
                path: path_c,
                flags: flags.bits(),
            }
            .encode(),
        )?;

        let mut buf = [0u8; MAX_REPLY_SIZE];
        let (ret, fd) = loop {
            let (len, fd) = inner.recv_with_fd(&mut buf)?;
            if len == 0 {
                inner.lost = true;
                return Err(LaunchError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "helper hung up during open",
                )));
            }
            match Message::decode(&buf[..len]) {
                Some(Message::OpenReply { ret }) => break (ret, fd),
                // Only the reply and at most one deactivation may arrive
                // while an open is outstanding. Delivery of the
                // deactivation waits for the loop's next idle turn, once
                // this call has returned to its caller.
                Some(Message::Deactivate) if !inner.deferred_deactivate => {
                    inner.deferred_deactivate = true;
                    self.schedule_deferred_deactivate();
                }
                _ => {
                    if let Some(fd) = fd {
                        drop(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                    inner.lost = true;
                    let tag = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    return Err(LaunchError::Protocol(format!(
                        "tag {} ({} bytes) while awaiting open reply",
                        tag, len
                    )));
                }
            }
        };

        if ret < 0 {
            if let Some(fd) = fd {
                // A failed open should never carry a descriptor; do not leak
                // one if the helper attached it anyway.
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
            }
            return Err(LaunchError::OpenRejected(Errno::from_i32(-ret)));
        }

        let Some(fd) = fd else {
            warn!("open reply for {} carried no control message", path.display());
            return Err(LaunchError::MissingDescriptor);
        };
        if fd < 0 {
            return Err(LaunchError::MissingDescriptor);
        }
        let device = unsafe { OwnedFd::from_raw_fd(fd) };

        // Remember DRM nodes so mastership can be dropped during
        // restoration.
        if let Ok(st) = fstat(device.as_raw_fd()) {
            if st.st_mode & libc::S_IFMT == libc::S_IFCHR && major(st.st_rdev) == DRM_MAJOR {
                inner.drm_fd = Some(device.as_raw_fd());
            }
        }

        debug!("helper opened {} as fd {}", path.display(), device.as_raw_fd());
        Ok(device)
    }

    /// Return a brokered descriptor. The helper side needs no message; it
    /// tracks devices by the descriptors it passed.
    pub fn close(&mut self, device: OwnedFd) {
        let mut inner = self.inner.borrow_mut();
        if inner.drm_fd == Some(device.as_raw_fd()) {
            inner.drm_fd = None;
        }
    }

    pub fn activate_vt(&mut self, vt: i32) -> io::Result<()> {
        self.inner.borrow_mut().console.activate_vt(vt)
    }

    pub fn vt(&self) -> io::Result<i32> {
        self.inner.borrow().console.vt_number()
    }

    /// Feed one readiness event through the notification path. `connect`
    /// wires this to the scheduler; embedders driving a foreign loop call it
    /// directly and honor the returned directive.
    pub fn dispatch(&self, readiness: Readiness) -> PostDispatch {
        self.inner.borrow_mut().dispatch(readiness)
    }

    /// True while a deactivation observed during a device open has not yet
    /// been delivered.
    pub fn deactivate_pending(&self) -> bool {
        self.inner.borrow().deferred_deactivate
    }

    fn schedule_deferred_deactivate(&self) {
        let weak = Rc::downgrade(&self.inner);
        self.scheduler.defer(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.borrow_mut();
                // The readiness path may have delivered it first; whoever
                // clears the flag delivers, so it runs exactly once.
                if inner.deferred_deactivate {
                    inner.deferred_deactivate = false;
                    inner.handle_deactivate();
                }
            }
        }));
    }
}

impl Launcher for LauncherClient {
    fn open(&mut self, path: &Path, flags: OFlag) -> Result<OwnedFd, LaunchError> {
        LauncherClient::open(self, path, flags)
    }

    fn close(&mut self, device: OwnedFd) {
        LauncherClient::close(self, device)
    }

    fn activate_vt(&mut self, vt: i32) -> io::Result<()> {
        LauncherClient::activate_vt(self, vt)
    }

    fn vt(&self) -> io::Result<i32> {
        LauncherClient::vt(self)
    }
}

impl Drop for LauncherClient {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            self.scheduler.unwatch(source);
        }
        let mut inner = self.inner.borrow_mut();
        if inner.lost && !inner.restored {
            inner.restore();
        }
        // Inner's field order closes the socket before the terminal. When
        // the helper is still alive it notices the closure and performs its
        // own side of the cleanup, so no local restoration happens here.
    }
}
