//! VT and keyboard control for the session's terminal.
//!
//! The launcher holds one descriptor for the controlling virtual terminal,
//! used only for ioctls, never for data. [`ConsoleOps`] is the seam between
//! the connection logic and the kernel so the restoration sequence can be
//! exercised without a real VT; [`Terminal`] is the ioctl-backed
//! implementation.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use log::warn;

// VT ioctl constants (from linux/vt.h)
const VT_SETMODE: libc::c_ulong = 0x5602;
const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_AUTO: libc::c_char = 0;

// Keyboard/display ioctl constants (from linux/kd.h)
const KDSETMODE: libc::c_ulong = 0x4B3A;
const KD_TEXT: libc::c_long = 0x00;
const KDSKBMODE: libc::c_ulong = 0x4B45;
const KDSKBMUTE: libc::c_ulong = 0x4B51;

/// Keyboard decoding mode restored on teardown. The true prior mode cannot
/// be queried once the helper has delegated the tty, so connections cache
/// this default.
pub const K_UNICODE: libc::c_int = 0x03;

// DRM ioctls (from include/uapi/drm/drm.h)
const DRM_IOCTL_BASE: u64 = 0x64;
const DRM_IOCTL_DROP_MASTER: libc::c_ulong =
    nix::request_code_none!(DRM_IOCTL_BASE, 0x1f) as libc::c_ulong;

/// vt_mode structure for VT_SETMODE
#[repr(C)]
struct VtMode {
    mode: libc::c_char,
    waitv: libc::c_char,
    relsig: libc::c_short,
    acqsig: libc::c_short,
    frsig: libc::c_short,
}

/// Console and device-handover controls the launcher performs locally (the
/// helper brokers device opens; these act on descriptors we already hold).
pub trait ConsoleOps {
    /// Clear KDSKBMUTE so keyboard input reaches the console again.
    fn unmute_keyboard(&mut self) -> io::Result<()>;
    /// Set the keyboard decoding mode (KDSKBMODE).
    fn set_keyboard_mode(&mut self, mode: libc::c_int) -> io::Result<()>;
    /// Put the VT display back into text mode (KDSETMODE KD_TEXT).
    fn set_text_mode(&mut self) -> io::Result<()>;
    /// Relinquish DRM mastership on the given device, if any.
    fn drop_drm_master(&mut self, fd: Option<RawFd>) -> io::Result<()>;
    /// Hand VT switching back to the kernel (VT_SETMODE VT_AUTO).
    fn set_vt_auto(&mut self) -> io::Result<()>;
    /// Request a switch to another VT (VT_ACTIVATE). Switching completes
    /// asynchronously; the helper reports the outcome as ACTIVATE or
    /// DEACTIVATE notifications.
    fn activate_vt(&mut self, vt: i32) -> io::Result<()>;
    /// The VT number behind the terminal descriptor.
    fn vt_number(&self) -> io::Result<i32>;
}

/// Runs the state-restoration sequence, in fixed order, each step
/// best-effort. This is called during teardown, including after losing the
/// helper, so failures are logged and never escalated.
pub fn restore_console(console: &mut dyn ConsoleOps, kb_mode: libc::c_int, drm_fd: Option<RawFd>) {
    // Unmuting is enough on kernels that honor KDSKBMUTE; otherwise fall
    // back to restoring the decoding mode directly.
    if console.unmute_keyboard().is_err() {
        if let Err(err) = console.set_keyboard_mode(kb_mode) {
            warn!("failed to restore keyboard mode: {}", err);
        }
    }

    if let Err(err) = console.set_text_mode() {
        warn!("failed to set KD_TEXT mode on tty: {}", err);
    }

    // Master must be dropped before VT_AUTO, or the kernel could switch to
    // a VT whose display server then fails to become master.
    if let Err(err) = console.drop_drm_master(drm_fd) {
        warn!("failed to drop DRM master: {}", err);
    }

    if let Err(err) = console.set_vt_auto() {
        warn!("could not reset vt handling: {}", err);
    }
}

/// The controlling terminal, exclusively owned. All ioctls run on the
/// descriptor handed down by the helper at startup.
pub struct Terminal {
    tty: OwnedFd,
}

impl Terminal {
    pub fn new(tty: OwnedFd) -> Self {
        Self { tty }
    }

    fn ioctl(&self, cmd: libc::c_ulong, arg: libc::c_long) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.tty.as_raw_fd(), cmd, arg) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl ConsoleOps for Terminal {
    fn unmute_keyboard(&mut self) -> io::Result<()> {
        self.ioctl(KDSKBMUTE, 0)
    }

    fn set_keyboard_mode(&mut self, mode: libc::c_int) -> io::Result<()> {
        self.ioctl(KDSKBMODE, mode as libc::c_long)
    }

    fn set_text_mode(&mut self) -> io::Result<()> {
        self.ioctl(KDSETMODE, KD_TEXT)
    }

    fn drop_drm_master(&mut self, fd: Option<RawFd>) -> io::Result<()> {
        let Some(fd) = fd else {
            return Ok(());
        };
        let ret = unsafe { libc::ioctl(fd, DRM_IOCTL_DROP_MASTER) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_vt_auto(&mut self) -> io::Result<()> {
        let mode = VtMode {
            mode: VT_AUTO,
            waitv: 0,
            relsig: 0,
            acqsig: 0,
            frsig: 0,
        };
        let ret = unsafe { libc::ioctl(self.tty.as_raw_fd(), VT_SETMODE, &mode) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn activate_vt(&mut self, vt: i32) -> io::Result<()> {
        self.ioctl(VT_ACTIVATE, vt as libc::c_long)
    }

    fn vt_number(&self) -> io::Result<i32> {
        let st = nix::sys::stat::fstat(self.tty.as_raw_fd()).map_err(io::Error::from)?;
        Ok(nix::sys::stat::minor(st.st_rdev) as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vt_mode_layout() {
        // Must match struct vt_mode in linux/vt.h.
        assert_eq!(std::mem::size_of::<VtMode>(), 8);
    }

    #[test]
    fn test_drop_master_without_device_is_a_no_op() {
        // A Terminal on any fd will do; the drm fd is absent.
        let tty = unsafe { libc::dup(libc::STDERR_FILENO) };
        assert!(tty >= 0);
        let mut term = Terminal::new(unsafe {
            <OwnedFd as std::os::unix::io::FromRawFd>::from_raw_fd(tty)
        });
        assert!(term.drop_drm_master(None).is_ok());
    }
}
