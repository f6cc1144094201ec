//! Wire codec for the launcher control channel.
//!
//! The unprivileged display server and the privileged helper exchange
//! messages over a SOCK_SEQPACKET socket pair, one protocol message per
//! datagram, tags and integers in host byte order (the two processes always
//! share a machine). Device descriptors ride out of band as a single
//! SCM_RIGHTS attachment on successful open replies.
//!
//! Layouts:
//!
//! ```text
//! OPEN             [tag i32][flags i32][path bytes][NUL]   client -> helper
//! OPEN_REPLY       [tag i32][ret i32] (+ fd iff ret >= 0)  helper -> client
//! ACTIVATE         [tag i32]                               helper -> client
//! DEACTIVATE       [tag i32]                               helper -> client
//! DEACTIVATE_DONE  [tag i32]                               client -> helper
//! ```

use std::ffi::CString;

pub const TAG_OPEN: i32 = 0;
pub const TAG_OPEN_REPLY: i32 = 1;
pub const TAG_ACTIVATE: i32 = 2;
pub const TAG_DEACTIVATE: i32 = 3;
pub const TAG_DEACTIVATE_DONE: i32 = 4;

/// Largest fixed-size message (OPEN_REPLY). OPEN is variable-size and only
/// ever sent, never received, by this side of the channel.
pub const MAX_REPLY_SIZE: usize = 8;

/// One message on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Request to open a device node on the client's behalf.
    Open { path: CString, flags: i32 },
    /// Result of an `Open`; `ret` is 0 or a negated errno.
    OpenReply { ret: i32 },
    /// The session regained the VT.
    Activate,
    /// The session is being switched away; must be acknowledged.
    Deactivate,
    /// Acknowledges a `Deactivate`.
    DeactivateDone,
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Open { path, flags } => {
                let bytes = path.as_bytes_with_nul();
                let mut buf = Vec::with_capacity(8 + bytes.len());
                buf.extend_from_slice(&TAG_OPEN.to_ne_bytes());
                buf.extend_from_slice(&flags.to_ne_bytes());
                buf.extend_from_slice(bytes);
                buf
            }
            Message::OpenReply { ret } => {
                let mut buf = Vec::with_capacity(8);
                buf.extend_from_slice(&TAG_OPEN_REPLY.to_ne_bytes());
                buf.extend_from_slice(&ret.to_ne_bytes());
                buf
            }
            Message::Activate => TAG_ACTIVATE.to_ne_bytes().to_vec(),
            Message::Deactivate => TAG_DEACTIVATE.to_ne_bytes().to_vec(),
            Message::DeactivateDone => TAG_DEACTIVATE_DONE.to_ne_bytes().to_vec(),
        }
    }

    /// Decode one datagram. Returns `None` for unknown tags or messages
    /// whose size does not match their tag.
    pub fn decode(buf: &[u8]) -> Option<Message> {
        if buf.len() < 4 {
            return None;
        }
        let tag = i32::from_ne_bytes(buf[..4].try_into().ok()?);
        match tag {
            TAG_OPEN => {
                // Needs flags plus at least the terminating NUL.
                if buf.len() < 9 || *buf.last()? != 0 {
                    return None;
                }
                let flags = i32::from_ne_bytes(buf[4..8].try_into().ok()?);
                let path = CString::from_vec_with_nul(buf[8..].to_vec()).ok()?;
                Some(Message::Open { path, flags })
            }
            TAG_OPEN_REPLY => {
                if buf.len() != 8 {
                    return None;
                }
                let ret = i32::from_ne_bytes(buf[4..8].try_into().ok()?);
                Some(Message::OpenReply { ret })
            }
            TAG_ACTIVATE if buf.len() == 4 => Some(Message::Activate),
            TAG_DEACTIVATE if buf.len() == 4 => Some(Message::Deactivate),
            TAG_DEACTIVATE_DONE if buf.len() == 4 => Some(Message::DeactivateDone),
            _ => None,
        }
    }
}
