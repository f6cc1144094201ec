//! Error taxonomy for the launcher connection.

use nix::errno::Errno;
use thiserror::Error;

/// Failures surfaced by the launcher connection.
///
/// `EnvironmentMissing`, `Transport` and `Protocol` leave the channel
/// unusable; `OpenRejected` and `MissingDescriptor` only fail the one
/// device-open call that produced them.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// A required inherited descriptor variable is absent, unparsable, or
    /// names a descriptor that is not open.
    #[error("launcher descriptor variable {0} is missing or invalid")]
    EnvironmentMissing(&'static str),

    /// Send or receive on the helper socket failed for a reason other than
    /// interruption (interrupted calls are retried internally).
    #[error("launcher channel failed: {0}")]
    Transport(#[source] std::io::Error),

    /// The helper sent a message that violates the protocol ordering.
    #[error("unexpected message from launcher helper: {0}")]
    Protocol(String),

    /// The helper refused to open the requested device.
    #[error("launcher helper rejected device open: {0}")]
    OpenRejected(Errno),

    /// The open reply claimed success but carried no usable descriptor.
    #[error("launcher open reply carried no descriptor")]
    MissingDescriptor,
}
