//! Broker error taxonomy.
//!
//! Every error that can surface from a client operation, a control-channel
//! access, or the status channel is one of these variants. The `errno`
//! mapping is provided for hosts that translate results back into syscall
//! returns.

use thiserror::Error;
use userdev_proto::CodecError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The provider died or the device was zombified mid-operation.
    #[error("provider connection lost")]
    ConnectionLost,
    /// No live device with that name or identifier.
    #[error("no such device")]
    NotFound,
    /// A live device already owns the requested name, or the channel is
    /// already promoted to a device.
    #[error("device already registered")]
    AlreadyExists,
    #[error("invalid argument")]
    InvalidArgument,
    /// A broker-side table hit its hard cap.
    #[error("state table full")]
    OutOfSpace,
    /// Nonblocking access found nothing to do.
    #[error("operation would block")]
    WouldBlock,
    /// The blocked call was interrupted; the host should reissue it.
    /// The in-flight transaction stays alive and is adopted on retry.
    #[error("interrupted, restart the call")]
    RestartNeeded,
    /// A provider tried to open its own device.
    #[error("refusing self-open deadlock")]
    DeadlockAvoided,
    /// Malformed traffic on the control channel. Poisons the channel.
    #[error("protocol violation: {0}")]
    Protocol(#[from] CodecError),
    /// The channel is poisoned, or a reply was structurally unusable.
    #[error("i/o error on channel")]
    Io,
    /// Access outside a mapped region, or through an unmappable region.
    #[error("bad address in mapped region")]
    BadAddress,
    /// The mapping cannot be materialized on this side.
    #[error("mapping not supported here")]
    NotSupported,
    /// Errno-style failure chosen by the provider.
    #[error("provider returned errno {0}")]
    Errno(i32),
}

impl Error {
    /// Translate a negative reply `retval` into an error.
    pub(crate) fn from_retval(retval: i64) -> Self {
        Error::Errno((-retval) as i32)
    }

    /// Errno-style number for hosts that speak syscall returns.
    pub fn errno(&self) -> i32 {
        match self {
            Error::ConnectionLost => 32,  // EPIPE
            Error::NotFound => 2,         // ENOENT
            Error::AlreadyExists => 17,   // EEXIST
            Error::InvalidArgument => 22, // EINVAL
            Error::OutOfSpace => 12,      // ENOMEM
            Error::WouldBlock => 11,      // EAGAIN
            Error::RestartNeeded => 512,  // ERESTARTSYS
            Error::DeadlockAvoided => 35, // EDEADLK
            Error::Protocol(_) | Error::Io => 5, // EIO
            Error::BadAddress => 14,      // EFAULT
            Error::NotSupported => 38,    // ENOSYS
            Error::Errno(n) => *n,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
