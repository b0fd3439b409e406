//! Protocol constants.

use crate::ioctl::{ioc, DIR_NONE};

/// Sanity tag carried in every message header.
pub const MSG_MAGIC: u32 = 0x7564_6576;

/// Longest visible/class/device name, not counting the NUL terminator.
/// 47 keeps the registration record within the fixed parameter area.
pub const MAX_NAME_LEN: usize = 47;

/// On-wire size of a name field (name plus NUL padding).
pub const NAME_BUF_LEN: usize = MAX_NAME_LEN + 1;

/// Largest payload the broker will carry for a single read, write or ioctl.
pub const MAX_RW_SIZE: usize = 128 * 1024;

/// Well-known endpoint names, relative to the device namespace root.
pub const CONTROL_NAME: &str = "userdev/control";
pub const STATUS_NAME: &str = "userdev/status";

/// Control command accepted by the status channel: switch the open handle
/// from the textual snapshot to the fixed-record binary snapshot.
pub const STATUS_USE_BINARY: u32 = ioc(DIR_NONE, (b'U' as u16) << 8 | 100, 0);
