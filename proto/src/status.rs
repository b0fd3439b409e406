//! Fixed-record layout served by the status channel in binary mode.

use bytemuck::{Pod, Zeroable};

use crate::constants::NAME_BUF_LEN;

/// One registered device, as a fixed 64-byte record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct StatusRecord {
    /// Visible name, NUL padded.
    pub name: [u8; NAME_BUF_LEN],
    /// Non-zero if the provider is gone but open files remain.
    pub zombie: u32,
    /// Provider process id.
    pub pid: u32,
    /// Number of open files currently referencing the device.
    pub num_open: u32,
    pub reserved: u32,
}

/// On-wire size of one status record.
pub const STATUS_RECORD_SIZE: usize = size_of::<StatusRecord>();

const _: () = assert!(STATUS_RECORD_SIZE == 64);
