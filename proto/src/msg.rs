//! The fixed-layout message record exchanged on the control channel.
//!
//! Every message is a `MsgHeader` of exactly [`MSG_SIZE`] bytes, optionally
//! followed by a payload of `payload_len` bytes. The header embeds a 160-byte
//! parameter area holding either a [`RegisterParams`] (device registration)
//! or an [`OpsParams`] (everything else). All integers are little-endian host
//! order; the structs are laid out with explicit padding so they contain no
//! implicit padding bytes and can be viewed as plain bytes.
//!
//! The `payload_ptr` field is never meaningful on the wire. It exists so the
//! broker-side and provider-side structures stay identical in size, and must
//! be written as zero.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::constants::{MAX_NAME_LEN, MAX_RW_SIZE, MSG_MAGIC, NAME_BUF_LEN};

/// On-wire size of a message header.
pub const MSG_SIZE: usize = size_of::<MsgHeader>();

/// Size of the parameter area inside the header.
pub const PARAMS_SIZE: usize = 160;

/// On-wire size of the operation parameter record.
pub const OPS_PARAMS_SIZE: usize = size_of::<OpsParams>();

/// On-wire size of the registration parameter record.
pub const REGISTER_PARAMS_SIZE: usize = size_of::<RegisterParams>();

const _: () = assert!(size_of::<OpsParams>() == 128);
const _: () = assert!(size_of::<RegisterParams>() == PARAMS_SIZE);
const _: () = assert!(size_of::<MsgHeader>() == 184);

/// Errors produced while decoding wire bytes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("header must be exactly {MSG_SIZE} bytes, got {0}")]
    BadHeaderLength(usize),
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unknown command tag {0}")]
    UnknownCommand(u16),
    #[error("unknown subcommand tag {0}")]
    UnknownSubcommand(u16),
    #[error("declared payload length {declared} does not match buffer length {actual}")]
    PayloadLengthMismatch { declared: usize, actual: usize },
    #[error("payload of {0} bytes exceeds the {MAX_RW_SIZE}-byte cap")]
    OversizedPayload(usize),
    #[error("name is empty, too long, unterminated, or not valid utf-8")]
    BadName,
}

/// Top-level message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// Provider -> broker: promote this control channel to a device.
    Register = 0,
    /// Reserved; providers unregister by closing the channel.
    Unregister = 1,
    /// Broker -> provider: synchronous round-trip request.
    Call = 2,
    /// Provider -> broker: reply to a `Call`.
    Reply = 3,
    /// Broker -> provider: request that does not block for a reply.
    Nonblock = 4,
    /// Provider -> broker: reply to a `Nonblock` request.
    NonblockReply = 5,
    /// Broker -> provider: request whose reply must be dropped.
    CallDropReply = 6,
}

impl Command {
    pub fn from_wire(raw: u16) -> Result<Self, CodecError> {
        Ok(match raw {
            0 => Command::Register,
            1 => Command::Unregister,
            2 => Command::Call,
            3 => Command::Reply,
            4 => Command::Nonblock,
            5 => Command::NonblockReply,
            6 => Command::CallDropReply,
            other => return Err(CodecError::UnknownCommand(other)),
        })
    }

    pub fn to_wire(self) -> u16 {
        self as u16
    }
}

/// Operation selector inside a `Call`/`Reply` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Subcommand {
    /// Placeholder for messages that carry no operation (registration).
    None = 0,
    Open = 100,
    Close = 101,
    Read = 102,
    Write = 103,
    Ioctl = 104,
    /// Long-poll readiness diff; see the broker's readiness protocol.
    PollDiff = 105,
    Unblock = 106,
    Mmap = 107,
}

impl Subcommand {
    pub fn from_wire(raw: u16) -> Result<Self, CodecError> {
        Ok(match raw {
            0 => Subcommand::None,
            100 => Subcommand::Open,
            101 => Subcommand::Close,
            102 => Subcommand::Read,
            103 => Subcommand::Write,
            104 => Subcommand::Ioctl,
            105 => Subcommand::PollDiff,
            106 => Subcommand::Unblock,
            107 => Subcommand::Mmap,
            other => return Err(CodecError::UnknownSubcommand(other)),
        })
    }

    pub fn to_wire(self) -> u16 {
        self as u16
    }
}

/// Raw message header as it appears on the wire.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct MsgHeader {
    pub magic: u32,
    pub cmd: u16,
    pub subcmd: u16,
    /// Wire padding; always zero. See the module docs.
    pub payload_ptr: u64,
    pub payload_len: u32,
    pub reserved: u32,
    pub params: [u8; PARAMS_SIZE],
}

impl MsgHeader {
    /// Parse and sanity-check a raw header buffer, as a provider does after
    /// the first half of a two-phase read. The caller then knows
    /// `payload_len` and can issue the exactly-sized payload read.
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != MSG_SIZE {
            return Err(CodecError::BadHeaderLength(buf.len()));
        }
        let header: MsgHeader = bytemuck::pod_read_unaligned(buf);
        if header.magic != MSG_MAGIC {
            return Err(CodecError::BadMagic(header.magic));
        }
        Ok(header)
    }
}

/// Registration record (provider -> broker).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RegisterParams {
    /// Visible name the device is published under.
    pub name: [u8; NAME_BUF_LEN],
    /// Device class name.
    pub class_name: [u8; NAME_BUF_LEN],
    /// Name of the device node itself.
    pub dev_name: [u8; NAME_BUF_LEN],
    /// Access-mode bits for the published node.
    pub mode: u32,
    pub reserved: u32,
    /// Opaque provider cookie, echoed in every request.
    pub cookie: u64,
}

impl RegisterParams {
    /// Build a registration record, packing and validating all three names.
    pub fn new(
        name: &str,
        class_name: &str,
        dev_name: &str,
        mode: u32,
        cookie: u64,
    ) -> Result<Self, CodecError> {
        let mut params = Self::zeroed();
        pack_name(&mut params.name, name)?;
        pack_name(&mut params.class_name, class_name)?;
        pack_name(&mut params.dev_name, dev_name)?;
        params.mode = mode;
        params.cookie = cookie;
        Ok(params)
    }
}

/// Operation record, shared by requests and replies.
///
/// The broker reads and writes only the fields it is documented to use; all
/// other bytes travel untouched between client and provider.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct OpsParams {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub reserved0: u32,
    /// Client file flags; a reply's value is copied back to the open file.
    pub flags: u64,
    /// Provider cookie from registration. Reply-side changes are ignored.
    pub device_cookie: u64,
    /// Per-open-file cookie; a reply's value is copied back.
    pub client_cookie: u64,
    /// Operation result; negative values are errno-style failures.
    pub retval: i64,
    pub length: u64,
    pub offset: u64,
    /// Ioctl command word, or the cached readiness state on a poll diff.
    pub cmd: u32,
    pub reserved1: u32,
    pub map_prot: u64,
    pub map_flags: u64,
    pub map_offset: u64,
    /// Scalar ioctl argument, or the shared-region key on an mmap reply.
    pub arg: u64,
    /// Opaque open-file identifier assigned by the broker.
    pub file_id: u64,
    pub transid: i64,
    /// Index of the open file in the device's file array at request time;
    /// lets reply routing avoid a scan.
    pub hint: u32,
    pub reserved2: u32,
}

/// Decoded parameter area.
#[derive(Debug, Clone, Copy)]
pub enum Params {
    Register(RegisterParams),
    Ops(OpsParams),
}

/// A decoded message: header fields plus owned payload.
#[derive(Debug, Clone)]
pub struct Msg {
    pub cmd: Command,
    pub subcmd: Subcommand,
    pub params: Params,
    pub payload: Vec<u8>,
}

impl Msg {
    /// A blocking round-trip request with zeroed operation parameters.
    pub fn call(subcmd: Subcommand) -> Self {
        Msg {
            cmd: Command::Call,
            subcmd,
            params: Params::Ops(OpsParams::zeroed()),
            payload: Vec::new(),
        }
    }

    /// A reply to `request`, echoing its operation record.
    pub fn reply_to(request: &OpsParams, subcmd: Subcommand, retval: i64, payload: &[u8]) -> Self {
        let mut ops = *request;
        ops.retval = retval;
        Msg {
            cmd: Command::Reply,
            subcmd,
            params: Params::Ops(ops),
            payload: payload.to_vec(),
        }
    }

    /// Operation parameters, if this is not a registration message.
    pub fn ops(&self) -> Option<&OpsParams> {
        match &self.params {
            Params::Ops(ops) => Some(ops),
            Params::Register(_) => None,
        }
    }

    /// Mutable operation parameters, if this is not a registration message.
    pub fn ops_mut(&mut self) -> Option<&mut OpsParams> {
        match &mut self.params {
            Params::Ops(ops) => Some(ops),
            Params::Register(_) => None,
        }
    }

    /// Serialize the header (only). The payload is sent or read separately,
    /// which is what the two-phase channel read relies on.
    pub fn encode_header(&self) -> [u8; MSG_SIZE] {
        let mut header = MsgHeader::zeroed();
        header.magic = MSG_MAGIC;
        header.cmd = self.cmd.to_wire();
        header.subcmd = self.subcmd.to_wire();
        header.payload_len = self.payload.len() as u32;
        match &self.params {
            Params::Register(params) => {
                header.params[..REGISTER_PARAMS_SIZE].copy_from_slice(bytemuck::bytes_of(params));
            }
            Params::Ops(params) => {
                header.params[..OPS_PARAMS_SIZE].copy_from_slice(bytemuck::bytes_of(params));
            }
        }
        let mut out = [0u8; MSG_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(&header));
        out
    }

    /// Decode one message from a header buffer and its payload buffer.
    ///
    /// The header must be exactly [`MSG_SIZE`] bytes, the payload exactly the
    /// length the header declares, and the declared length within the
    /// [`MAX_RW_SIZE`] cap.
    pub fn decode(header: &[u8], payload: &[u8]) -> Result<Self, CodecError> {
        if header.len() != MSG_SIZE {
            return Err(CodecError::BadHeaderLength(header.len()));
        }
        let raw: MsgHeader = bytemuck::pod_read_unaligned(header);
        if raw.magic != MSG_MAGIC {
            return Err(CodecError::BadMagic(raw.magic));
        }
        let cmd = Command::from_wire(raw.cmd)?;
        let subcmd = Subcommand::from_wire(raw.subcmd)?;
        let declared = raw.payload_len as usize;
        if declared != payload.len() {
            return Err(CodecError::PayloadLengthMismatch {
                declared,
                actual: payload.len(),
            });
        }
        if declared > MAX_RW_SIZE {
            return Err(CodecError::OversizedPayload(declared));
        }
        let params = match cmd {
            Command::Register => Params::Register(bytemuck::pod_read_unaligned(
                &raw.params[..REGISTER_PARAMS_SIZE],
            )),
            _ => Params::Ops(bytemuck::pod_read_unaligned(&raw.params[..OPS_PARAMS_SIZE])),
        };
        Ok(Msg {
            cmd,
            subcmd,
            params,
            payload: payload.to_vec(),
        })
    }
}

/// Copy `name` into a NUL-padded wire buffer.
pub fn pack_name(dst: &mut [u8; NAME_BUF_LEN], name: &str) -> Result<(), CodecError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN || bytes.contains(&0) {
        return Err(CodecError::BadName);
    }
    dst.fill(0);
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Extract a name from a NUL-padded wire buffer.
pub fn unpack_name(src: &[u8; NAME_BUF_LEN]) -> Result<String, CodecError> {
    let end = src
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::BadName)?;
    std::str::from_utf8(&src[..end])
        .map(str::to_owned)
        .map_err(|_| CodecError::BadName)
}

bitflags::bitflags! {
    /// Protection bits requested for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapProt: u64 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

bitflags::bitflags! {
    /// Mapping flags. The broker passes these through to the provider.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const SHARED = 1;
        const PRIVATE = 2;
    }
}
