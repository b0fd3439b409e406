//! Wire protocol shared by the userdev broker and device providers.
//!
//! Everything that crosses the provider control channel is described here:
//! the fixed-layout message record, the command and subcommand tags, the
//! readiness bitset, the ioctl command-word encoding, and the binary status
//! record. Both sides of the channel depend on this crate and nothing else,
//! so the wire contract has exactly one definition.

pub mod constants;
pub mod ioctl;
pub mod msg;
pub mod readiness;
pub mod status;

pub use constants::{MAX_NAME_LEN, MAX_RW_SIZE, MSG_MAGIC, NAME_BUF_LEN};
pub use msg::{
    CodecError, Command, MapFlags, MapProt, Msg, MsgHeader, OpsParams, Params, RegisterParams,
    Subcommand, MSG_SIZE,
};
pub use readiness::Readiness;
pub use status::{StatusRecord, STATUS_RECORD_SIZE};
