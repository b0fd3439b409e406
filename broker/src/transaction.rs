//! In-flight request bookkeeping, one table per open file.
//!
//! A transaction is created just before its request is enqueued and removed
//! once the matching reply has been consumed, or when the open file is torn
//! down. The table has its own mutex so reply delivery, which only knows the
//! open-file identifier, never has to take the device or open-file locks.
//! Restarted calls find their old transaction here by client pid.

use userdev_proto::{Command, OpsParams, Subcommand};

/// A reply as delivered by the provider: decoded header plus owned payload.
#[derive(Debug, Clone)]
pub(crate) struct ReplyMsg {
    pub cmd: Command,
    pub subcmd: Subcommand,
    pub ops: OpsParams,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct Transaction {
    pub id: i64,
    pub subcmd: Subcommand,
    /// Pid of the client that issued the request; restarts match on it.
    pub pid: u32,
    /// Requested payload size, used to decide whether a retry may adopt.
    pub size: u64,
    pub reply: Option<ReplyMsg>,
}

#[derive(Default)]
pub(crate) struct TransactionTable {
    entries: Vec<Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: i64, subcmd: Subcommand, pid: u32, size: u64) {
        self.entries.push(Transaction {
            id,
            subcmd,
            pid,
            size,
            reply: None,
        });
    }

    pub fn find_mut(&mut self, id: i64) -> Option<&mut Transaction> {
        self.entries.iter_mut().find(|t| t.id == id)
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<&Transaction> {
        self.entries.iter().find(|t| t.pid == pid)
    }

    pub fn remove(&mut self, id: i64) -> Option<Transaction> {
        let pos = self.entries.iter().position(|t| t.id == id)?;
        Some(self.entries.swap_remove(pos))
    }

    /// Take every outstanding transaction; used at close time.
    pub fn drain(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
