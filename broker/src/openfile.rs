//! Per-open-file state.
//!
//! One of these exists for every client open the provider has accepted (and,
//! transiently, for opens still in flight). The record carries two condvars:
//! `reply_cv` wakes a client blocked on a provider reply and pairs with the
//! transaction-table mutex; `poll_cv` wakes pollers when the cached readiness
//! state changes and pairs with the state mutex. The op mutex serializes
//! whole operations on one open file, and is released around the reply wait
//! so that polls and reply delivery can proceed while a caller sleeps.

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Condvar, Mutex};

use userdev_proto::Readiness;

use crate::client::ClientCred;
use crate::device::Device;
use crate::transaction::TransactionTable;

/// Mutable per-open state, guarded by the state mutex.
pub(crate) struct FileState {
    /// Client-private cookie; replies may change it.
    pub client_cookie: u64,
    /// Client file flags; replies may change them.
    pub flags: u64,
    /// File position, updated from read/write replies.
    pub pos: u64,
    /// Latest readiness state the provider reported. Zero until the first
    /// diff reply; negative once diffing is disabled.
    pub cached_poll: i32,
    /// Readiness state named in the outstanding diff request, or -1 when a
    /// fresh diff must be dispatched on the next poll.
    pub last_poll_sent: i32,
}

pub(crate) struct OpenFile {
    /// Opaque identifier carried on the wire instead of a pointer.
    pub file_id: u64,
    pub dev: Arc<Device>,
    /// Device version at open time.
    pub dev_version: u64,
    /// Slot in the device's file array; written only under the device mutex.
    pub index: AtomicUsize,
    /// Credentials of the opening client, used for the teardown close.
    pub opened_by: ClientCred,
    /// Serializes operations on this open file.
    pub op_lock: Mutex<()>,
    pub state: Mutex<FileState>,
    /// Paired with `state`; notified when the readiness cache changes.
    pub poll_cv: Condvar,
    pub trans: Mutex<TransactionTable>,
    /// Paired with `trans`; notified when a reply slot is filled.
    pub reply_cv: Condvar,
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("file_id", &self.file_id)
            .finish()
    }
}

impl OpenFile {
    pub fn new(
        file_id: u64,
        dev: Arc<Device>,
        dev_version: u64,
        index: usize,
        cred: ClientCred,
        flags: u64,
    ) -> Self {
        OpenFile {
            file_id,
            dev,
            dev_version,
            index: AtomicUsize::new(index),
            opened_by: cred,
            op_lock: Mutex::new(()),
            state: Mutex::new(FileState {
                client_cookie: 0,
                flags,
                pos: 0,
                cached_poll: 0,
                last_poll_sent: -1,
            }),
            poll_cv: Condvar::new(),
            trans: Mutex::new(TransactionTable::new()),
            reply_cv: Condvar::new(),
        }
    }

    /// Wake both the reply waiter and any pollers. Used on zombification and
    /// signal delivery; each notification happens under its paired lock so a
    /// waiter between predicate check and sleep cannot miss it.
    pub fn wake_all(&self) {
        {
            let _trans = self.trans.lock().unwrap();
            self.reply_cv.notify_all();
        }
        {
            let _state = self.state.lock().unwrap();
            self.poll_cv.notify_all();
        }
    }

    /// Drop readiness bits from the cache, forcing the next poll to re-probe.
    pub fn clear_readiness(&self, bits: Readiness) {
        let mut state = self.state.lock().unwrap();
        if state.cached_poll > 0 {
            state.cached_poll &= !(bits.bits() as i32);
        }
    }
}
