//! Device records and their lifecycle.
//!
//! A device is created the moment a provider opens a control channel and is
//! published (named) by REGISTER. It turns into a zombie when the provider
//! goes away, and is freed only when nothing references it anymore: no open
//! files, no open currently in progress, and the zombie flag set. The file
//! array, the outbound queue, and everything else behind the device mutex
//! follow the locking rules described in the crate docs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, error, info, warn};
use userdev_proto::{Command, Msg, OpsParams, Subcommand};

use crate::client::ClientCred;
use crate::error::{Error, Result};
use crate::openfile::OpenFile;
use crate::queue::MsgQueue;
use crate::region::SharedRegion;
use crate::registry::Registry;

/// Initial capacity of a device's open-file array.
pub(crate) const MIN_FILE_ARRAY: usize = 8;
/// Hard cap on simultaneous opens of one device.
pub(crate) const MAX_FILE_ARRAY: usize = 1024;

/// Fields guarded by the device mutex.
pub(crate) struct DeviceInner {
    /// Visible name; `None` until REGISTER promotes the channel.
    pub name: Option<String>,
    pub class_name: String,
    pub dev_name: String,
    pub mode: u32,
    /// Open files, in slot order. Each file's `index` equals its slot.
    pub files: Vec<Arc<OpenFile>>,
    /// Outbound provider-bound messages.
    pub queue: MsgQueue,
    /// Set once the record has been unlinked from the registry.
    pub freed: bool,
}

pub(crate) struct Device {
    pub id: u64,
    /// Provider process id; used for the self-open check and status output.
    pub pid: u32,
    /// Set when the provider goes away. Checked unlocked on hot paths.
    pub zombie: AtomicBool,
    /// Registration instance number; zero until REGISTER completes.
    pub version: AtomicU64,
    /// Provider cookie from registration, echoed in every request.
    pub cookie: AtomicU64,
    /// Opens that have pinned this device but are not yet in the file
    /// array. Modified and read only under the registry mutex.
    pub open_in_progress: AtomicU32,
    pub inner: Mutex<DeviceInner>,
    /// Paired with `inner`; notified when the outbound queue grows.
    pub msg_cv: Condvar,
    /// Shared regions the provider has exported for mmap replies.
    pub regions: Mutex<HashMap<u64, Arc<SharedRegion>>>,
}

impl Device {
    pub fn new(id: u64, provider_pid: u32) -> Self {
        Device {
            id,
            pid: provider_pid,
            zombie: AtomicBool::new(false),
            version: AtomicU64::new(0),
            cookie: AtomicU64::new(0),
            open_in_progress: AtomicU32::new(0),
            inner: Mutex::new(DeviceInner {
                name: None,
                class_name: String::new(),
                dev_name: String::new(),
                mode: 0,
                files: Vec::with_capacity(MIN_FILE_ARRAY),
                queue: MsgQueue::new(),
                freed: false,
            }),
            msg_cv: Condvar::new(),
            regions: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie.load(Ordering::SeqCst)
    }

    /// Name for log lines. Takes the device mutex.
    pub fn log_name(&self) -> String {
        let inner = self.inner.lock().unwrap();
        inner.name.clone().unwrap_or_else(|| "<noname>".into())
    }
}

/// Add an open file for `cred` to the device. Called with the device mutex
/// held, after the caller pinned the device via the registry.
pub(crate) fn add_file(
    dev: &Arc<Device>,
    inner: &mut DeviceInner,
    registry: &Registry,
    cred: &ClientCred,
    flags: u64,
) -> Result<Arc<OpenFile>> {
    // The device may have zombified while we waited for its lock.
    if dev.is_zombie() {
        return Err(Error::NotFound);
    }

    // A provider opening its own device is the shortest deadlock cycle.
    // Longer cycles are not detected.
    if cred.pid == dev.pid {
        info!(
            "pid {} tried to open its own device {}",
            cred.pid,
            inner.name.as_deref().unwrap_or("<noname>")
        );
        return Err(Error::DeadlockAvoided);
    }

    if inner.files.len() >= MAX_FILE_ARRAY {
        warn!(
            "device {} out of state space for open files",
            inner.name.as_deref().unwrap_or("<noname>")
        );
        return Err(Error::OutOfSpace);
    }

    let file = Arc::new(OpenFile::new(
        registry.alloc_file_id(),
        Arc::clone(dev),
        dev.version.load(Ordering::SeqCst),
        inner.files.len(),
        *cred,
        flags,
    ));
    inner.files.push(Arc::clone(&file));
    Ok(file)
}

/// Remove an open file from the device and cancel everything it still owes.
///
/// Outstanding transactions are drained; a drained reply that completed an
/// OPEN successfully triggers a forged close so the provider's open/close
/// pairing stays balanced. Returns `true` if this also freed the device, in
/// which case the caller must stop touching it.
///
/// Called with the device mutex held.
pub(crate) fn free_file(
    dev: &Arc<Device>,
    inner: &mut DeviceInner,
    registry: &Registry,
    file: &Arc<OpenFile>,
) -> bool {
    let idx = file.index.load(Ordering::SeqCst);
    let slot = if inner.files.get(idx).is_some_and(|f| f.file_id == file.file_id) {
        Some(idx)
    } else {
        // The index should always be right; fall back to a scan rather than
        // corrupt the array.
        error!(
            "open file {} has stale index {} on device {}",
            file.file_id, idx, dev.id
        );
        inner.files.iter().position(|f| f.file_id == file.file_id)
    };

    if let Some(slot) = slot {
        inner.files.swap_remove(slot);
        if let Some(moved) = inner.files.get(slot) {
            moved.index.store(slot, Ordering::SeqCst);
        }
    }

    let drained = file.trans.lock().unwrap().drain();
    for t in drained {
        if let Some(reply) = t.reply {
            if reply.subcmd == Subcommand::Open && reply.ops.retval == 0 {
                forge_close(dev, inner, registry, &reply.ops);
            }
        }
    }

    adjust_file_capacity(inner);
    maybe_free(dev, inner, registry)
}

/// Shrink the file array when occupancy drops below a quarter of its
/// capacity, staying at or above the minimum. Growth is handled by the push
/// in `add_file`, which doubles from the initial size of 8.
fn adjust_file_capacity(inner: &mut DeviceInner) {
    let len = inner.files.len();
    let cap = inner.files.capacity();
    if cap > MIN_FILE_ARRAY && cap > 4 * len {
        inner.files.shrink_to((2 * len).max(MIN_FILE_ARRAY));
    }
}

/// Mark the device dead and wake every blocked client. The record itself
/// survives until `maybe_free` says otherwise.
///
/// Called with the device mutex held.
pub(crate) fn zombify(dev: &Arc<Device>, inner: &mut DeviceInner) {
    if dev.zombie.swap(true, Ordering::SeqCst) {
        warn!("zombify called on a zombie");
        return;
    }

    info!(
        "device {} turning into a zombie ({} open files)",
        inner.name.as_deref().unwrap_or("<noname>"),
        inner.files.len()
    );

    for file in &inner.files {
        file.wake_all();
    }
    dev.msg_cv.notify_all();
}

/// Free the device if nothing references it: it must be a zombie with no
/// open files and no open in progress. Unlinks it from the registry, drops
/// any queued messages, and wakes status readers.
///
/// Called with the device mutex held; takes the registry mutex, in that
/// order. Returns `true` once the device is off the registry.
pub(crate) fn maybe_free(dev: &Arc<Device>, inner: &mut DeviceInner, registry: &Registry) -> bool {
    let mut reg = registry.inner.lock().unwrap();

    if !dev.is_zombie()
        || !inner.files.is_empty()
        || dev.open_in_progress.load(Ordering::SeqCst) != 0
    {
        return false;
    }
    if inner.freed {
        return true;
    }

    debug!(
        "freeing state for device {}",
        inner.name.as_deref().unwrap_or("<noname>")
    );

    reg.devices.retain(|d| d.id != dev.id);
    if let Some(name) = &inner.name {
        reg.names.remove(name);
    }
    registry.bump_version_locked(&reg);
    drop(reg);

    inner.queue.clear();
    inner.freed = true;
    true
}

/// Queue a CLOSE the provider must not answer, balancing a successful OPEN
/// whose client is already gone.
///
/// Called with the device mutex held.
pub(crate) fn forge_close(
    dev: &Arc<Device>,
    inner: &mut DeviceInner,
    registry: &Registry,
    ops: &OpsParams,
) {
    warn!(
        "device {} completed an open for transid {} with no client left, forging a close",
        inner.name.as_deref().unwrap_or("<noname>"),
        ops.transid
    );

    let mut msg = Msg::call(Subcommand::Close);
    msg.cmd = Command::CallDropReply;
    {
        let out = msg.ops_mut().expect("call messages carry ops params");
        *out = *ops;
        out.retval = 0;
        out.transid = registry.alloc_transid();
    }
    inner.queue.push(msg);
    dev.msg_cv.notify_all();
}
