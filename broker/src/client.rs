//! Client-facing operations.
//!
//! Every handler follows the same template: validate the device and open
//! file, look for an in-flight transaction this call can adopt (a restarted
//! call), otherwise build a request and enqueue it on the device, then block
//! until the reply slot fills. Interruption is modeled by [`Interrupt`]
//! tokens: raising one makes the blocked call return
//! [`Error::RestartNeeded`] while its transaction stays alive, and the next
//! identical call from the same pid adopts it instead of sending a duplicate
//! request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info, warn};
use userdev_proto::ioctl::{ioc_dir, ioc_size, DIR_NONE, DIR_READ, DIR_WRITE};
use userdev_proto::{MapFlags, MapProt, Msg, Readiness, Subcommand, MAX_RW_SIZE};

use crate::device::{self, Device};
use crate::error::{Error, Result};
use crate::openfile::OpenFile;
use crate::region::MappedRegion;
use crate::registry::Registry;
use crate::transaction::ReplyMsg;
use crate::DeviceId;

/// Identity of the process performing a client operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCred {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl ClientCred {
    pub fn new(pid: u32, uid: u32, gid: u32) -> Self {
        ClientCred { pid, uid, gid }
    }
}

/// Signal-delivery stand-in for blocked client calls.
///
/// A raised token makes every blocking operation that was handed it return
/// [`Error::RestartNeeded`]; the host clears it and reissues the call, which
/// then adopts the still-live transaction. Tokens are cheap to clone and may
/// be shared between threads.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

#[derive(Default)]
struct InterruptInner {
    raised: AtomicBool,
    /// Open files currently blocked under this token; raising wakes them.
    watchers: Mutex<Vec<(u64, Weak<OpenFile>)>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver the signal: wake every blocked call watching this token.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        let watchers = self.inner.watchers.lock().unwrap();
        for (_, file) in watchers.iter() {
            if let Some(file) = file.upgrade() {
                file.wake_all();
            }
        }
    }

    pub fn clear(&self) {
        self.inner.raised.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    fn watch<'a>(&'a self, file: &Arc<OpenFile>) -> IntrWatch<'a> {
        self.inner
            .watchers
            .lock()
            .unwrap()
            .push((file.file_id, Arc::downgrade(file)));
        IntrWatch {
            intr: self,
            file_id: file.file_id,
        }
    }
}

/// Unregisters a watcher when the blocking call leaves its wait.
struct IntrWatch<'a> {
    intr: &'a Interrupt,
    file_id: u64,
}

impl Drop for IntrWatch<'_> {
    fn drop(&mut self) {
        let mut watchers = self.intr.inner.watchers.lock().unwrap();
        if let Some(pos) = watchers.iter().position(|(id, _)| *id == self.file_id) {
            watchers.swap_remove(pos);
        }
    }
}

/// Argument of an ioctl call: either a bare scalar or a payload buffer whose
/// length must match the size encoded in the command word.
pub enum IoctlArg<'a> {
    Scalar(u64),
    Buf(&'a mut [u8]),
}

/// One client open of a pseudo-device.
///
/// All operations take the caller's credentials explicitly, since the broker
/// has no ambient notion of a current process. Dropping the handle without
/// calling [`OpenHandle::close`] still tells the provider, but without
/// waiting for its answer.
pub struct OpenHandle {
    file: Arc<OpenFile>,
    registry: Arc<Registry>,
    released: AtomicBool,
}

impl std::fmt::Debug for OpenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenHandle")
            .field("file_id", &self.file.file_id)
            .finish()
    }
}

/// The elaborate open dance: pin the device in the registry, join its file
/// array, then run the OPEN round trip with no device lock held. A failure
/// after the file was added tears it down again and may free a device that
/// zombified while we were blocked.
pub(crate) fn open_device(
    registry: &Arc<Registry>,
    id: DeviceId,
    cred: &ClientCred,
    flags: u64,
    intr: &Interrupt,
) -> Result<OpenHandle> {
    let dev = registry.lookup_and_pin(id.0).ok_or(Error::NotFound)?;

    let mut inner = dev.inner.lock().unwrap();
    debug!(
        "open for {} (owned by pid {}) from pid {}",
        inner.name.as_deref().unwrap_or("<noname>"),
        dev.pid,
        cred.pid
    );
    let added = device::add_file(&dev, &mut inner, registry, cred, flags);

    // Whatever happened, the file array (or the error) now holds the
    // reference; the in-progress pin has done its job.
    registry.unpin(&dev);

    let file = match added {
        Ok(file) => file,
        Err(err) => {
            // A zombie may have been waiting on our pin to be freed.
            device::maybe_free(&dev, &mut inner, registry);
            return Err(err);
        }
    };
    drop(inner);

    let handle = OpenHandle {
        file: Arc::clone(&file),
        registry: Arc::clone(registry),
        released: AtomicBool::new(false),
    };

    let waited = call_send(registry, &file, cred, Msg::call(Subcommand::Open), true)
        .and_then(|transid| call_wait(&file, transid, Subcommand::Open, intr));

    let mut inner = dev.inner.lock().unwrap();
    let result = if dev.is_zombie() {
        // Zombified while we were blocked; the open did not happen.
        Err(Error::NotFound)
    } else {
        match waited {
            Ok(reply) if reply.ops.retval < 0 => Err(Error::from_retval(reply.ops.retval)),
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        }
    };

    if let Err(err) = result {
        debug!(
            "open failed for {} from pid {}: {err}",
            inner.name.as_deref().unwrap_or("<noname>"),
            cred.pid
        );
        device::free_file(&dev, &mut inner, registry, &file);
        handle.released.store(true, Ordering::SeqCst);
        return Err(err);
    }
    Ok(handle)
}

impl OpenHandle {
    /// Current client file flags (replies may have updated them).
    pub fn flags(&self) -> u64 {
        self.file.state.lock().unwrap().flags
    }

    /// Current file position.
    pub fn pos(&self) -> u64 {
        self.file.state.lock().unwrap().pos
    }

    /// Close the open file. The provider is consulted, but the open file is
    /// torn down whatever it answers; a client's close always completes.
    pub fn close(self, cred: &ClientCred, intr: &Interrupt) -> Result<i64> {
        let result = self.close_roundtrip(cred, intr);
        self.released.store(true, Ordering::SeqCst);
        result
    }

    fn close_roundtrip(&self, cred: &ClientCred, intr: &Interrupt) -> Result<i64> {
        let file = &self.file;
        let dev = &file.dev;
        debug!(
            "close on {} from pid {}",
            dev.log_name(),
            cred.pid
        );

        let op = file.op_lock.lock().unwrap();
        let sent = call_send(&self.registry, file, cred, Msg::call(Subcommand::Close), true);
        drop(op);
        let waited = sent.and_then(|transid| call_wait(file, transid, Subcommand::Close, intr));

        let mut inner = dev.inner.lock().unwrap();
        device::free_file(dev, &mut inner, &self.registry, file);
        drop(inner);

        let reply = waited?;
        if reply.ops.retval < 0 {
            Err(Error::from_retval(reply.ops.retval))
        } else {
            Ok(reply.ops.retval)
        }
    }

    pub fn read(&self, cred: &ClientCred, buf: &mut [u8], intr: &Interrupt) -> Result<usize> {
        if self.file.dev.is_zombie() {
            debug!("read from pid {} on a vanished device", cred.pid);
            return Err(Error::ConnectionLost);
        }
        let result = self.read_inner(cred, buf, intr);
        // Force the next poll to re-probe input readiness, whatever happened.
        self.file.clear_readiness(Readiness::READABLE);
        result
    }

    fn read_inner(&self, cred: &ClientCred, buf: &mut [u8], intr: &Interrupt) -> Result<usize> {
        let file = &self.file;
        let dev = &file.dev;
        let op = file.op_lock.lock().unwrap();
        debug!(
            "read on {} (owned by pid {}) from pid {}",
            dev.log_name(),
            dev.pid,
            cred.pid
        );

        let count = buf.len().min(MAX_RW_SIZE);
        let adopted = match find_incomplete(file, cred.pid, Subcommand::Read) {
            // The client shrank its buffer between attempts; the old answer
            // may no longer fit. Throw it away and start over.
            Some((id, size)) if size as usize > count => {
                info!(
                    "transaction {id} discarded: previous read of {size} bytes, retry wants {count}"
                );
                file.trans.lock().unwrap().remove(id);
                None
            }
            other => other,
        };

        let transid = match adopted {
            Some((id, _)) => id,
            None => {
                let mut msg = Msg::call(Subcommand::Read);
                msg.ops_mut().expect("call messages carry ops params").length = count as u64;
                call_send(&self.registry, file, cred, msg, true)?
            }
        };

        drop(op);
        let reply = call_wait(file, transid, Subcommand::Read, intr)?;
        let _op = file.op_lock.lock().unwrap();

        if reply.ops.retval < 0 {
            return Err(Error::from_retval(reply.ops.retval));
        }

        // The payload is the authoritative byte count; trust it over the
        // provider's claim, then clip to what the client asked for.
        let mut n = reply.ops.retval as usize;
        if reply.payload.len() != n {
            warn!(
                "device {} claimed {} bytes on read but returned {}",
                dev.log_name(),
                n,
                reply.payload.len()
            );
            n = reply.payload.len();
        }
        if n > count {
            warn!(
                "device {} returned {n} bytes on read but only {count} were asked for",
                dev.log_name()
            );
            n = count;
        }

        file.state.lock().unwrap().pos = reply.ops.offset;
        buf[..n].copy_from_slice(&reply.payload[..n]);
        Ok(n)
    }

    pub fn write(&self, cred: &ClientCred, buf: &[u8], intr: &Interrupt) -> Result<usize> {
        if self.file.dev.is_zombie() {
            debug!("write from pid {} on a vanished device", cred.pid);
            return Err(Error::ConnectionLost);
        }
        let result = self.write_inner(cred, buf, intr);
        self.file.clear_readiness(Readiness::WRITABLE);
        result
    }

    fn write_inner(&self, cred: &ClientCred, buf: &[u8], intr: &Interrupt) -> Result<usize> {
        let file = &self.file;
        let dev = &file.dev;
        let op = file.op_lock.lock().unwrap();
        debug!(
            "write on {} (owned by pid {}) from pid {}",
            dev.log_name(),
            dev.pid,
            cred.pid
        );

        let count = buf.len().min(MAX_RW_SIZE);
        let adopted = match find_incomplete(file, cred.pid, Subcommand::Write) {
            Some((id, size)) if size as usize != count => {
                info!(
                    "transaction {id} discarded: previous write of {size} bytes, retry has {count}"
                );
                file.trans.lock().unwrap().remove(id);
                None
            }
            other => other,
        };

        let transid = match adopted {
            Some((id, _)) => id,
            None => {
                // Zero-length writes are legal and travel without a payload.
                let mut msg = Msg::call(Subcommand::Write);
                msg.ops_mut().expect("call messages carry ops params").length = count as u64;
                msg.payload = buf[..count].to_vec();
                call_send(&self.registry, file, cred, msg, true)?
            }
        };

        drop(op);
        let reply = call_wait(file, transid, Subcommand::Write, intr)?;
        let _op = file.op_lock.lock().unwrap();

        if reply.ops.retval < 0 {
            return Err(Error::from_retval(reply.ops.retval));
        }

        let mut n = reply.ops.retval as usize;
        if n > count {
            warn!(
                "device {} accepted {n} bytes on write but only {count} were offered",
                dev.log_name()
            );
            n = count;
        }
        file.state.lock().unwrap().pos = reply.ops.offset;
        Ok(n)
    }

    /// Ioctl round trip. Direction and payload size come from the command
    /// word; see `userdev_proto::ioctl` for the encoding.
    pub fn ioctl(
        &self,
        cred: &ClientCred,
        cmd: u32,
        mut arg: IoctlArg<'_>,
        intr: &Interrupt,
    ) -> Result<i64> {
        if self.file.dev.is_zombie() {
            debug!("ioctl from pid {} on a vanished device", cred.pid);
            return Err(Error::ConnectionLost);
        }

        let file = &self.file;
        let dev = &file.dev;
        let dir = ioc_dir(cmd);
        let length = ioc_size(cmd);

        let op = file.op_lock.lock().unwrap();
        debug!(
            "ioctl {cmd:#x} on {} (owned by pid {}) from pid {}",
            dev.log_name(),
            dev.pid,
            cred.pid
        );

        let transid = match find_incomplete(file, cred.pid, Subcommand::Ioctl) {
            Some((id, _)) => id,
            None => {
                if dir != DIR_NONE && (length == 0 || length > MAX_RW_SIZE) {
                    debug!("ioctl with unusable payload size {length}");
                    return Err(Error::InvalidArgument);
                }
                let scalar = match (&arg, dir) {
                    (IoctlArg::Scalar(v), DIR_NONE) => *v,
                    (IoctlArg::Scalar(_), _) | (IoctlArg::Buf(_), DIR_NONE) => {
                        return Err(Error::InvalidArgument);
                    }
                    (IoctlArg::Buf(buf), _) => {
                        if buf.len() != length {
                            return Err(Error::InvalidArgument);
                        }
                        0
                    }
                };

                let mut msg = Msg::call(Subcommand::Ioctl);
                {
                    let ops = msg.ops_mut().expect("call messages carry ops params");
                    ops.cmd = cmd;
                    ops.arg = scalar;
                    ops.length = length as u64;
                }
                if dir & DIR_WRITE != 0 {
                    if let IoctlArg::Buf(buf) = &arg {
                        msg.payload = buf.to_vec();
                    }
                }
                call_send(&self.registry, file, cred, msg, true)?
            }
        };

        drop(op);
        let reply = call_wait(file, transid, Subcommand::Ioctl, intr)?;
        let _op = file.op_lock.lock().unwrap();

        if reply.ops.retval < 0 {
            return Err(Error::from_retval(reply.ops.retval));
        }

        if dir & DIR_READ != 0 {
            // The reply payload must be exactly the size the command word
            // promised, or the client buffer contract is broken.
            if reply.payload.len() != length {
                warn!(
                    "device {} answered ioctl {cmd:#x} with {} payload bytes, wanted {length}",
                    dev.log_name(),
                    reply.payload.len()
                );
                return Err(Error::Io);
            }
            match &mut arg {
                IoctlArg::Buf(buf) => buf.copy_from_slice(&reply.payload),
                IoctlArg::Scalar(_) => return Err(Error::InvalidArgument),
            }
        }
        Ok(reply.ops.retval)
    }

    /// Nonblocking readiness query.
    ///
    /// Returns the cached readiness immediately. If the cache differs from
    /// the state last sent to the provider, a readiness-diff request is
    /// dispatched first (without waiting for its answer); the provider
    /// replies once reality stops matching what it was told, which updates
    /// the cache and wakes [`OpenHandle::select`] sleepers.
    pub fn poll(&self, cred: &ClientCred) -> Result<Readiness> {
        let file = &self.file;
        let dev = &file.dev;
        if dev.is_zombie() {
            return Ok(Readiness::EXCEPTION);
        }

        let _op = file.op_lock.lock().unwrap();
        let (send_diff, cached) = {
            let mut state = file.state.lock().unwrap();
            let send = state.last_poll_sent != state.cached_poll && state.cached_poll >= 0;
            if send {
                state.last_poll_sent = state.cached_poll;
            }
            (send, state.cached_poll)
        };

        if send_diff {
            debug!(
                "dispatching readiness diff for {} (cached {cached})",
                dev.log_name()
            );
            let mut msg = Msg::call(Subcommand::PollDiff);
            msg.cmd = userdev_proto::Command::Nonblock;
            msg.ops_mut().expect("call messages carry ops params").cmd = cached as u32;
            if call_send(&self.registry, file, cred, msg, false).is_err() {
                // Couldn't dispatch; make the next poll try again. An extra
                // diff request never hurts.
                file.state.lock().unwrap().last_poll_sent = -1;
            }
        }

        Ok(Readiness::from_state(cached))
    }

    /// Level-triggered blocking wait: poll, and sleep until the cached
    /// readiness intersects `interest`. This is the piece a host's select
    /// loop builds on.
    pub fn select(
        &self,
        cred: &ClientCred,
        interest: Readiness,
        intr: &Interrupt,
    ) -> Result<Readiness> {
        let file = &self.file;
        let _watch = intr.watch(file);
        loop {
            let bits = self.poll(cred)?;
            if bits.intersects(interest) {
                return Ok(bits);
            }
            if file.dev.is_zombie() {
                return Ok(Readiness::EXCEPTION);
            }

            let mut state = file.state.lock().unwrap();
            while Readiness::from_state(state.cached_poll) == bits
                && !file.dev.is_zombie()
                && !intr.is_raised()
            {
                state = file.poll_cv.wait(state).unwrap();
            }
            if intr.is_raised() {
                return Err(Error::RestartNeeded);
            }
        }
    }

    /// Map a range of the device. The provider's reply names one of its
    /// exported shared regions; the returned handle resolves accesses
    /// against it, refusing out-of-range offsets and unshareable memory.
    pub fn mmap(
        &self,
        cred: &ClientCred,
        offset: u64,
        length: u64,
        prot: MapProt,
        flags: MapFlags,
        intr: &Interrupt,
    ) -> Result<MappedRegion> {
        if self.file.dev.is_zombie() {
            debug!("mmap from pid {} on a vanished device", cred.pid);
            return Err(Error::ConnectionLost);
        }

        let file = &self.file;
        let dev = &file.dev;
        let op = file.op_lock.lock().unwrap();
        debug!(
            "mmap on {} (owned by pid {}) from pid {}",
            dev.log_name(),
            dev.pid,
            cred.pid
        );

        let transid = match find_incomplete(file, cred.pid, Subcommand::Mmap) {
            Some((id, _)) => id,
            None => {
                let mut msg = Msg::call(Subcommand::Mmap);
                {
                    let ops = msg.ops_mut().expect("call messages carry ops params");
                    ops.length = length;
                    ops.map_offset = offset;
                    ops.map_prot = prot.bits();
                    ops.map_flags = flags.bits();
                }
                call_send(&self.registry, file, cred, msg, true)?
            }
        };

        drop(op);
        let reply = call_wait(file, transid, Subcommand::Mmap, intr)?;
        let _op = file.op_lock.lock().unwrap();

        if reply.ops.retval < 0 {
            return Err(Error::from_retval(reply.ops.retval));
        }

        let key = reply.ops.arg;
        let granted = reply.ops.length;
        let export = dev.regions.lock().unwrap().get(&key).cloned();
        let Some(export) = export else {
            warn!(
                "device {} answered mmap with unknown region key {key:#x}",
                dev.log_name()
            );
            return Err(Error::NotSupported);
        };
        Ok(MappedRegion::new(export, offset, granted, prot))
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        // The handle is going away without a proper close; tell the provider
        // with a drop-reply close so its open/close accounting stays
        // balanced, then tear the open file down.
        let cred = self.file.opened_by;
        let mut msg = Msg::call(Subcommand::Close);
        msg.cmd = userdev_proto::Command::CallDropReply;
        let _ = call_send(&self.registry, &self.file, &cred, msg, false);

        let dev = Arc::clone(&self.file.dev);
        let mut inner = dev.inner.lock().unwrap();
        device::free_file(&dev, &mut inner, &self.registry, &self.file);
    }
}

/// Restart bookkeeping: find an in-flight transaction from `pid` on this
/// open file. A transaction with a different subcommand means the client
/// changed its mind; it is discarded and the caller starts fresh.
fn find_incomplete(file: &OpenFile, pid: u32, subcmd: Subcommand) -> Option<(i64, u64)> {
    let mut table = file.trans.lock().unwrap();
    let t = table.find_by_pid(pid)?;
    let (id, size, existing) = (t.id, t.size, t.subcmd);
    if existing != subcmd {
        info!(
            "transaction {id} discarded: was {existing:?}, pid {pid} now wants {subcmd:?}"
        );
        table.remove(id);
        return None;
    }
    debug!("pid {pid} restarting call with transid {id}");
    Some((id, size))
}

/// Fill the request's common fields, register its transaction, and enqueue
/// it on the device. Returns the transaction id.
pub(crate) fn call_send(
    registry: &Registry,
    file: &Arc<OpenFile>,
    cred: &ClientCred,
    mut msg: Msg,
    with_transaction: bool,
) -> Result<i64> {
    let dev: &Arc<Device> = &file.dev;

    let (flags, pos, client_cookie) = {
        let state = file.state.lock().unwrap();
        (state.flags, state.pos, state.client_cookie)
    };

    let subcmd = msg.subcmd;
    let (transid, size) = {
        let ops = msg.ops_mut().expect("requests carry ops params");
        ops.pid = cred.pid;
        ops.uid = cred.uid;
        ops.gid = cred.gid;
        ops.flags = flags;
        ops.offset = pos;
        ops.device_cookie = dev.cookie.load(Ordering::SeqCst);
        ops.client_cookie = client_cookie;
        ops.file_id = file.file_id;
        ops.transid = registry.alloc_transid();
        ops.hint = file.index.load(Ordering::SeqCst) as u32;
        (ops.transid, ops.length)
    };

    if with_transaction {
        file.trans
            .lock()
            .unwrap()
            .add(transid, subcmd, cred.pid, size);
    }

    let mut inner = dev.inner.lock().unwrap();
    if dev.is_zombie() {
        drop(inner);
        if with_transaction {
            file.trans.lock().unwrap().remove(transid);
        }
        return Err(Error::ConnectionLost);
    }
    inner.queue.push(msg);
    drop(inner);
    dev.msg_cv.notify_all();
    Ok(transid)
}

/// Block until the transaction's reply slot is populated, then validate the
/// reply and copy the client-owned fields back to the open file.
///
/// The caller must not hold the op mutex; polls and reply delivery proceed
/// while we sleep. A raised interrupt returns [`Error::RestartNeeded`] and
/// leaves the transaction alive; zombification returns
/// [`Error::ConnectionLost`] and leaves it for close-time cancellation.
pub(crate) fn call_wait(
    file: &Arc<OpenFile>,
    transid: i64,
    expect: Subcommand,
    intr: &Interrupt,
) -> Result<ReplyMsg> {
    let _watch = intr.watch(file);
    let mut table = file.trans.lock().unwrap();
    loop {
        let Some(t) = table.find_mut(transid) else {
            warn!("waiting on transid {transid} that is no longer in the table");
            return Err(Error::ConnectionLost);
        };
        if let Some(reply) = t.reply.take() {
            table.remove(transid);
            drop(table);
            return finish_reply(file, transid, expect, reply);
        }
        if file.dev.is_zombie() {
            debug!("device zombified while pid waited on transid {transid}");
            return Err(Error::ConnectionLost);
        }
        if intr.is_raised() {
            debug!("blocked call got a signal; returning restart for transid {transid}");
            return Err(Error::RestartNeeded);
        }
        table = file.reply_cv.wait(table).unwrap();
    }
}

fn finish_reply(
    file: &OpenFile,
    transid: i64,
    expect: Subcommand,
    reply: ReplyMsg,
) -> Result<ReplyMsg> {
    if reply.cmd != userdev_proto::Command::Reply
        || reply.subcmd != expect
        || reply.ops.transid != transid
        || reply.ops.file_id != file.file_id
    {
        warn!(
            "invalid reply for transid {transid}: cmd {:?}, subcmd {:?} (wanted {expect:?}), \
             file {} (wanted {})",
            reply.cmd, reply.subcmd, reply.ops.file_id, file.file_id
        );
        return Err(Error::ConnectionLost);
    }

    // Copy client-owned metadata back. Provider-cookie changes are never
    // honored here.
    let mut state = file.state.lock().unwrap();
    state.flags = reply.ops.flags;
    state.client_cookie = reply.ops.client_cookie;
    drop(state);

    Ok(reply)
}
