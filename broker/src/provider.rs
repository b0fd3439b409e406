//! The provider control channel.
//!
//! A provider opens exactly one of these, writes a REGISTER message to
//! promote it to a device, then services requests: it reads each outbound
//! message in two phases (header, then payload if the header declares one)
//! and writes replies back. Reply routing matches on the open-file
//! identifier, the transaction id and the subcommand, trying the hint index
//! before falling back to a scan of the file array.
//!
//! Protocol violations (bad magic, malformed framing, unknown tags) poison
//! the channel: the offending write fails and every later write fails with
//! an I/O error. Reads keep working so a dying provider can still drain its
//! queue.
//!
//! Dropping the channel is how a provider unregisters, deliberately or by
//! crashing: the device zombifies, every blocked client is woken, and the
//! record is freed once the last open file lets go.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use userdev_proto::msg::unpack_name;
use userdev_proto::{Command, Msg, OpsParams, Params, Readiness, RegisterParams, Subcommand,
    MSG_SIZE};

use crate::device::{self, Device, DeviceInner};
use crate::error::{Error, Result};
use crate::region::SharedRegion;
use crate::registry::Registry;
use crate::transaction::ReplyMsg;

pub struct ControlChannel {
    dev: Arc<Device>,
    registry: Arc<Registry>,
    nonblocking: AtomicBool,
    poisoned: AtomicBool,
}

impl ControlChannel {
    pub(crate) fn new(dev: Arc<Device>, registry: Arc<Registry>) -> Self {
        ControlChannel {
            dev,
            registry,
            nonblocking: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Switch reads between blocking and try-again behavior.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::SeqCst);
    }

    /// Write a header-only message (registration, or a payload-less reply).
    pub fn write(&self, header: &[u8]) -> Result<usize> {
        self.writev(header, &[])
    }

    /// Write one message as a header buffer plus its payload buffer.
    pub fn writev(&self, header: &[u8], payload: &[u8]) -> Result<usize> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(Error::Io);
        }

        let msg = match Msg::decode(header, payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("control channel protocol violation: {err}");
                self.poisoned.store(true, Ordering::SeqCst);
                return Err(Error::Protocol(err));
            }
        };

        let written = header.len() + payload.len();
        match msg.cmd {
            Command::Register => {
                let Params::Register(params) = &msg.params else {
                    return Err(Error::InvalidArgument);
                };
                self.register_device(params)?;
            }
            Command::Unregister => {
                // Providers unregister by closing the channel; this tag is
                // never serviced here.
                warn!("unregister written to the control channel; close it instead");
                return Err(Error::InvalidArgument);
            }
            Command::Reply => self.operation_reply(msg)?,
            Command::NonblockReply => match msg.subcmd {
                Subcommand::PollDiff => self.readiness_reply(&msg)?,
                other => {
                    warn!("nonblocking reply with unexpected subcommand {other:?}");
                    return Err(Error::InvalidArgument);
                }
            },
            Command::Call | Command::Nonblock | Command::CallDropReply => {
                warn!("request command {:?} written by a provider", msg.cmd);
                return Err(Error::InvalidArgument);
            }
        }
        Ok(written)
    }

    /// Two-phase read of the next outbound message.
    ///
    /// The first read must ask for exactly the header size; if the header
    /// declares a payload, the next read must ask for exactly that many
    /// bytes, and that second read is what dequeues the message. Any other
    /// length is an argument error and leaves the queue untouched.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let dev = &self.dev;
        let mut inner = dev.inner.lock().unwrap();

        while inner.queue.is_empty() {
            if dev.is_zombie() {
                return Err(Error::ConnectionLost);
            }
            if self.nonblocking.load(Ordering::SeqCst) {
                return Err(Error::WouldBlock);
            }
            inner = dev.msg_cv.wait(inner).unwrap();
        }

        let front = inner.queue.front_mut().expect("queue checked non-empty");
        if !front.peeked {
            if buf.len() != MSG_SIZE {
                debug!("header read of {} bytes, want exactly {MSG_SIZE}", buf.len());
                return Err(Error::InvalidArgument);
            }
            buf.copy_from_slice(&front.msg.encode_header());
            if front.msg.payload.is_empty() {
                inner.queue.pop();
            } else {
                front.peeked = true;
            }
            Ok(MSG_SIZE)
        } else {
            let want = front.msg.payload.len();
            if buf.len() != want {
                debug!("payload read of {} bytes, want exactly {want}", buf.len());
                return Err(Error::InvalidArgument);
            }
            buf.copy_from_slice(&front.msg.payload);
            inner.queue.pop();
            Ok(want)
        }
    }

    /// Readable while the outbound queue is non-empty.
    pub fn poll(&self) -> Readiness {
        let inner = self.dev.inner.lock().unwrap();
        if inner.queue.is_empty() {
            Readiness::empty()
        } else {
            Readiness::READABLE
        }
    }

    /// Publish a shareable region under `key` for later MMAP replies.
    pub fn export_region(&self, key: u64, region: Arc<SharedRegion>) {
        self.dev.regions.lock().unwrap().insert(key, region);
    }

    /// Withdraw a region export. Existing client mappings stay alive.
    pub fn remove_region(&self, key: u64) {
        self.dev.regions.lock().unwrap().remove(&key);
    }

    /// Promote this channel to a registered device.
    fn register_device(&self, params: &RegisterParams) -> Result<()> {
        let name = unpack_name(&params.name).map_err(|_| Error::InvalidArgument)?;
        let class_name = unpack_name(&params.class_name).map_err(|_| Error::InvalidArgument)?;
        let dev_name = unpack_name(&params.dev_name).map_err(|_| Error::InvalidArgument)?;
        if name.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let dev = &self.dev;
        let mut inner = dev.inner.lock().unwrap();
        if dev.version.load(Ordering::SeqCst) != 0 {
            warn!(
                "channel of pid {} is already promoted to {}",
                dev.pid,
                inner.name.as_deref().unwrap_or("<noname>")
            );
            return Err(Error::AlreadyExists);
        }

        let version = self.registry.publish(dev, &name)?;
        inner.name = Some(name);
        inner.class_name = class_name;
        inner.dev_name = dev_name;
        inner.mode = params.mode;
        dev.cookie.store(params.cookie, Ordering::SeqCst);
        dev.version.store(version, Ordering::SeqCst);

        info!(
            "pid {} registered {} v{version}",
            dev.pid,
            inner.name.as_deref().unwrap_or("<noname>")
        );
        Ok(())
    }

    /// Deliver a reply to the transaction that is waiting for it.
    fn operation_reply(&self, msg: Msg) -> Result<()> {
        let dev = &self.dev;
        let mut inner = dev.inner.lock().unwrap();
        let Params::Ops(ops) = msg.params else {
            return Err(Error::InvalidArgument);
        };

        let Some(slot) = find_reply_file(&inner, &ops) else {
            debug!(
                "reply for transid {} names no live open file",
                ops.transid
            );
            return discard_reply(dev, &mut inner, &self.registry, &msg, &ops);
        };

        let file = Arc::clone(&inner.files[slot]);
        let mut table = file.trans.lock().unwrap();
        let Some(t) = table.find_mut(ops.transid) else {
            drop(table);
            debug!("no transaction with transid {}", ops.transid);
            return discard_reply(dev, &mut inner, &self.registry, &msg, &ops);
        };

        debug!(
            "device {} completed transid {} (retval {})",
            dev.id, ops.transid, ops.retval
        );
        t.reply = Some(ReplyMsg {
            cmd: msg.cmd,
            subcmd: msg.subcmd,
            ops,
            payload: msg.payload,
        });
        file.reply_cv.notify_all();
        Ok(())
    }

    /// Deliver a readiness-diff answer: update the cache, force the next
    /// poll to dispatch a fresh diff, and wake sleepers.
    fn readiness_reply(&self, msg: &Msg) -> Result<()> {
        let dev = &self.dev;
        let inner = dev.inner.lock().unwrap();
        let Params::Ops(ops) = &msg.params else {
            return Err(Error::InvalidArgument);
        };

        let Some(slot) = find_reply_file(&inner, ops) else {
            return Err(Error::ConnectionLost);
        };
        let file = &inner.files[slot];

        let mut state = file.state.lock().unwrap();
        // Any negative answer disables further diffing.
        state.cached_poll = if ops.retval < 0 { -1 } else { ops.retval as i32 };
        state.last_poll_sent = -1;
        debug!(
            "device {} readiness now {}",
            dev.id, state.cached_poll
        );
        file.poll_cv.notify_all();
        Ok(())
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        let dev = &self.dev;
        info!("pid {} closing its control channel", dev.pid);

        let mut inner = dev.inner.lock().unwrap();
        if let Some(name) = inner.name.clone() {
            // Unpublish first so new opens fail with not-found even while
            // open files keep the zombie alive.
            self.registry.remove_name(&name);
        }
        device::zombify(dev, &mut inner);
        device::maybe_free(dev, &mut inner, &self.registry);
        drop(inner);

        self.registry.bump_version();
    }
}

/// Find the open-file slot a reply is addressed to: try the hint index
/// first, then scan for the file identifier.
fn find_reply_file(inner: &DeviceInner, ops: &OpsParams) -> Option<usize> {
    let hint = ops.hint as usize;
    if inner
        .files
        .get(hint)
        .is_some_and(|f| f.file_id == ops.file_id)
    {
        return Some(hint);
    }
    inner.files.iter().position(|f| f.file_id == ops.file_id)
}

/// A reply nobody is waiting for. A successful OPEN still obligates the
/// provider to a close; everything else is an error back to the writer.
fn discard_reply(
    dev: &Arc<Device>,
    inner: &mut DeviceInner,
    registry: &Registry,
    msg: &Msg,
    ops: &OpsParams,
) -> Result<()> {
    if msg.subcmd == Subcommand::Open && ops.retval == 0 {
        device::forge_close(dev, inner, registry, ops);
        Ok(())
    } else {
        Err(Error::ConnectionLost)
    }
}
