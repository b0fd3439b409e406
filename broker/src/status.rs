//! Read-only status channel.
//!
//! Each open handle streams a snapshot of the registry, either as a small
//! human-readable table or as fixed binary records (selected with
//! [`STATUS_USE_BINARY`]). A snapshot is built lazily on the first read,
//! streamed across as many reads as the caller needs, and regenerated on the
//! read after end-of-stream. The channel is pollable: it turns readable
//! whenever the registry version moves past the version the snapshot was
//! built from.

use std::sync::{Arc, Mutex};

use log::debug;
use userdev_proto::constants::STATUS_USE_BINARY;
use userdev_proto::msg::pack_name;
use userdev_proto::{Readiness, StatusRecord};

use crate::error::{Error, Result};
use crate::registry::Registry;

pub struct StatusChannel {
    registry: Arc<Registry>,
    state: Mutex<StatusState>,
}

struct StatusState {
    binary: bool,
    need_new: bool,
    buf: Vec<u8>,
    last_version_seen: u64,
}

impl StatusChannel {
    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        StatusChannel {
            registry,
            state: Mutex::new(StatusState {
                binary: false,
                need_new: true,
                buf: Vec::new(),
                last_version_seen: 0,
            }),
        }
    }

    /// Control command on the open handle. Only mode selection is known.
    pub fn control(&self, cmd: u32) -> Result<()> {
        if cmd == STATUS_USE_BINARY {
            self.state.lock().unwrap().binary = true;
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Stream the current snapshot. Returns 0 at end-of-stream; the next
    /// read builds a fresh snapshot.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();

        if state.need_new {
            let version = self.registry.version();
            state.buf = if state.binary {
                self.build_binary()
            } else {
                self.build_text()
            };
            state.last_version_seen = version;
            state.need_new = false;
        }

        if state.buf.is_empty() {
            state.need_new = true;
            return Ok(0);
        }

        let n = buf.len().min(state.buf.len());
        buf[..n].copy_from_slice(&state.buf[..n]);
        state.buf.drain(..n);
        Ok(n)
    }

    /// Readable once the registry has changed since the last snapshot.
    pub fn poll(&self) -> Readiness {
        let state = self.state.lock().unwrap();
        if state.last_version_seen < self.registry.version() {
            Readiness::READABLE
        } else {
            Readiness::empty()
        }
    }

    /// Block until this handle would poll readable.
    pub fn wait_readable(&self) {
        let seen = self.state.lock().unwrap().last_version_seen;
        self.registry.wait_version_past(seen);
    }

    fn build_text(&self) -> Vec<u8> {
        use std::fmt::Write;

        let mut out = String::with_capacity(512);
        out.push_str("  PID  Open Name\n------ ---- -----------------\n");

        let mut devices = 0usize;
        let mut clients = 0usize;
        for dev in self.registry.snapshot_devices() {
            let inner = dev.inner.lock().unwrap();
            let open = inner.files.len();
            let _ = writeln!(
                out,
                "{:6} {:4} {}{}",
                dev.pid,
                open,
                if dev.is_zombie() { "<zombie>" } else { "" },
                inner.name.as_deref().unwrap_or("<noname>")
            );
            devices += 1;
            clients += open;
        }
        let _ = writeln!(
            out,
            "\nuserdev - {devices} devices used by {clients} clients"
        );
        debug!("built text status snapshot, {} bytes", out.len());
        out.into_bytes()
    }

    fn build_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for dev in self.registry.snapshot_devices() {
            let inner = dev.inner.lock().unwrap();
            let mut record = StatusRecord {
                name: [0u8; 48],
                zombie: dev.is_zombie() as u32,
                pid: dev.pid,
                num_open: inner.files.len() as u32,
                reserved: 0,
            };
            if let Some(name) = &inner.name {
                // Names were validated at registration; packing can only
                // fail for the placeholder case handled below.
                let _ = pack_name(&mut record.name, name);
            }
            out.extend_from_slice(bytemuck::bytes_of(&record));
        }
        debug!("built binary status snapshot, {} bytes", out.len());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn registry_with(names: &[(&str, u32, bool)]) -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        for (name, pid, zombie) in names {
            let dev = Arc::new(Device::new(registry.alloc_device_id(), *pid));
            registry.add_device(Arc::clone(&dev));
            let version = registry.publish(&dev, name).unwrap();
            dev.version.store(version, AtomicOrdering::SeqCst);
            dev.inner.lock().unwrap().name = Some((*name).to_owned());
            if *zombie {
                dev.zombie.store(true, AtomicOrdering::SeqCst);
            }
        }
        registry
    }

    fn read_all(status: &StatusChannel) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 32];
        loop {
            let n = status.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    #[test]
    fn text_snapshot_lists_devices_and_totals() {
        let registry = registry_with(&[("echo", 41, false), ("pager", 42, true)]);
        let status = StatusChannel::new(registry);

        let text = String::from_utf8(read_all(&status)).unwrap();
        assert!(text.starts_with("  PID  Open Name\n"));
        assert!(text.contains("echo"));
        assert!(text.contains("<zombie>pager"));
        assert!(text.contains("2 devices used by 0 clients"));
    }

    #[test]
    fn binary_snapshot_has_fixed_records() {
        let registry = registry_with(&[("echo", 41, false)]);
        let status = StatusChannel::new(registry);
        status.control(STATUS_USE_BINARY).unwrap();

        let bytes = read_all(&status);
        assert_eq!(bytes.len(), userdev_proto::STATUS_RECORD_SIZE);
        let record: StatusRecord = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(record.pid, 41);
        assert_eq!(record.zombie, 0);
        assert_eq!(
            userdev_proto::msg::unpack_name(&record.name).unwrap(),
            "echo"
        );
    }

    #[test]
    fn unknown_control_commands_are_rejected() {
        let registry = registry_with(&[]);
        let status = StatusChannel::new(registry);
        assert_eq!(status.control(0xdead_beef), Err(Error::InvalidArgument));
    }

    #[test]
    fn snapshot_regenerates_after_exhaustion() {
        let registry = registry_with(&[("echo", 41, false)]);
        let status = StatusChannel::new(Arc::clone(&registry));

        let first = read_all(&status);
        assert!(status.poll().is_empty());

        registry.bump_version();
        assert_eq!(status.poll(), Readiness::READABLE);

        let second = read_all(&status);
        assert_eq!(first, second);
    }
}
