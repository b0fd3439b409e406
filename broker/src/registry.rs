//! Process-wide device registry.
//!
//! Holds every device record a control channel has created, the name table
//! that plays the role of the device namespace, and the counters shared by
//! the whole broker: the registration version, transaction ids, device ids
//! and open-file ids. Status readers sleep on the registry condvar and are
//! woken whenever the version moves.
//!
//! Locking: the registry mutex is taken either alone or while already
//! holding a device mutex (the free paths). No path may acquire a device
//! mutex while holding the registry mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::debug;

use crate::device::Device;
use crate::error::{Error, Result};

pub(crate) struct RegistryInner {
    pub devices: Vec<Arc<Device>>,
    /// Visible name -> device id, live registrations only.
    pub names: HashMap<String, u64>,
}

pub(crate) struct Registry {
    pub inner: Mutex<RegistryInner>,
    /// Paired with `inner`; notified on every version bump.
    pub status_cv: Condvar,
    last_version: AtomicU64,
    last_transid: AtomicI64,
    next_device_id: AtomicU64,
    next_file_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(RegistryInner {
                devices: Vec::new(),
                names: HashMap::new(),
            }),
            status_cv: Condvar::new(),
            last_version: AtomicU64::new(1),
            last_transid: AtomicI64::new(0),
            next_device_id: AtomicU64::new(0),
            next_file_id: AtomicU64::new(0),
        }
    }

    pub fn alloc_transid(&self) -> i64 {
        self.last_transid.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn alloc_device_id(&self) -> u64 {
        self.next_device_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn alloc_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn version(&self) -> u64 {
        self.last_version.load(Ordering::SeqCst)
    }

    /// Bump the version and wake status readers. The caller already holds
    /// the registry mutex, which is what makes the wakeup reliable.
    pub fn bump_version_locked(&self, _inner: &MutexGuard<'_, RegistryInner>) -> u64 {
        let v = self.last_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.status_cv.notify_all();
        v
    }

    pub fn bump_version(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        self.bump_version_locked(&inner)
    }

    /// Track a freshly created device record (control-channel open).
    pub fn add_device(&self, dev: Arc<Device>) {
        self.inner.lock().unwrap().devices.push(dev);
    }

    /// Resolve a visible name to a device id.
    pub fn lookup_name(&self, name: &str) -> Option<u64> {
        self.inner.lock().unwrap().names.get(name).copied()
    }

    /// Find a live, registered device by id and pin it against freeing by
    /// bumping its open-in-progress count. The caller must unpin once the
    /// open file is in the array (or the open has failed).
    pub fn lookup_and_pin(&self, id: u64) -> Option<Arc<Device>> {
        let inner = self.inner.lock().unwrap();
        let dev = inner.devices.iter().find(|d| d.id == id)?;
        if dev.is_zombie() || dev.version.load(Ordering::SeqCst) == 0 {
            return None;
        }
        dev.open_in_progress.fetch_add(1, Ordering::SeqCst);
        Some(Arc::clone(dev))
    }

    /// Drop an open-in-progress pin. Serialized by the registry mutex so it
    /// cannot race the free check.
    pub fn unpin(&self, dev: &Device) {
        let _inner = self.inner.lock().unwrap();
        dev.open_in_progress.fetch_sub(1, Ordering::SeqCst);
    }

    /// Publish `name` for `dev`, failing on a collision with any live
    /// registration. Called with the device mutex held. Returns the new
    /// registration version.
    pub fn publish(&self, dev: &Device, name: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.names.contains_key(name) {
            debug!("name {name} already registered");
            return Err(Error::AlreadyExists);
        }
        inner.names.insert(name.to_owned(), dev.id);
        Ok(self.bump_version_locked(&inner))
    }

    /// Remove a name from the namespace; new opens fail with not-found from
    /// this point on, even while the zombie device lingers.
    pub fn remove_name(&self, name: &str) {
        self.inner.lock().unwrap().names.remove(name);
    }

    /// Devices currently on the registry, for status snapshots. The clone
    /// lets the caller read per-device state without holding the registry
    /// mutex.
    pub fn snapshot_devices(&self) -> Vec<Arc<Device>> {
        self.inner.lock().unwrap().devices.clone()
    }

    /// Block until the version moves past `seen`.
    pub fn wait_version_past(&self, seen: u64) {
        let mut inner = self.inner.lock().unwrap();
        while self.version() <= seen {
            inner = self.status_cv.wait(inner).unwrap();
        }
    }
}
