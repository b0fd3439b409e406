//! Broker core for user-space character-device providers.
//!
//! Unprivileged provider processes implement pseudo-devices; this crate is
//! the dispatcher that sits between them and their clients. A provider opens
//! a [`ControlChannel`], registers a device name on it, and then services
//! requests: every client open, read, write, ioctl, poll and mmap against
//! that name becomes a request/reply transaction on the channel, and the
//! reply becomes the client call's result. The broker never interprets
//! payload bytes.
//!
//! The embedding host plays the role of the surrounding VFS: it resolves
//! names with [`Broker::lookup`], calls [`Broker::open`], and drives the
//! returned [`OpenHandle`]. Blocked calls are interrupted through
//! [`Interrupt`] tokens, which reproduce restartable-syscall semantics: the
//! interrupted call returns `RestartNeeded` and an identical retry picks up
//! the same in-flight transaction.
//!
//! Locking, from outermost to innermost on any path that nests: the per-file
//! op mutex, the device mutex, the registry mutex. The open-file state mutex
//! and the transaction-table mutex are leaves and are never held while
//! acquiring one of the others; reply delivery only ever needs the leaves,
//! which is what keeps providers and clients from convoying. No lock is held
//! while blocking for a provider reply.
//!
//! There is no configuration. Verbosity is whatever the host sets on the
//! `log` facade; registrations are process-local and vanish with the broker.

mod client;
mod device;
mod error;
mod openfile;
mod provider;
mod queue;
mod region;
mod registry;
mod status;
mod transaction;

use std::sync::Arc;

use log::info;

use crate::device::Device;
use crate::registry::Registry;

pub use client::{ClientCred, Interrupt, IoctlArg, OpenHandle};
pub use error::{Error, Result};
pub use provider::ControlChannel;
pub use region::{MappedRegion, SharedRegion};
pub use status::StatusChannel;
pub use userdev_proto as proto;

/// Identifier a registered device is reachable under, the analog of a
/// device number in the host namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u64);

/// The broker instance: the device registry plus the counters every channel
/// and open file shares.
pub struct Broker {
    registry: Arc<Registry>,
}

impl Broker {
    pub fn new() -> Self {
        Broker {
            registry: Arc::new(Registry::new()),
        }
    }

    /// Open a provider control channel. The channel owns a fresh, unnamed
    /// device record; a REGISTER write promotes and publishes it.
    pub fn open_control(&self, provider: ClientCred) -> ControlChannel {
        let dev = Arc::new(Device::new(self.registry.alloc_device_id(), provider.pid));
        self.registry.add_device(Arc::clone(&dev));
        info!("pid {} opened the control channel", provider.pid);
        ControlChannel::new(dev, Arc::clone(&self.registry))
    }

    /// Open the read-only status channel.
    pub fn open_status(&self) -> StatusChannel {
        StatusChannel::new(Arc::clone(&self.registry))
    }

    /// Resolve a visible device name, as the host namespace would.
    pub fn lookup(&self, name: &str) -> Result<DeviceId> {
        self.registry
            .lookup_name(name)
            .map(DeviceId)
            .ok_or(Error::NotFound)
    }

    /// Open a device on behalf of a client. Blocks until the provider
    /// answers the OPEN request.
    pub fn open(
        &self,
        id: DeviceId,
        cred: &ClientCred,
        flags: u64,
        intr: &Interrupt,
    ) -> Result<OpenHandle> {
        client::open_device(&self.registry, id, cred, flags, intr)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
