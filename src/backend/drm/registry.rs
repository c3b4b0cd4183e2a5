//! Process wide sharing of DRM connections
//!
//! Multiple screens driven by the same display controller share one open device node.
//! The [`ConnectionRegistry`] hands out ref-counted [`Connection`]s per node path and
//! keeps the DRM master state ref-counted as well: the kernel is only asked to grant
//! master when the first screen needs it and to drop it when the last one is done.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rustix::fs::{Mode, OFlags};
use tracing::{debug, info, info_span, warn};

use super::{error::Error, DrmDeviceFd, KmsDevice};
use crate::utils::DeviceFd;

#[derive(Debug)]
struct ConnectionEntry {
    kms: Arc<dyn KmsDevice>,
    open_count: usize,
    master_count: usize,
}

#[derive(Debug)]
struct RegistryInner {
    connections: Mutex<HashMap<PathBuf, ConnectionEntry>>,
    span: tracing::Span,
}

/// Registry of open DRM connections, injected into every screen at construction
#[derive(Debug, Clone)]
pub struct ConnectionRegistry(Arc<RegistryInner>);

impl Default for ConnectionRegistry {
    fn default() -> Self {
        ConnectionRegistry::new()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry(Arc::new(RegistryInner {
            connections: Mutex::new(HashMap::new()),
            span: info_span!("armsoc_connections"),
        }))
    }

    /// Open the drm node at `path`, or share the connection if it is already open.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Connection, Error> {
        self.open_with(path, |path| {
            let flags = OFlags::RDWR | OFlags::CLOEXEC;
            let fd = rustix::fs::open(path, flags, Mode::empty()).map_err(|source| Error::UnableToOpenNode {
                path: path.to_path_buf(),
                source: source.into(),
            })?;
            Ok(Arc::new(DrmDeviceFd::new(DeviceFd::from(fd))) as Arc<dyn KmsDevice>)
        })
    }

    /// Like [`ConnectionRegistry::open`], but lets the caller provide the device.
    ///
    /// `opener` is only invoked if no connection for `path` exists yet.
    pub fn open_with<F>(&self, path: impl AsRef<Path>, opener: F) -> Result<Connection, Error>
    where
        F: FnOnce(&Path) -> Result<Arc<dyn KmsDevice>, Error>,
    {
        let _guard = self.0.span.enter();
        let path = path.as_ref();
        let mut connections = self.0.connections.lock().unwrap();

        let kms = match connections.get_mut(path) {
            Some(entry) => {
                entry.open_count += 1;
                debug!(?path, open_count = entry.open_count, "Sharing drm connection");
                entry.kms.clone()
            }
            None => {
                let kms = opener(path)?;
                info!(?path, "Opened drm connection");
                connections.insert(
                    path.to_path_buf(),
                    ConnectionEntry {
                        kms: kms.clone(),
                        open_count: 1,
                        master_count: 0,
                    },
                );
                kms
            }
        };

        Ok(Connection {
            path: path.to_path_buf(),
            kms,
            registry: self.clone(),
        })
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.0.connections.lock().unwrap().len()
    }

    /// Returns true if no connection is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close(&self, path: &Path) {
        let _guard = self.0.span.enter();
        let mut connections = self.0.connections.lock().unwrap();
        let entry = connections
            .get_mut(path)
            .expect("closing a drm connection that is not registered");
        entry.open_count -= 1;
        if entry.open_count == 0 {
            if entry.master_count > 0 {
                warn!(?path, "Closing drm connection while still holding master");
            }
            connections.remove(path);
            info!(?path, "Closed drm connection");
        }
    }

    fn acquire_master(&self, path: &Path) -> Result<(), Error> {
        let mut connections = self.0.connections.lock().unwrap();
        let entry = connections
            .get_mut(path)
            .expect("acquiring master on a drm connection that is not registered");
        if entry.master_count == 0 {
            entry.kms.acquire_master().map_err(Error::DrmMasterFailed)?;
        }
        entry.master_count += 1;
        Ok(())
    }

    fn drop_master(&self, path: &Path) -> Result<(), Error> {
        let mut connections = self.0.connections.lock().unwrap();
        let entry = connections
            .get_mut(path)
            .expect("dropping master on a drm connection that is not registered");
        if entry.master_count == 0 {
            // don't poison the registry, the connection still has to close
            drop(connections);
            panic!("dropping drm master that is not held");
        }
        if entry.master_count == 1 {
            entry.kms.release_master().map_err(Error::DrmMasterFailed)?;
        }
        entry.master_count -= 1;
        Ok(())
    }
}

/// Shared handle to an open drm node
///
/// Dropping the last `Connection` for a path closes the node.
pub struct Connection {
    path: PathBuf,
    kms: Arc<dyn KmsDevice>,
    registry: ConnectionRegistry,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .field("kms", &self.kms)
            .finish()
    }
}

impl Connection {
    /// The device behind this connection
    pub fn kms(&self) -> &Arc<dyn KmsDevice> {
        &self.kms
    }

    /// Path of the node
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take a reference on drm master, asking the kernel only for the first one.
    pub fn acquire_master(&self) -> Result<(), Error> {
        self.registry.acquire_master(&self.path)
    }

    /// Release a reference on drm master, dropping it in the kernel with the last one.
    ///
    /// Panics if this connection does not hold master.
    pub fn drop_master(&self) -> Result<(), Error> {
        self.registry.drop_master(&self.path)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.close(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ConnectionRegistry;
    use crate::backend::drm::{test::DummyKms, KmsDevice};

    #[test]
    fn connections_are_shared_per_path() {
        let registry = ConnectionRegistry::new();
        let dummy = Arc::new(DummyKms::new("pl111"));
        let mut opened = 0;

        let first = registry
            .open_with("/dev/dri/card0", |_| {
                opened += 1;
                Ok(dummy.clone() as Arc<dyn KmsDevice>)
            })
            .unwrap();
        let second = registry
            .open_with("/dev/dri/card0", |_| panic!("connection should be reused"))
            .unwrap();
        assert_eq!(opened, 1);
        assert_eq!(registry.len(), 1);

        drop(first);
        assert_eq!(registry.len(), 1);
        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn master_is_refcounted() {
        let registry = ConnectionRegistry::new();
        let dummy = Arc::new(DummyKms::new("pl111"));
        let a = registry
            .open_with("/dev/dri/card0", |_| Ok(dummy.clone() as Arc<dyn KmsDevice>))
            .unwrap();
        let b = registry
            .open_with("/dev/dri/card0", |_| unreachable!())
            .unwrap();

        a.acquire_master().unwrap();
        b.acquire_master().unwrap();
        assert_eq!(dummy.stats().master_acquired, 1);

        a.drop_master().unwrap();
        assert_eq!(dummy.stats().master_released, 0);
        b.drop_master().unwrap();
        assert_eq!(dummy.stats().master_released, 1);
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn dropping_unheld_master_panics() {
        let registry = ConnectionRegistry::new();
        let conn = registry
            .open_with("/dev/dri/card0", |_| {
                Ok(Arc::new(DummyKms::new("pl111")) as Arc<dyn KmsDevice>)
            })
            .unwrap();
        let _ = conn.drop_master();
    }
}
