use std::io;
use std::path::PathBuf;

/// Errors thrown by the [`ConnectionRegistry`](super::ConnectionRegistry)
/// and the [`KmsFlipper`](super::KmsFlipper).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Unable to acquire DRM master
    #[error("Failed to acquire DRM master")]
    DrmMasterFailed(#[source] io::Error),
    /// Unable to open the drm node
    #[error("Unable to open drm node `{path:?}`")]
    UnableToOpenNode {
        /// Path of the node
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The kernel driver is not handled by any SoC backend
    #[error("No SoC backend handles the kernel driver `{0}`")]
    UnsupportedDriver(String),
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Raw drm ioctl failure
#[derive(thiserror::Error, Debug)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}
