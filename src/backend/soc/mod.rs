//! Per SoC family parameters
//!
//! Display controllers found on ARM SoCs differ in how scanout capable memory has to be
//! requested, whether their kernel driver reports page-flip completion and what kind of
//! hardware cursor they offer. [`SocBackend`] collects these differences. It is selected
//! once per device by the name of the bound kernel driver.

use std::io;

use tracing::{debug, info};

use crate::backend::allocator::{format::aligned_pitch, BufferKind};
use crate::backend::drm::{Error, GemAllocation, KmsDevice};
use crate::config::Options;

mod cursor;
pub use self::cursor::{convert_cursor, CursorApi, CursorFormat, CursorInfo};

/// Physically contiguous allocation, `EXYNOS_BO_CONTIG`
pub const EXYNOS_BO_CONTIG: u32 = 0;
/// Scattered allocation behind the IOMMU, `EXYNOS_BO_NONCONTIG`
pub const EXYNOS_BO_NONCONTIG: u32 = 1 << 0;
/// Write-combined CPU mapping, `EXYNOS_BO_WC`
pub const EXYNOS_BO_WC: u32 = 1 << 2;

/// Scanout dumb buffer flag understood by the vendor pl111 kernel driver
pub const PL111_BO_SCANOUT: u32 = 1 << 0;

/// How GEM objects are created on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemCreate {
    /// Dumb buffers, with driver specific flags per kind
    Dumb {
        /// Flags for scanout buffers
        scanout: u32,
        /// Flags for all other buffers
        non_scanout: u32,
    },
    /// The Exynos `GEM_CREATE` ioctl
    Exynos,
}

/// Static description of a SoC backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocInfo {
    /// Kernel driver name this backend is selected for
    pub driver: &'static str,
    /// Whether the driver sends events for completed page flips
    pub page_flip_events: bool,
    /// Whether the driver answers vblank queries
    pub vblank_query: bool,
    /// Hardware cursor, if any
    pub cursor: CursorInfo,
    /// GEM creation strategy
    pub gem: GemCreate,
}

/// The SoC families handled by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocBackend {
    /// Samsung Exynos
    Exynos,
    /// ARM PrimeCell PL111
    Pl111,
    /// STMicroelectronics STi
    Sti,
    /// HiSilicon Kirin
    Kirin,
    /// Rockchip VOP
    Rockchip,
    /// Allwinner display engine
    Sun4i,
    /// Amlogic Meson
    Meson,
}

const EXYNOS: SocInfo = SocInfo {
    driver: "exynos",
    page_flip_events: true,
    vblank_query: false,
    cursor: CursorInfo {
        width: 64,
        height: 64,
        api: CursorApi::Standard,
        format: CursorFormat::Argb8888,
    },
    gem: GemCreate::Exynos,
};

const PL111: SocInfo = SocInfo {
    driver: "pl111",
    page_flip_events: true,
    vblank_query: false,
    cursor: CursorInfo {
        width: 64,
        height: 64,
        api: CursorApi::Plane,
        format: CursorFormat::Lbbp,
    },
    gem: GemCreate::Dumb {
        scanout: PL111_BO_SCANOUT,
        non_scanout: 0,
    },
};

const fn generic(driver: &'static str, vblank_query: bool, api: CursorApi) -> SocInfo {
    SocInfo {
        driver,
        page_flip_events: true,
        vblank_query,
        cursor: CursorInfo {
            width: 64,
            height: 64,
            api,
            format: CursorFormat::Argb8888,
        },
        gem: GemCreate::Dumb {
            scanout: 0,
            non_scanout: 0,
        },
    }
}

const STI: SocInfo = generic("sti", false, CursorApi::Plane);
const KIRIN: SocInfo = generic("kirin", false, CursorApi::None);
const ROCKCHIP: SocInfo = generic("rockchip", true, CursorApi::Standard);
const SUN4I: SocInfo = generic("sun4i-drm", true, CursorApi::None);
const MESON: SocInfo = generic("meson", true, CursorApi::Standard);

impl SocBackend {
    /// Every known backend, in lookup order
    pub const ALL: [SocBackend; 7] = [
        SocBackend::Exynos,
        SocBackend::Pl111,
        SocBackend::Sti,
        SocBackend::Kirin,
        SocBackend::Rockchip,
        SocBackend::Sun4i,
        SocBackend::Meson,
    ];

    /// Backend for the kernel driver called `driver`
    pub fn from_driver(driver: &str) -> Option<SocBackend> {
        SocBackend::ALL.into_iter().find(|backend| backend.info().driver == driver)
    }

    /// Pick the backend for `kms`, honoring a forced driver name from `options`
    pub fn select(kms: &dyn KmsDevice, options: &Options) -> Result<SocBackend, Error> {
        let driver = match options.driver.as_deref() {
            Some(forced) => {
                info!(driver = forced, "Using forced SoC backend");
                forced.to_string()
            }
            None => kms.driver_name().map_err(|source| crate::backend::drm::AccessError {
                errmsg: "Failed to query the kernel driver",
                dev: kms.device_path(),
                source,
            })?,
        };
        let backend = SocBackend::from_driver(&driver).ok_or(Error::UnsupportedDriver(driver))?;
        debug!(?backend, "Selected SoC backend");
        Ok(backend)
    }

    /// Static parameters of this backend
    pub const fn info(&self) -> &'static SocInfo {
        match self {
            SocBackend::Exynos => &EXYNOS,
            SocBackend::Pl111 => &PL111,
            SocBackend::Sti => &STI,
            SocBackend::Kirin => &KIRIN,
            SocBackend::Rockchip => &ROCKCHIP,
            SocBackend::Sun4i => &SUN4I,
            SocBackend::Meson => &MESON,
        }
    }

    /// Create a GEM object of `kind` the way this SoC expects it
    pub fn create_gem(
        &self,
        kms: &dyn KmsDevice,
        width: u32,
        height: u32,
        bpp: u32,
        kind: BufferKind,
    ) -> io::Result<GemAllocation> {
        match self.info().gem {
            GemCreate::Dumb { scanout, non_scanout } => {
                let flags = match kind {
                    BufferKind::Scanout => scanout,
                    BufferKind::NonScanout => non_scanout,
                };
                kms.create_dumb(width, height, bpp, flags)
            }
            GemCreate::Exynos => {
                let flags = match kind {
                    BufferKind::Scanout => EXYNOS_BO_CONTIG | EXYNOS_BO_WC,
                    BufferKind::NonScanout => EXYNOS_BO_NONCONTIG | EXYNOS_BO_WC,
                };
                let pitch = aligned_pitch(width, bpp)
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
                let size = pitch as u64 * height as u64;
                let handle = kms.create_exynos_gem(size, flags)?;
                Ok(GemAllocation { handle, pitch, size })
            }
        }
    }
}
