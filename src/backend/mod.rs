//! Kernel-facing building blocks
//!
//! Collection of the types that talk to the DRM/KMS subsystem of the kernel:
//!
//! - [`drm`] wraps the open device node, the ioctl surface used by this crate,
//!   page-flip submission and the process wide connection registry.
//! - [`soc`] describes the per-SoC differences (allocation flags, cursor formats,
//!   page-flip event support) and selects the matching backend by driver name.
//! - [`allocator`] provides the reference-counted [`BufferObject`](allocator::BufferObject)
//!   and the [`Device`](allocator::Device) handle it is allocated from.

pub mod allocator;
pub mod drm;
pub mod soc;
