#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRI2
#![allow(clippy::upper_case_acronyms)]

//! # armsoc: KMS buffer and page-flip management for ARM SoC displays
//!
//! This crate is the buffer-object and presentation core of a display-server driver for
//! ARM system-on-chip display controllers. It talks to the kernel through the DRM/KMS
//! "dumb buffer" interface and sits between a 2D acceleration layer (which draws into
//! off-screen surfaces with the CPU) and the double-buffering protocol layer (which asks
//! for back buffers and swaps them to the screen).
//!
//! ## Structure of the crate
//!
//! - [`backend`] contains everything that touches the kernel: the DRM device handle and
//!   its ioctl surface, the per-SoC allocation backends and the reference-counted
//!   [`BufferObject`](backend::allocator::BufferObject).
//! - [`pixmap`] binds off-screen surfaces of the acceleration layer to buffer objects
//!   (or plain host memory) and implements the CPU access hooks.
//! - [`dri2`] implements the double-buffering protocol callbacks, including the swap
//!   state machine that decides between page flip and blit and completes flips when the
//!   kernel reports them.
//! - [`config`] holds the runtime options.
//!
//! ## Event handling
//!
//! Everything runs on one thread. Page-flip completions arrive on the DRM file
//! descriptor; [`backend::drm::KmsEventSource`] can be inserted into a [`calloop`] event
//! loop to get notified when that descriptor becomes readable, after which
//! [`dri2::Dri2Screen::dispatch_events`] completes the pending swaps.
//!
//! ### Logging
//!
//! armsoc makes extensive use of [`tracing`] for its internal logging. Long-lived objects
//! carry their own span, so filtering on `armsoc_dri2` or `armsoc_device` isolates the
//! swap machinery or the buffer allocator respectively.

pub mod backend;
pub mod config;
pub mod dri2;
pub mod pixmap;
pub mod utils;
