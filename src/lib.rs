//! Capture core for a Linux userspace sampling profiler.
//!
//! This crate contains the machinery that sits between the kernel's
//! `perf_event_open` ring buffers and a profiling client:
//!
//! - [`linux::RingBufferReader`] reads raw records out of the kernel-shared
//!   mmap region of one perf event fd, without allocating on the hot path.
//! - [`records`] turns those raw records into typed events.
//! - [`merger::Merger`] re-orders events from many per-CPU ring buffers into
//!   a single non-decreasing timestamp stream, using a holdback window to
//!   absorb bounded producer skew.
//! - [`unwinding`] reconstructs call stacks from sampled registers and
//!   copied stack bytes, and repairs stacks that were broken by uretprobe
//!   return-address hijacking.
//! - [`producer::ProducerEventProcessor`] merges event streams from several
//!   independent producers into one globally interned client event stream.
//! - [`capture`] ties all of the above together for the lifetime of one
//!   capture.
//!
//! Everything in this crate is per-capture state; nothing survives from one
//! capture to the next.

pub use capture::{Capture, CaptureHandle};
pub use config::CaptureOptions;
pub use error::CaptureError;

pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod linux;
pub mod merger;
pub mod producer;
pub mod records;
pub mod unwinding;
