//! capmux: process-wide Linux capability management
//!
//! Linux keeps capability state (permitted, effective, inheritable, bounding,
//! ambient) per OS thread. A program whose logical work migrates across
//! threads can therefore observe or apply capability changes inconsistently.
//! capmux closes that gap: reads stay cheap and thread-local, while every
//! mutation is broadcast to all OS threads of the process under a gate that
//! also serializes thread births going through [`broadcast::spawn`].
//!
//! # Architecture
//!
//! Leaf-first:
//!
//! - [`bits`]: `Capability` constant table and the `BitSet` value type
//! - [`set`]: `CapabilitySet` snapshots with kernel-invariant checking
//! - [`kernel`]: raw capget/capset/prctl surface, runtime capability ceiling
//! - [`broadcast`]: the syscall broadcaster (broadcast vs single-thread mode)
//! - [`proc`]: `current` / `apply` / `with_temporary_elevation` façade
//!
//! # Consistency model
//!
//! A committed snapshot is visible identically on every OS thread, including
//! threads spawned after the commit. Concurrent commits are fully serialized
//! in gate-acquisition order; there is no merging of concurrent mutations.
//! A snapshot is a detached value: mutating it never affects kernel state
//! until it is passed to [`proc::apply`].
//!
//! # Example
//!
//! ```no_run
//! use capmux::{proc, Capability, Flag};
//!
//! let caps = proc::current()?;
//! if caps.get_flag(Flag::Permitted, Capability::NetBindService) {
//!     proc::with_temporary_elevation(Flag::Effective, Capability::NetBindService, || {
//!         std::net::TcpListener::bind("0.0.0.0:80")
//!     })??;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bits;
pub mod broadcast;
pub mod cli;
pub mod errors;
pub mod kernel;
pub mod proc;
pub mod set;

pub use bits::{BitSet, Capability};
pub use broadcast::Mode;
pub use errors::{BroadcastReport, CapError, Result, ThreadOutcome};
pub use set::{CapabilitySet, Flag};
