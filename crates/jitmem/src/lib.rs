//! # jitmem: just-in-time heterogeneous memory allocator
//!
//! This crate manages the lifecycle of data buffers shared between host
//! memory and one or more accelerator devices. It decides where a logical
//! buffer's bytes currently live, moves them between host and device on
//! demand, and reclaims memory that is no longer referenced or no longer hot,
//! while multiple compute threads read and write the same buffers
//! concurrently.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    compute threads                           │
//! └──────────┬──────────────────────────────────────────────────┘
//!            │ allocate / resolve_pointer / mark_read / release
//!            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Allocator (façade)                       │
//! │  ┌──────────────┐  ┌─────────────┐  ┌────────────────────┐  │
//! │  │ TrackingTable│  │ AccessRings │  │  PlacementPolicy   │  │
//! │  └──────┬───────┘  └─────────────┘  └────────────────────┘  │
//! │  ┌──────┴───────────────┐  ┌─────────────────────────────┐  │
//! │  │ MemoryHandler        │  │ Reclamation workers         │  │
//! │  │ (transfer engine)    │  │ (per host bucket, per device)│ │
//! │  └──────┬───────────────┘  └─────────────────────────────┘  │
//! └─────────┼───────────────────────────────────────────────────┘
//!           ▼
//!      jitmem-transport (host/device regions and copies)
//! ```
//!
//! ## Tick/Tack/Toe
//!
//! The common path - compute access to already-resident data - never takes a
//! lock. Each tracked buffer carries a three-state access signal:
//!
//! - **Tick**: a compute session has begun using the buffer at its current
//!   location. Many concurrent ticks are allowed.
//! - **Tack**: a tick session ended.
//! - **Toe**: a short exclusive window used only for synchronization,
//!   relocation between memory classes, and deallocation. While a Toe is
//!   held no new tick may begin, and the holder waits for outstanding ticks
//!   to drain before touching placement.
//!
//! ## Reclamation
//!
//! Background workers - one per host bucket, one per device - periodically
//! scan the tracking table. Entries whose owning handle has been dropped are
//! freed; device-resident entries that have gone cold are evicted back to
//! host to relieve device pressure. How readily memory is reclaimed is
//! governed by an ordered [`Aggressiveness`] level that the workers raise on
//! their own when object counts or byte usage approach the configured caps.
//!
//! ## Example
//!
//! ```
//! use jitmem::{Allocator, AllocatorConfig, MemoryClass};
//!
//! let allocator = Allocator::new(AllocatorConfig::default()).unwrap();
//! let handle = allocator.allocate(1024, true).unwrap();
//!
//! // Resolve a host pointer; the allocator transfers first if needed.
//! let ptr = allocator.resolve_pointer(&handle, MemoryClass::Host).unwrap();
//! assert!(!ptr.is_null());
//!
//! allocator.release(&handle).unwrap();
//! ```

#![warn(missing_docs)]

pub mod allocator;
pub mod config;
pub mod error;
pub mod handler;
pub mod point;
pub mod policy;
mod reclaim;
pub mod ring;
pub mod stats;
pub mod table;

pub use allocator::{Allocator, BufferHandle};
pub use config::{Aggressiveness, AllocatorConfig, MemoryModel};
pub use error::{Error, Result};
pub use handler::{MemoryHandler, TransportHandler};
pub use point::{
    AccessSession, AccessState, AllocationPoint, AllocationStatus, BufferId, MemoryClass, ToeGuard,
};
pub use ring::AccessRing;
pub use stats::{AllocatorStats, ScanStats};
