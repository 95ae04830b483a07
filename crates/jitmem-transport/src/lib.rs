//! # jitmem-transport: host/device memory transport primitives
//!
//! This crate is the low-level layer underneath the jitmem allocator. It owns
//! raw byte regions in host and device address spaces and moves bytes between
//! them:
//!
//! - **Regions**: owned, stably-addressed byte buffers ([`HostRegion`],
//!   [`DeviceRegion`]) with RAII release and byte accounting
//! - **Transport**: the [`MemoryTransport`] trait - allocation plus blocking
//!   and asynchronous copies between host and device spaces
//! - **Events**: [`TransferEvent`] completion tokens for asynchronous copies
//! - **Mirror backend**: [`MirrorTransport`], a CPU reference implementation
//!   that simulates any number of devices in host RAM
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  jitmem (allocator)                   │
//! └───────────────┬──────────────────────────────────────┘
//!                 │  MemoryTransport trait
//!                 ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                 jitmem-transport                      │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────┐  │
//! │  │ HostRegion │  │ DeviceRegion │  │ TransferEvent│  │
//! │  └────────────┘  └──────────────┘  └──────────────┘  │
//! └───────────────┬──────────────────────────────────────┘
//!                 ▼
//!      host RAM  /  device memory (mirrored for CPU backend)
//! ```
//!
//! The transport treats host and device as distinct address spaces even when
//! the backing implementation keeps both in host RAM: device bytes are only
//! observable through explicit copy operations, which keeps the allocator's
//! residency logic honest.
//!
//! # Example
//!
//! ```
//! use jitmem_transport::{MemoryTransport, MirrorTransport};
//!
//! let transport = MirrorTransport::new(1);
//! let host = transport.alloc_host(64).unwrap();
//! let mut dev = transport.alloc_device(0, 64).unwrap();
//!
//! transport.copy_h2d(&host, 0, &mut dev, 0, 64).unwrap();
//! assert_eq!(transport.device_bytes_in_use(0), 64);
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod event;
pub mod mirror;
pub mod region;
pub mod transport;

pub use error::{Result, TransportError};
pub use event::TransferEvent;
pub use mirror::MirrorTransport;
pub use region::{DeviceRegion, HostRegion};
pub use transport::{DeviceInfo, MemoryTransport, TransportKind};
