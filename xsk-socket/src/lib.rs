//! Kernel-bypass packet I/O over AF_XDP.
//!
//! The crate is organized leaves-first: lock-free ring primitives, umem
//! registration, shared-umem sockets with per-queue contexts, the default
//! redirect program with its cross-process refcounting, and an
//! [`Endpoint`] facade bundling one umem and one socket behind
//! descriptor-level send/receive operations.

pub mod endpoint;
pub mod error;
pub mod lock;
pub mod mmap;
pub mod prog;
pub mod ring;
pub mod socket;
pub mod tools;
pub mod umem;

pub use endpoint::{frame_descs, Endpoint, EndpointConfig};
pub use error::XskError;
pub use mmap::OwnedMmap;
pub use prog::setup_xdp_prog;
pub use ring::{RingCons, RingProd, RingType, XdpDesc};
pub use socket::{Socket, SocketConfig, SocketRings, INHIBIT_PROG_LOAD};
pub use tools::{eth_channels, hex_dump, page_aligned, EthChannels};
pub use umem::{Umem, UmemConfig};
