//! Packet-in/packet-out pipelines over AF_XDP.
//!
//! [`XskQueue`] opens one `(interface, queue)` endpoint and runs its
//! fill/completion/rx/tx cycle on background worker threads, exchanging
//! owned [`Packet`]s with the application through bounded channels. The
//! descriptor-level machinery lives in the `xsk-socket` crate.

pub mod packet;
pub mod pool;
pub mod queue;

pub use packet::{
    FramePacket, Packet, PacketError, FRAME_HEADROOM, FRAME_TAILROOM, MAX_PACKET_DATA_SIZE,
    PACKET_RAW_SIZE,
};
pub use pool::PacketPool;
pub use queue::{QueueConfig, QueueError, XskQueue};

pub use xsk_socket::{Endpoint, EndpointConfig, XskError, INHIBIT_PROG_LOAD};
