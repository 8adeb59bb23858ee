//! Owned packet buffers exchanged with the pipeline workers.
//!
//! A packet is a fixed-capacity byte buffer with head/tail cursors
//! framing the valid payload. The headroom in front of the payload lets
//! handlers prepend headers in place without shifting the data.

use std::{error, fmt};

/// Largest payload a packet can carry.
pub const MAX_PACKET_DATA_SIZE: usize = 2048;
/// Bytes reserved in front of the payload.
pub const FRAME_HEADROOM: usize = 64;
/// Bytes reserved behind the payload.
pub const FRAME_TAILROOM: usize = 0;
/// Total capacity of a packet buffer.
pub const PACKET_RAW_SIZE: usize = FRAME_HEADROOM + MAX_PACKET_DATA_SIZE + FRAME_TAILROOM;

#[derive(Debug, PartialEq, Eq)]
pub enum PacketError {
    /// The payload does not fit the packet buffer.
    CapacityExceeded { len: usize },
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::CapacityExceeded { len } => {
                write!(f, "payload of {len} bytes exceeds {MAX_PACKET_DATA_SIZE}")
            }
        }
    }
}

impl error::Error for PacketError {}

/// A packet exchanged with the pipeline workers.
pub trait Packet: Send {
    /// The valid payload. Not to be modified through this view.
    fn data(&self) -> &[u8];
    /// Current payload length.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Copies `data` into the packet and updates the cursors.
    fn set_data(&mut self, data: &[u8]) -> Result<(), PacketError>;
}

/// The default [`Packet`] implementation: one frame-sized buffer plus
/// head/tail cursors.
pub struct FramePacket {
    raw: [u8; PACKET_RAW_SIZE],
    head: usize,
    tail: usize,
}

impl Default for FramePacket {
    fn default() -> Self {
        FramePacket {
            raw: [0; PACKET_RAW_SIZE],
            head: FRAME_HEADROOM,
            tail: FRAME_HEADROOM,
        }
    }
}

impl Packet for FramePacket {
    fn data(&self) -> &[u8] {
        &self.raw[self.head..self.tail]
    }

    fn len(&self) -> usize {
        self.tail - self.head
    }

    fn set_data(&mut self, data: &[u8]) -> Result<(), PacketError> {
        if data.len() > MAX_PACKET_DATA_SIZE {
            return Err(PacketError::CapacityExceeded { len: data.len() });
        }
        self.raw[FRAME_HEADROOM..FRAME_HEADROOM + data.len()].copy_from_slice(data);
        self.head = FRAME_HEADROOM;
        self.tail = FRAME_HEADROOM + data.len();
        Ok(())
    }
}

impl FramePacket {
    /// Runs `handler` with raw access to the buffer and both cursors,
    /// e.g. to prepend a header into the headroom.
    pub fn run_handler(
        &mut self,
        handler: impl FnOnce(&mut [u8; PACKET_RAW_SIZE], &mut usize, &mut usize),
    ) {
        handler(&mut self.raw, &mut self.head, &mut self.tail);
        // Keep the cursors inside the buffer.
        self.tail = self.tail.min(PACKET_RAW_SIZE);
        self.head = self.head.min(self.tail);
    }

    /// Resets the cursors to an empty payload.
    pub(crate) fn reset(&mut self) {
        self.head = FRAME_HEADROOM;
        self.tail = FRAME_HEADROOM;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_packet_is_empty() {
        let pkt = FramePacket::default();
        assert_eq!(pkt.len(), 0);
        assert!(pkt.data().is_empty());
    }

    #[test]
    fn set_data_roundtrip() {
        let mut pkt = FramePacket::default();
        pkt.set_data(b"ping").unwrap();
        assert_eq!(pkt.data(), b"ping");
        assert_eq!(pkt.len(), 4);

        pkt.set_data(&[0xab; MAX_PACKET_DATA_SIZE]).unwrap();
        assert_eq!(pkt.len(), MAX_PACKET_DATA_SIZE);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut pkt = FramePacket::default();
        let err = pkt.set_data(&[0u8; MAX_PACKET_DATA_SIZE + 1]).unwrap_err();
        assert_eq!(
            err,
            PacketError::CapacityExceeded {
                len: MAX_PACKET_DATA_SIZE + 1
            }
        );
    }

    #[test]
    fn run_handler_can_prepend_into_headroom() {
        let mut pkt = FramePacket::default();
        pkt.set_data(b"payload").unwrap();
        pkt.run_handler(|raw, head, _tail| {
            *head -= 2;
            raw[*head] = 0xaa;
            raw[*head + 1] = 0xbb;
        });
        assert_eq!(pkt.data(), &[0xaa, 0xbb, b'p', b'a', b'y', b'l', b'o', b'a', b'd']);
    }

    #[test]
    fn run_handler_cursors_stay_in_bounds() {
        let mut pkt = FramePacket::default();
        pkt.run_handler(|_raw, head, tail| {
            *head = 17;
            *tail = PACKET_RAW_SIZE + 100;
        });
        assert_eq!(pkt.data().len(), PACKET_RAW_SIZE - 17);
    }
}
