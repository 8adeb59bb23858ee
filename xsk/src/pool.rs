//! A lock-free pool of reusable packets for allocation-free hot paths.

use crate::packet::FramePacket;
use crossbeam_queue::ArrayQueue;

/// A fixed-capacity, lock-free pool of [`FramePacket`]s.
///
/// `get` falls back to a fresh allocation when the pool is empty; `put`
/// drops the packet when the pool is full. Safe to share across threads.
pub struct PacketPool {
    pool: ArrayQueue<Box<FramePacket>>,
}

impl PacketPool {
    /// Creates a pool with `capacity` pre-allocated packets (at least
    /// one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let pool = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = pool.push(Box::default());
        }
        PacketPool { pool }
    }

    /// Takes a packet out of the pool, allocating when it is empty.
    pub fn get(&self) -> Box<FramePacket> {
        self.pool.pop().unwrap_or_default()
    }

    /// Returns a packet to the pool; excess packets are dropped.
    pub fn put(&self, mut packet: Box<FramePacket>) {
        packet.reset();
        let _ = self.pool.push(packet);
    }

    /// Packets currently available without allocating.
    pub fn available(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn get_and_put_recycle_packets() {
        let pool = PacketPool::new(2);
        assert_eq!(pool.available(), 2);

        let mut pkt = pool.get();
        assert_eq!(pool.available(), 1);
        pkt.set_data(b"x").unwrap();
        pool.put(pkt);
        assert_eq!(pool.available(), 2);

        // Recycled packets come back empty.
        let pkt = pool.get();
        assert_eq!(pkt.len(), 0);
    }

    #[test]
    fn empty_pool_allocates_and_full_pool_drops() {
        let pool = PacketPool::new(1);
        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.available(), 0);
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.available(), 1);
    }
}
