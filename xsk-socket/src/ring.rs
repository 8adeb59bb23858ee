//! # AF_XDP Ring Buffer Management
//!
//! ## Purpose
//!
//! This file defines the core data structures and logic for the four ring
//! buffers of an AF_XDP socket. These rings are the primary mechanism for
//! communication between the userspace application and the kernel.
//!
//! ## How it works
//!
//! Each ring is a single-producer/single-consumer queue living in memory
//! shared with the kernel. `RingProd<T>` and `RingCons<T>` wrap one side of
//! such a queue and keep local `cached_prod`/`cached_cons` copies of the
//! shared counters to amortize atomic reads. The atomic add in `submit` /
//! `release` is the release barrier that publishes ring entries to the
//! kernel; the atomic load in `nb_avail` / `nb_free` is the matching
//! acquire. The `RingType` enum handles the specifics of the four rings
//! (TX, RX, Fill, Completion): their socket option names and mmap offsets.
//!
//! ## Main components
//!
//! - `RingProd<T>`: the producer side (fill ring carries `u64` frame
//!   addresses, tx ring carries `XdpDesc`).
//! - `RingCons<T>`: the consumer side (completion ring carries `u64`,
//!   rx ring carries `XdpDesc`).
//! - `XdpDesc`: the descriptor structure for packets in the TX and RX
//!   rings, containing address, length, and options.
//! - `RingType`: an enum to differentiate between ring types and handle
//!   their specific setup requirements.

use crate::error::XskError;
use crate::mmap::OwnedMmap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Default number of descriptors for producer rings (fill, tx).
pub const DEFAULT_PROD_NUM_DESCS: u32 = 2048;
/// Default number of descriptors for consumer rings (completion, rx).
pub const DEFAULT_CONS_NUM_DESCS: u32 = 2048;
/// Default umem frame size in bytes.
pub const DEFAULT_FRAME_SIZE: u32 = 4096;
/// Default umem frame headroom in bytes.
pub const DEFAULT_FRAME_HEADROOM: u32 = 0;
/// Default umem flags.
pub const DEFAULT_UMEM_FLAGS: u32 = 0;

/// An XDP descriptor, used in the TX and RX rings.
///
/// This struct corresponds to `struct xdp_desc` in the kernel and describes
/// a single packet buffer in the umem.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpDesc {
    /// The address of the packet data within the umem.
    pub addr: u64,
    /// The length of the packet data.
    pub len: u32,
    /// Options for the descriptor, currently unused.
    pub options: u32,
}

impl XdpDesc {
    /// Creates a new `XdpDesc`.
    pub fn new(addr: u64, len: u32, options: u32) -> Self {
        XdpDesc { addr, len, options }
    }
}

/// The producer side of a kernel-shared ring (fill or tx).
pub struct RingProd<T: Copy> {
    pub(crate) cached_prod: u32,
    pub(crate) cached_cons: u32,
    pub(crate) mask: u32,
    pub(crate) size: u32,
    pub(crate) producer: *mut AtomicU32,
    pub(crate) consumer: *mut AtomicU32,
    pub(crate) flags: *mut AtomicU32,
    pub(crate) ring: *mut T,
    pub(crate) map: Arc<OwnedMmap>,
}

/// The consumer side of a kernel-shared ring (completion or rx).
pub struct RingCons<T: Copy> {
    pub(crate) cached_prod: u32,
    pub(crate) cached_cons: u32,
    pub(crate) mask: u32,
    pub(crate) size: u32,
    pub(crate) producer: *mut AtomicU32,
    pub(crate) consumer: *mut AtomicU32,
    pub(crate) flags: *mut AtomicU32,
    pub(crate) ring: *mut T,
    pub(crate) map: Arc<OwnedMmap>,
}

// A ring cursor is owned by exactly one userspace party; the kernel peer is
// synchronized through the shared atomic counters.
unsafe impl<T: Copy + Send> Send for RingProd<T> {}
unsafe impl<T: Copy + Send> Send for RingCons<T> {}

impl<T: Copy> RingProd<T> {
    /// Memory-maps the producer side of a ring from an AF_XDP socket.
    pub(crate) fn map(
        fd: libc::c_int,
        ring_type: RingType,
        size: u32,
        offsets: &libc::xdp_mmap_offsets,
    ) -> Result<Self, XskError> {
        debug_assert!(size.is_power_of_two());
        let off = ring_type.ring_offsets(offsets);
        let len = off.desc as usize + size as usize * size_of::<T>();
        let map = OwnedMmap::map_fd(fd, len, ring_type.pgoff())
            .map_err(|err| XskError::os("mmap ring", err))?;
        Ok(unsafe { Self::from_map(Arc::new(map), off, size) })
    }

    /// Builds a cursor over an already established mapping.
    ///
    /// The offsets must describe a ring of `size` entries of `T` inside
    /// `map`.
    pub(crate) unsafe fn from_map(
        map: Arc<OwnedMmap>,
        off: &libc::xdp_ring_offset,
        size: u32,
    ) -> Self {
        let base = map.as_u8_ptr();
        RingProd {
            cached_prod: 0,
            cached_cons: 0,
            mask: size - 1,
            size,
            producer: base.add(off.producer as usize) as *mut AtomicU32,
            consumer: base.add(off.consumer as usize) as *mut AtomicU32,
            flags: base.add(off.flags as usize) as *mut AtomicU32,
            ring: base.add(off.desc as usize) as *mut T,
            map,
        }
    }

    /// Number of free slots, clamped to `nb`.
    ///
    /// # How it works
    ///
    /// The cached consumer value is kept `size` ahead of the shared
    /// counter, so the free count is a single subtraction on the fast
    /// path. Only when that comes up short is the shared counter
    /// re-read (with acquire ordering) and the cache refreshed.
    ///
    /// # Arguments
    /// * `nb` - The number of slots the caller would like to produce.
    ///
    /// # Returns
    /// The number of free slots, at most `nb`.
    pub fn nb_free(&mut self, nb: u32) -> u32 {
        let mut free_entries = self.cached_cons.wrapping_sub(self.cached_prod);
        if free_entries < nb {
            self.cached_cons = unsafe { &*self.consumer }
                .load(Ordering::Acquire)
                .wrapping_add(self.size);
            free_entries = self.cached_cons.wrapping_sub(self.cached_prod);
        }
        free_entries.min(nb)
    }

    /// Reserves `nb` slots, all or nothing.
    ///
    /// A successful reservation only moves the local cursor; the slots
    /// become visible to the kernel with [`RingProd::submit`].
    ///
    /// # Arguments
    /// * `nb` - The number of slots to reserve. There is no partial
    ///   reservation.
    ///
    /// # Returns
    /// The index of the first reserved slot, or `None` when fewer than
    /// `nb` slots are free.
    pub fn reserve(&mut self, nb: u32) -> Option<u32> {
        if self.nb_free(nb) < nb {
            return None;
        }
        let idx = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(nb);
        Some(idx)
    }

    /// Publishes `nb` previously reserved and written slots to the kernel.
    ///
    /// The release-ordered add on the shared producer counter is the
    /// point at which the written descriptors become visible to the
    /// kernel; all slot writes must happen before this call.
    pub fn submit(&mut self, nb: u32) {
        unsafe { &*self.producer }.fetch_add(nb, Ordering::Release);
    }

    /// Returns a mutable reference to the slot at `idx` (wrapped by the
    /// ring mask).
    pub fn slot_mut(&mut self, idx: u32) -> &mut T {
        unsafe { &mut *self.ring.add((idx & self.mask) as usize) }
    }

    /// Reports whether the kernel requested a wakeup for this ring.
    pub fn needs_wakeup(&self) -> bool {
        unsafe { &*self.flags }.load(Ordering::Relaxed) & libc::XDP_RING_NEED_WAKEUP != 0
    }

    /// Number of descriptors the ring can hold.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn shared_producer(&self) -> u32 {
        unsafe { &*self.producer }.load(Ordering::Acquire)
    }

    pub(crate) fn shared_consumer(&self) -> u32 {
        unsafe { &*self.consumer }.load(Ordering::Acquire)
    }

    pub(crate) fn mapping(&self) -> Arc<OwnedMmap> {
        self.map.clone()
    }
}

impl<T: Copy> RingCons<T> {
    /// Memory-maps the consumer side of a ring from an AF_XDP socket.
    pub(crate) fn map(
        fd: libc::c_int,
        ring_type: RingType,
        size: u32,
        offsets: &libc::xdp_mmap_offsets,
    ) -> Result<Self, XskError> {
        debug_assert!(size.is_power_of_two());
        let off = ring_type.ring_offsets(offsets);
        let len = off.desc as usize + size as usize * size_of::<T>();
        let map = OwnedMmap::map_fd(fd, len, ring_type.pgoff())
            .map_err(|err| XskError::os("mmap ring", err))?;
        Ok(unsafe { Self::from_map(Arc::new(map), off, size) })
    }

    pub(crate) unsafe fn from_map(
        map: Arc<OwnedMmap>,
        off: &libc::xdp_ring_offset,
        size: u32,
    ) -> Self {
        let base = map.as_u8_ptr();
        RingCons {
            cached_prod: 0,
            cached_cons: 0,
            mask: size - 1,
            size,
            producer: base.add(off.producer as usize) as *mut AtomicU32,
            consumer: base.add(off.consumer as usize) as *mut AtomicU32,
            flags: base.add(off.flags as usize) as *mut AtomicU32,
            ring: base.add(off.desc as usize) as *mut T,
            map,
        }
    }

    /// Number of entries ready for consumption, clamped to `nb`.
    pub fn nb_avail(&mut self, nb: u32) -> u32 {
        let mut entries = self.cached_prod.wrapping_sub(self.cached_cons);
        if entries == 0 {
            self.cached_prod = unsafe { &*self.producer }.load(Ordering::Acquire);
            entries = self.cached_prod.wrapping_sub(self.cached_cons);
        }
        entries.min(nb)
    }

    /// Claims up to `nb` entries. Partial claims are allowed.
    ///
    /// The claimed entries stay claimed until [`RingCons::release`]
    /// returns them to the kernel (or [`RingCons::cancel`] rewinds the
    /// claim).
    ///
    /// # Arguments
    /// * `nb` - The maximum number of entries to claim.
    ///
    /// # Returns
    /// `(entries, idx)`: the number of claimed entries and the index of
    /// the first one. `idx` is only meaningful when `entries` is
    /// non-zero.
    pub fn peek(&mut self, nb: u32) -> (u32, u32) {
        let entries = self.nb_avail(nb);
        let idx = self.cached_cons;
        if entries > 0 {
            self.cached_cons = self.cached_cons.wrapping_add(entries);
        }
        (entries, idx)
    }

    /// Un-claims `nb` entries previously returned by `peek`, for retries.
    pub fn cancel(&mut self, nb: u32) {
        self.cached_cons = self.cached_cons.wrapping_sub(nb);
    }

    /// Returns `nb` consumed entries to the kernel.
    ///
    /// The release-ordered add on the shared consumer counter lets the
    /// kernel reuse the slots; the caller must be done reading them.
    pub fn release(&mut self, nb: u32) {
        unsafe { &*self.consumer }.fetch_add(nb, Ordering::Release);
    }

    /// Returns a copy of the slot at `idx` (wrapped by the ring mask).
    pub fn slot(&self, idx: u32) -> T {
        unsafe { *self.ring.add((idx & self.mask) as usize) }
    }

    /// Number of descriptors the ring can hold.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn shared_producer(&self) -> u32 {
        unsafe { &*self.producer }.load(Ordering::Acquire)
    }

    pub(crate) fn shared_consumer(&self) -> u32 {
        unsafe { &*self.consumer }.load(Ordering::Acquire)
    }

    pub(crate) fn mapping(&self) -> Arc<OwnedMmap> {
        self.map.clone()
    }
}

/// An enum representing the four types of AF_XDP rings.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RingType {
    /// The Transmit (TX) ring, for sending packets.
    Tx,
    /// The Receive (RX) ring, for receiving packets.
    Rx,
    /// The Fill ring, for providing the kernel with free umem frames.
    Fill,
    /// The Completion ring, for retrieving sent umem frames from the kernel.
    Completion,
}

impl RingType {
    fn sockopt(&self) -> libc::c_int {
        match self {
            RingType::Tx => libc::XDP_TX_RING,
            RingType::Rx => libc::XDP_RX_RING,
            RingType::Fill => libc::XDP_UMEM_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_COMPLETION_RING,
        }
    }

    fn pgoff(&self) -> u64 {
        match self {
            RingType::Tx => libc::XDP_PGOFF_TX_RING as u64,
            RingType::Rx => libc::XDP_PGOFF_RX_RING as u64,
            RingType::Fill => libc::XDP_UMEM_PGOFF_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_PGOFF_COMPLETION_RING,
        }
    }

    fn ring_offsets<'a>(&self, offsets: &'a libc::xdp_mmap_offsets) -> &'a libc::xdp_ring_offset {
        match self {
            RingType::Tx => &offsets.tx,
            RingType::Rx => &offsets.rx,
            RingType::Fill => &offsets.fr,
            RingType::Completion => &offsets.cr,
        }
    }

    /// Sets the size of this ring on the socket via `setsockopt`.
    pub(crate) fn set_size(self, raw_fd: libc::c_int, ring_size: u32) -> Result<(), XskError> {
        unsafe {
            if libc::setsockopt(
                raw_fd,
                libc::SOL_XDP,
                self.sockopt(),
                &ring_size as *const _ as *const libc::c_void,
                size_of::<u32>() as libc::socklen_t,
            ) < 0
            {
                return Err(XskError::last_os("setsockopt ring size"));
            }
        }
        Ok(())
    }
}

/// Queries the kernel for the mmap offsets of all four rings.
///
/// Requires a kernel that reports the flags field in the offsets structure.
pub(crate) fn mmap_offsets(fd: libc::c_int) -> Result<libc::xdp_mmap_offsets, XskError> {
    let mut offsets: libc::xdp_mmap_offsets = unsafe { std::mem::zeroed() };
    let mut optlen = size_of::<libc::xdp_mmap_offsets>() as libc::socklen_t;
    unsafe {
        if libc::getsockopt(
            fd,
            libc::SOL_XDP,
            libc::XDP_MMAP_OFFSETS,
            &mut offsets as *mut _ as *mut libc::c_void,
            &mut optlen,
        ) < 0
        {
            return Err(XskError::last_os("getsockopt XDP_MMAP_OFFSETS"));
        }
    }
    Ok(offsets)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    const PROD_OFF: u64 = 0;
    const CONS_OFF: u64 = 64;
    const FLAGS_OFF: u64 = 128;
    const DESC_OFF: u64 = 192;

    fn host_offsets() -> libc::xdp_ring_offset {
        let mut off: libc::xdp_ring_offset = unsafe { std::mem::zeroed() };
        off.producer = PROD_OFF;
        off.consumer = CONS_OFF;
        off.flags = FLAGS_OFF;
        off.desc = DESC_OFF;
        off
    }

    /// Builds a producer/consumer cursor pair over process-local memory,
    /// standing in for the kernel-shared pages.
    pub(crate) fn host_pair<T: Copy>(size: u32) -> (RingProd<T>, RingCons<T>) {
        let off = host_offsets();
        let len = DESC_OFF as usize + size as usize * size_of::<T>();
        let map = Arc::new(OwnedMmap::anon(len).unwrap());
        let prod = unsafe { RingProd::from_map(map.clone(), &off, size) };
        let cons = unsafe { RingCons::from_map(map, &off, size) };
        (prod, cons)
    }

    /// A fresh fill-style producer pair: the producer's cached consumer is
    /// kept a full ring ahead of the shared counter.
    pub(crate) fn host_fill_pair(size: u32) -> (RingProd<u64>, RingCons<u64>) {
        let (mut prod, cons) = host_pair::<u64>(size);
        prod.cached_cons = size;
        (prod, cons)
    }

    pub(crate) fn set_flags<T: Copy>(ring: &RingProd<T>, value: u32) {
        unsafe { &*ring.flags }.store(value, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn fresh_ring_is_empty_and_full_of_free_slots() {
        let (mut prod, mut cons) = host_fill_pair(8);
        assert_eq!(prod.nb_free(8), 8);
        assert_eq!(cons.nb_avail(8), 0);
        let (n, _) = cons.peek(8);
        assert_eq!(n, 0);
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        let (mut prod, _cons) = host_fill_pair(8);
        assert!(prod.reserve(9).is_none());
        let idx = prod.reserve(8).unwrap();
        assert_eq!(idx, 0);
        assert!(prod.reserve(1).is_none());
    }

    #[test]
    fn produced_entries_are_consumed_in_order_exactly_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (mut prod, mut cons) = host_fill_pair(8);
        let mut produced = 0u64;
        let mut consumed = Vec::new();

        // Interleave partial submits with partial peeks across several
        // wraps of the ring.
        for round in 0..32 {
            let n = (round % 5 + 1) as u32;
            if let Some(idx) = prod.reserve(n) {
                for i in 0..n {
                    *prod.slot_mut(idx + i) = produced;
                    produced += 1;
                }
                prod.submit(n);
            }
            let (avail, idx) = cons.peek(4);
            for i in 0..avail {
                consumed.push(cons.slot(idx + i));
            }
            cons.release(avail);
        }
        loop {
            let (avail, idx) = cons.peek(8);
            if avail == 0 {
                break;
            }
            for i in 0..avail {
                consumed.push(cons.slot(idx + i));
            }
            cons.release(avail);
        }

        assert_eq!(consumed.len() as u64, produced);
        for (i, v) in consumed.iter().enumerate() {
            assert_eq!(*v, i as u64);
        }
    }

    #[test]
    fn outstanding_entries_never_exceed_ring_size() {
        let (mut prod, mut cons) = host_fill_pair(4);
        for _ in 0..100 {
            if let Some(idx) = prod.reserve(3) {
                for i in 0..3 {
                    *prod.slot_mut(idx + i) = 0;
                }
                prod.submit(3);
            }
            let shared_prod =
                unsafe { &*prod.producer }.load(Ordering::Relaxed);
            let shared_cons =
                unsafe { &*prod.consumer }.load(Ordering::Relaxed);
            assert!(shared_prod.wrapping_sub(shared_cons) <= 4);
            let (n, _) = cons.peek(2);
            cons.release(n);
        }
    }

    #[test]
    fn peek_is_partial_and_cancel_rewinds() {
        let (mut prod, mut cons) = host_fill_pair(8);
        let idx = prod.reserve(3).unwrap();
        for i in 0..3 {
            *prod.slot_mut(idx + i) = 40 + i as u64;
        }
        prod.submit(3);

        let (n, idx) = cons.peek(8);
        assert_eq!(n, 3);
        assert_eq!(cons.slot(idx), 40);

        cons.cancel(n);
        let (again, idx2) = cons.peek(2);
        assert_eq!(again, 2);
        assert_eq!(idx2, idx);
        cons.release(again);
    }

    #[test]
    fn nb_free_is_clamped_to_request() {
        let (mut prod, _cons) = host_fill_pair(2048);
        assert_eq!(prod.nb_free(3000), 2048);
        assert_eq!(prod.nb_free(100), 100);
    }

    #[test]
    fn wakeup_flag_probe() {
        let (prod, _cons) = host_fill_pair(8);
        assert!(!prod.needs_wakeup());
        set_flags(&prod, libc::XDP_RING_NEED_WAKEUP);
        assert!(prod.needs_wakeup());
    }
}
