//! A single-queue AF_XDP endpoint bundling the umem, the socket and the
//! four rings behind descriptor-level operations.
//!
//! The endpoint allocates its own frame area, registers it as a umem,
//! binds one socket to `(interface, queue)` and exposes the raw
//! fill/completion/rx/tx cycle: post free frames, reap received
//! descriptors, stage transmissions, reclaim sent frames. Callers that
//! want packets instead of descriptors sit one layer above.

use crate::error::XskError;
use crate::mmap::OwnedMmap;
use crate::ring::{self, RingCons, RingProd, XdpDesc};
use crate::socket::{Socket, SocketConfig};
use crate::umem::{Umem, UmemConfig};

/// Geometry and flags of an endpoint: the umem side and the socket side.
#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    pub fill_size: u32,
    pub comp_size: u32,
    pub frame_num: u32,
    pub frame_size: u32,
    pub frame_headroom: u32,
    pub umem_flags: u32,
    pub rx_size: u32,
    pub tx_size: u32,
    pub libbpf_flags: u32,
    pub xdp_flags: u32,
    pub bind_flags: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            fill_size: 2048,
            comp_size: 2048,
            frame_num: 4096,
            frame_size: 2048,
            frame_headroom: 0,
            umem_flags: 0,
            rx_size: ring::DEFAULT_CONS_NUM_DESCS,
            tx_size: ring::DEFAULT_PROD_NUM_DESCS,
            libbpf_flags: 0,
            xdp_flags: libbpf_sys::XDP_FLAGS_SKB_MODE,
            bind_flags: libc::XDP_USE_NEED_WAKEUP,
        }
    }
}

/// A bound single-queue endpoint with raw descriptor-level APIs.
pub struct Endpoint {
    area: OwnedMmap,
    umem: Option<Umem>,
    socket: Option<Socket>,
    fill: RingProd<u64>,
    comp: RingCons<u64>,
    rx: RingCons<XdpDesc>,
    tx: RingProd<XdpDesc>,
    config: EndpointConfig,
}

impl Endpoint {
    /// Creates an endpoint on `(ifname, queue_id)` and returns it together
    /// with descriptors tiling the whole umem at frame boundaries.
    ///
    /// # How it works
    ///
    /// 1. Allocates an anonymous, pre-faulted frame area.
    /// 2. Registers it as a umem, which also creates the fill and
    ///    completion rings.
    /// 3. Binds one socket to the interface queue; the socket adopts the
    ///    umem's rings and maps its own rx/tx pair.
    /// 4. Builds one descriptor per frame, `addr = index * frame_size`.
    ///
    /// Failures unwind whatever was established, in reverse order.
    ///
    /// # Arguments
    /// * `ifname` - The name of the network interface to bind to.
    /// * `queue_id` - The interface queue to bind to.
    /// * `config` - Optional geometry and flag overrides.
    pub fn new(
        ifname: &str,
        queue_id: u32,
        config: Option<EndpointConfig>,
    ) -> Result<(Endpoint, Vec<XdpDesc>), XskError> {
        let config = config.unwrap_or_default();
        let area =
            OwnedMmap::anon(config.frame_num as usize * config.frame_size as usize)
                .map_err(|err| XskError::os("allocate umem area", err))?;

        let mut umem = Umem::create(
            area.as_void_ptr(),
            config.frame_num as u64 * config.frame_size as u64,
            Some(UmemConfig {
                fill_size: config.fill_size,
                comp_size: config.comp_size,
                frame_size: config.frame_size,
                frame_headroom: config.frame_headroom,
                flags: config.umem_flags,
            }),
        )?;

        let (socket, rings) = match Socket::create(
            ifname,
            queue_id,
            &mut umem,
            true,
            true,
            Some(SocketConfig {
                rx_size: config.rx_size,
                tx_size: config.tx_size,
                libbpf_flags: config.libbpf_flags,
                xdp_flags: config.xdp_flags,
                bind_flags: config.bind_flags,
            }),
        ) {
            Ok(created) => created,
            Err(err) => {
                if let Err((_, del_err)) = umem.delete() {
                    log::warn!("failed to delete umem during unwind: {del_err}");
                }
                return Err(err);
            }
        };

        // The first socket on a fresh umem always receives all four rings.
        let (Some(rx), Some(tx), Some(fill), Some(comp)) =
            (rings.rx, rings.tx, rings.fill, rings.comp)
        else {
            return Err(XskError::Invalid("endpoint socket came without rings"));
        };

        let descs = frame_descs(config.frame_num, config.frame_size);

        Ok((
            Endpoint {
                area,
                umem: Some(umem),
                socket: Some(socket),
                fill,
                comp,
                rx,
                tx,
                config,
            },
            descs,
        ))
    }

    /// Posts as many of `descs` as fit on the fill ring and returns the
    /// descriptors that did not.
    ///
    /// The accepted count is `min(len(descs), free slots)`; reposting the
    /// returned tail across drain cycles eventually posts every address.
    pub fn populate_fill(&mut self, descs: &[XdpDesc]) -> Vec<XdpDesc> {
        populate_fill_ring(&mut self.fill, descs)
    }

    /// Stages as many of `descs` as fit on the tx ring (address and
    /// length) and returns the descriptors that did not. The caller
    /// signals the kernel afterwards, typically through [`Endpoint::poll`].
    pub fn populate_tx(&mut self, descs: &[XdpDesc]) -> Vec<XdpDesc> {
        populate_tx_ring(&mut self.tx, descs)
    }

    /// Reaps received descriptors. The frames are not reposted on the
    /// fill ring; the caller does that once it is done with the payloads.
    pub fn recycle_rx(&mut self) -> Vec<XdpDesc> {
        let batch = self.config.rx_size;
        recycle_rx_ring(&mut self.rx, batch)
    }

    /// Reaps transmitted frame addresses from the completion ring; only
    /// `addr` is meaningful on the returned descriptors.
    pub fn recycle_comp(&mut self) -> Vec<XdpDesc> {
        let batch = self.config.comp_size;
        recycle_comp_ring(&mut self.comp, batch)
    }

    /// Polls the socket descriptor for `events`, returning the returned
    /// events (0 on timeout).
    pub fn poll(&self, events: i16, timeout_ms: i32) -> Result<i16, XskError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or(XskError::Invalid("endpoint already closed"))?;
        let mut fds = [libc::pollfd {
            fd: socket.fd(),
            events,
            revents: 0,
        }];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if rc < 0 {
            return Err(XskError::last_os("poll"));
        }
        Ok(fds[0].revents)
    }

    /// The full frame behind `desc`; slicing to `desc.len` is the
    /// caller's business.
    pub fn frame(&self, desc: &XdpDesc) -> &[u8] {
        let frame_size = self.config.frame_size as usize;
        debug_assert!(desc.addr as usize + frame_size <= self.area.len());
        unsafe {
            std::slice::from_raw_parts(self.area.as_u8_ptr().add(desc.addr as usize), frame_size)
        }
    }

    /// Mutable access to the frame behind `desc`, for staging payloads.
    pub fn frame_mut(&mut self, desc: &XdpDesc) -> &mut [u8] {
        let frame_size = self.config.frame_size as usize;
        debug_assert!(desc.addr as usize + frame_size <= self.area.len());
        unsafe {
            std::slice::from_raw_parts_mut(
                self.area.as_u8_ptr().add(desc.addr as usize),
                frame_size,
            )
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Tears down socket, umem and frame area, in that order.
    pub fn close(self) {}
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let (Some(socket), Some(mut umem)) = (self.socket.take(), self.umem.take()) {
            socket.delete(&mut umem);
            if let Err((_, err)) = umem.delete() {
                log::warn!("failed to delete umem: {err}");
            }
        }
        // Ring cursors and the frame area unmap on drop.
    }
}

/// Descriptors tiling a umem of `frame_num` frames of `frame_size` bytes:
/// `addr_i = i * frame_size`, lengths zero.
pub fn frame_descs(frame_num: u32, frame_size: u32) -> Vec<XdpDesc> {
    (0..frame_num as u64)
        .map(|i| XdpDesc::new(i * frame_size as u64, 0, 0))
        .collect()
}

pub(crate) fn populate_fill_ring(fill: &mut RingProd<u64>, descs: &[XdpDesc]) -> Vec<XdpDesc> {
    let free = fill.nb_free(descs.len() as u32);
    let nb = match fill.reserve(free) {
        Some(idx) => {
            for (i, desc) in descs[..free as usize].iter().enumerate() {
                *fill.slot_mut(idx.wrapping_add(i as u32)) = desc.addr;
            }
            fill.submit(free);
            free
        }
        None => 0,
    };
    descs[nb as usize..].to_vec()
}

pub(crate) fn populate_tx_ring(tx: &mut RingProd<XdpDesc>, descs: &[XdpDesc]) -> Vec<XdpDesc> {
    let free = tx.nb_free(descs.len() as u32);
    let nb = match tx.reserve(free) {
        Some(idx) => {
            for (i, desc) in descs[..free as usize].iter().enumerate() {
                *tx.slot_mut(idx.wrapping_add(i as u32)) = XdpDesc::new(desc.addr, desc.len, 0);
            }
            tx.submit(free);
            free
        }
        None => 0,
    };
    descs[nb as usize..].to_vec()
}

pub(crate) fn recycle_rx_ring(rx: &mut RingCons<XdpDesc>, batch: u32) -> Vec<XdpDesc> {
    let (n, idx) = rx.peek(batch);
    let mut descs = Vec::with_capacity(n as usize);
    for i in 0..n {
        descs.push(rx.slot(idx.wrapping_add(i)));
    }
    rx.release(n);
    descs
}

pub(crate) fn recycle_comp_ring(comp: &mut RingCons<u64>, batch: u32) -> Vec<XdpDesc> {
    let (n, idx) = comp.peek(batch);
    let mut descs = Vec::with_capacity(n as usize);
    for i in 0..n {
        descs.push(XdpDesc::new(comp.slot(idx.wrapping_add(i)), 0, 0));
    }
    comp.release(n);
    descs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::testing::{host_fill_pair, host_pair};

    #[test]
    fn frames_tile_the_umem() {
        let descs = frame_descs(4096, 2048);
        assert_eq!(descs.len(), 4096);
        assert_eq!(descs[0].addr, 0);
        assert_eq!(descs[1].addr, 2048);
        assert_eq!(descs[4095].addr, 8_386_560);
        let area = 4096u64 * 2048;
        assert!(descs.iter().all(|d| d.addr < area));
    }

    #[test]
    fn populate_fill_clamps_to_ring_capacity() {
        let (mut fill, _cons) = host_fill_pair(2048);
        let descs = frame_descs(3000, 2048);
        let leftover = populate_fill_ring(&mut fill, &descs);
        assert_eq!(leftover.len(), 3000 - 2048);
        assert_eq!(leftover[0].addr, 2048 * 2048);
    }

    #[test]
    fn populate_fill_posts_everything_across_drain_cycles() {
        let (mut fill, mut kernel) = host_fill_pair(8);
        let descs = frame_descs(20, 64);
        let mut pending = populate_fill_ring(&mut fill, &descs);
        let mut seen = Vec::new();

        while !pending.is_empty() || {
            let (n, _) = kernel.peek(1);
            kernel.cancel(n);
            n > 0
        } {
            let (n, idx) = kernel.peek(8);
            for i in 0..n {
                seen.push(kernel.slot(idx.wrapping_add(i)));
            }
            kernel.release(n);
            pending = populate_fill_ring(&mut fill, &pending);
        }

        let expected: Vec<u64> = descs.iter().map(|d| d.addr).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn populate_tx_copies_addr_and_len() {
        let (mut tx, kernel) = host_pair::<XdpDesc>(8);
        tx.cached_cons = 8;
        let descs = vec![XdpDesc::new(4096, 60, 7), XdpDesc::new(8192, 1500, 0)];
        let leftover = populate_tx_ring(&mut tx, &descs);
        assert!(leftover.is_empty());
        assert_eq!(kernel.slot(0), XdpDesc::new(4096, 60, 0));
        assert_eq!(kernel.slot(1), XdpDesc::new(8192, 1500, 0));
    }

    #[test]
    fn recycle_comp_reports_only_addresses() {
        let (mut kernel, mut comp) = host_pair::<u64>(8);
        kernel.cached_cons = 8;
        let idx = kernel.reserve(3).unwrap();
        for i in 0..3 {
            *kernel.slot_mut(idx.wrapping_add(i)) = (i as u64 + 1) * 2048;
        }
        kernel.submit(3);

        let descs = recycle_comp_ring(&mut comp, 8);
        assert_eq!(
            descs,
            vec![
                XdpDesc::new(2048, 0, 0),
                XdpDesc::new(4096, 0, 0),
                XdpDesc::new(6144, 0, 0)
            ]
        );
    }

    #[test]
    fn recycle_rx_drains_and_releases() {
        let (mut kernel, mut rx) = host_pair::<XdpDesc>(8);
        kernel.cached_cons = 8;
        let idx = kernel.reserve(2).unwrap();
        *kernel.slot_mut(idx) = XdpDesc::new(0, 60, 0);
        *kernel.slot_mut(idx + 1) = XdpDesc::new(2048, 1500, 0);
        kernel.submit(2);

        let descs = recycle_rx_ring(&mut rx, 8);
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[1], XdpDesc::new(2048, 1500, 0));
        // The kernel side can reuse the slots once released.
        assert_eq!(kernel.nb_free(8), 8);
    }

    #[test]
    fn default_config_geometry() {
        let cfg = EndpointConfig::default();
        assert_eq!(cfg.frame_num, 4096);
        assert_eq!(cfg.frame_size, 2048);
        assert_eq!(cfg.fill_size, 2048);
        assert_eq!(cfg.comp_size, 2048);
    }
}
