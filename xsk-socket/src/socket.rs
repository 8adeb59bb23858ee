//
// socket.rs - AF_XDP Socket and Shared-Umem Context Management
//
// Purpose:
//   This module creates and binds XDP sockets against a registered umem and
//   manages the per-(netns, ifindex, queue) contexts that let several
//   sockets share one umem.
//
// How it works:
//   - The first socket on a umem rides the descriptor the umem was
//     registered on and adopts the umem's saved fill/completion rings; any
//     further socket gets a descriptor of its own and binds with
//     XDP_SHARED_UMEM.
//   - A context exists once per (netns cookie, ifindex, queue id) triple
//     and owns that triple's fill/completion ring pair; sockets reference
//     the context and release it on deletion.
//   - Unless inhibited, socket creation attaches the default redirect
//     program and registers the socket in its queue map.
//
// Main components:
//   - Socket, SocketConfig, SocketRings: the public creation surface.
//   - Ctx: the per-queue singleton tracked inside the umem.
//

use crate::error::XskError;
use crate::mmap::OwnedMmap;
use crate::prog::{self, ProgHandles};
use crate::ring::{self, RingCons, RingProd, RingType, XdpDesc};
use crate::umem::{create_umem_rings, Umem};
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Suppresses loading of the default redirect program at socket creation.
pub const INHIBIT_PROG_LOAD: u32 = 1;

/// Substitute namespace cookie for kernels without `SO_NETNS_COOKIE`.
const INIT_NS: u64 = 1;

/// Configuration for an XDP socket.
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    pub rx_size: u32,
    pub tx_size: u32,
    /// Either 0 or [`INHIBIT_PROG_LOAD`]; any other bit is rejected.
    pub libbpf_flags: u32,
    /// XDP attach mode flags (generic / native / offload) used when the
    /// default program is loaded.
    pub xdp_flags: u32,
    /// Flags for `bind`, e.g. `XDP_USE_NEED_WAKEUP`. Ignored when the
    /// umem is shared; the bind then carries `XDP_SHARED_UMEM` instead.
    pub bind_flags: u16,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            rx_size: ring::DEFAULT_CONS_NUM_DESCS,
            tx_size: ring::DEFAULT_PROD_NUM_DESCS,
            libbpf_flags: 0,
            xdp_flags: 0,
            bind_flags: 0,
        }
    }
}

pub(crate) fn resolve_config(user: Option<SocketConfig>) -> Result<SocketConfig, XskError> {
    match user {
        None => Ok(SocketConfig::default()),
        Some(cfg) => {
            if cfg.libbpf_flags & !INHIBIT_PROG_LOAD != 0 {
                return Err(XskError::Invalid("unknown libbpf flags"));
            }
            Ok(cfg)
        }
    }
}

pub(crate) type CtxKey = (u64, u32, u32);

/// Per-(netns, ifindex, queue) singleton.
///
/// Owns the triple's fill/completion ring mappings and, once the default
/// program is attached, the program and map handles. Dropping the context
/// releases whatever it still holds.
pub(crate) struct Ctx {
    pub(crate) netns_cookie: u64,
    pub(crate) ifindex: u32,
    pub(crate) queue_id: u32,
    pub(crate) refcount: u32,
    pub(crate) ifname: String,
    pub(crate) fill_map: Arc<OwnedMmap>,
    pub(crate) comp_map: Arc<OwnedMmap>,
    pub(crate) prog: Option<ProgHandles>,
}

impl Ctx {
    fn matches(&self, key: CtxKey) -> bool {
        (self.netns_cookie, self.ifindex, self.queue_id) == key
    }
}

/// Ring cursors handed to the caller of [`Socket::create`].
///
/// `rx`/`tx` are present when requested. `fill`/`comp` are present exactly
/// when the call established the context's ring pair (first socket on the
/// umem, or first socket on a new queue); a socket joining an existing
/// context shares the rings its predecessor already drives.
pub struct SocketRings {
    pub rx: Option<RingCons<XdpDesc>>,
    pub tx: Option<RingProd<XdpDesc>>,
    pub fill: Option<RingProd<u64>>,
    pub comp: Option<RingCons<u64>>,
}

/// A bound XDP socket.
pub struct Socket {
    fd: RawFd,
    owned_fd: Option<OwnedFd>,
    config: SocketConfig,
    ctx_key: CtxKey,
    // Keep the rx/tx ring mappings alive for as long as the socket exists,
    // independent of what the caller does with the cursors.
    rx_map: Option<Arc<OwnedMmap>>,
    tx_map: Option<Arc<OwnedMmap>>,
}

impl Socket {
    /// Creates a socket bound to `(ifname, queue_id)` on `umem`.
    ///
    /// # How it works
    ///
    /// 1. Validates the configuration and resolves the interface.
    /// 2. Takes a umem reference; a second reference means a fresh
    ///    AF_XDP descriptor, the first rides the umem's own.
    /// 3. Reads the netns cookie (substituting the init-namespace value
    ///    on kernels without the option) and acquires the per-queue
    ///    context, creating its fill/completion ring pair if needed.
    /// 4. Sizes and maps the requested rx/tx rings, seeding their cached
    ///    cursors from the shared counters.
    /// 5. Binds: a shared umem binds with `XDP_SHARED_UMEM` and the
    ///    parent descriptor, otherwise with the configured bind flags.
    /// 6. Attaches the default redirect program unless inhibited.
    /// 7. Consumes the umem's saved rings.
    ///
    /// Any failure unwinds the context reference, the umem reference and
    /// everything mapped so far.
    ///
    /// # Arguments
    /// * `ifname` - The name of the network interface to bind to.
    /// * `queue_id` - The interface queue to bind to.
    /// * `umem` - The registered umem backing this socket.
    /// * `want_rx`, `want_tx` - Which directions to set up; at least one
    ///   must be set.
    /// * `config` - Optional ring sizes and flags.
    ///
    /// Concurrent creates against the same umem must be serialized by
    /// the caller.
    pub fn create(
        ifname: &str,
        queue_id: u32,
        umem: &mut Umem,
        want_rx: bool,
        want_tx: bool,
        config: Option<SocketConfig>,
    ) -> Result<(Socket, SocketRings), XskError> {
        let config = resolve_config(config)?;
        if !want_rx && !want_tx {
            return Err(XskError::Invalid("socket needs at least one of rx and tx"));
        }
        let ifindex = resolve_ifindex(ifname)?;

        umem.refcount += 1;
        let (fd, owned_fd, rx_setup_done, tx_setup_done) = if umem.refcount > 1 {
            let raw = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
            if raw < 0 {
                umem.refcount -= 1;
                return Err(XskError::last_os("socket AF_XDP"));
            }
            (raw, Some(unsafe { OwnedFd::from_raw_fd(raw) }), false, false)
        } else {
            (
                umem.fd(),
                None,
                umem.rx_ring_setup_done,
                umem.tx_ring_setup_done,
            )
        };

        let netns_cookie = match netns_cookie(fd) {
            Ok(cookie) => cookie,
            Err(err) => {
                umem.refcount -= 1;
                return Err(err);
            }
        };
        let key: CtxKey = (netns_cookie, ifindex, queue_id);

        // Acquire the per-queue context: reuse a matching one, otherwise
        // build it from the umem's saved rings or a fresh pair on this
        // descriptor.
        let mut fresh_rings: Option<(RingProd<u64>, RingCons<u64>)> = None;
        if let Some(ctx) = umem.ctx_list.iter_mut().find(|c| c.matches(key)) {
            ctx.refcount += 1;
        } else {
            let saved = match (&umem.fill_save, &umem.comp_save) {
                (Some(fill), Some(comp)) => Some((fill.mapping(), comp.mapping())),
                _ => None,
            };
            let (fill_map, comp_map) = match saved {
                Some(maps) => maps,
                None => match create_umem_rings(fd, &umem.config) {
                    Ok((fill, comp)) => {
                        let maps = (fill.mapping(), comp.mapping());
                        fresh_rings = Some((fill, comp));
                        maps
                    }
                    Err(err) => {
                        umem.refcount -= 1;
                        return Err(err);
                    }
                },
            };
            umem.ctx_list.push(Ctx {
                netns_cookie,
                ifindex,
                queue_id,
                refcount: 1,
                ifname: ifname.to_string(),
                fill_map,
                comp_map,
                prog: None,
            });
        }

        match finish_create(
            fd,
            umem,
            key,
            want_rx,
            want_tx,
            rx_setup_done,
            tx_setup_done,
            &config,
        ) {
            Ok((rx, tx)) => {
                let rx_map = rx.as_ref().map(|r| r.mapping());
                let tx_map = tx.as_ref().map(|r| r.mapping());
                let (fill, comp) = match fresh_rings {
                    Some((fill, comp)) => (Some(fill), Some(comp)),
                    // The first socket adopts the saved rings; their
                    // cursors go to the caller, the mapping stays with the
                    // context.
                    None => (umem.fill_save.take(), umem.comp_save.take()),
                };
                umem.fill_save = None;
                umem.comp_save = None;
                Ok((
                    Socket {
                        fd,
                        owned_fd,
                        config,
                        ctx_key: key,
                        rx_map,
                        tx_map,
                    },
                    SocketRings { rx, tx, fill, comp },
                ))
            }
            Err(err) => {
                put_ctx(umem, key);
                umem.refcount -= 1;
                Err(err)
            }
        }
    }

    /// The socket's file descriptor, for `poll`/`sendto`.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Unbinds the socket and releases everything it referenced.
    ///
    /// The rx/tx mappings disappear once the cursors handed out at
    /// creation are gone as well; the context and, with it, the
    /// fill/completion rings are released when their last socket goes.
    /// Failures while detaching the shared program are logged, not
    /// surfaced.
    pub fn delete(self, umem: &mut Umem) {
        if let Some(ctx) = umem.ctx_list.iter_mut().find(|c| c.matches(self.ctx_key)) {
            if let Some(handles) = ctx.prog.take() {
                prog::release(handles, ctx.queue_id);
            }
        }
        put_ctx(umem, self.ctx_key);
        if umem.refcount > 0 {
            umem.refcount -= 1;
        }
        let Socket {
            owned_fd,
            rx_map,
            tx_map,
            ..
        } = self;
        // Unmap rx/tx (last holders permitting) before the descriptor
        // closes; the umem's own descriptor is not ours to close.
        drop(rx_map);
        drop(tx_map);
        drop(owned_fd);
    }
}

/// Releases one reference on the context for `key`; the last reference
/// removes the context and with it the ring mappings and program handles
/// it still holds.
pub(crate) fn put_ctx(umem: &mut Umem, key: CtxKey) {
    if let Some(pos) = umem.ctx_list.iter().position(|c| c.matches(key)) {
        umem.ctx_list[pos].refcount -= 1;
        if umem.ctx_list[pos].refcount == 0 {
            let Ctx {
                fill_map,
                comp_map,
                prog,
                ..
            } = umem.ctx_list.remove(pos);
            // Final release: the ring pair unmaps once no adopted cursor
            // references it either, and any program handles close.
            drop(fill_map);
            drop(comp_map);
            drop(prog);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn finish_create(
    fd: RawFd,
    umem: &mut Umem,
    key: CtxKey,
    want_rx: bool,
    want_tx: bool,
    rx_setup_done: bool,
    tx_setup_done: bool,
    config: &SocketConfig,
) -> Result<(Option<RingCons<XdpDesc>>, Option<RingProd<XdpDesc>>), XskError> {
    let (_, ifindex, queue_id) = key;

    if want_rx && !rx_setup_done {
        RingType::Rx.set_size(fd, config.rx_size)?;
        if fd == umem.fd() {
            umem.rx_ring_setup_done = true;
        }
    }
    if want_tx && !tx_setup_done {
        RingType::Tx.set_size(fd, config.tx_size)?;
        if fd == umem.fd() {
            umem.tx_ring_setup_done = true;
        }
    }

    let offsets = ring::mmap_offsets(fd)?;

    let rx = if want_rx {
        let mut rx = RingCons::<XdpDesc>::map(fd, RingType::Rx, config.rx_size, &offsets)?;
        rx.cached_prod = rx.shared_producer();
        rx.cached_cons = rx.shared_consumer();
        Some(rx)
    } else {
        None
    };
    let tx = if want_tx {
        let mut tx = RingProd::<XdpDesc>::map(fd, RingType::Tx, config.tx_size, &offsets)?;
        tx.cached_prod = tx.shared_producer();
        // The cached consumer runs a full ring ahead of the shared counter.
        tx.cached_cons = tx.shared_consumer().wrapping_add(config.tx_size);
        Some(tx)
    } else {
        None
    };

    let (bind_flags, shared_umem_fd) = if umem.refcount > 1 {
        (libc::XDP_SHARED_UMEM, umem.fd() as u32)
    } else {
        (config.bind_flags, 0)
    };
    let sxdp = libc::sockaddr_xdp {
        sxdp_family: libc::AF_XDP as libc::sa_family_t,
        sxdp_flags: bind_flags,
        sxdp_ifindex: ifindex,
        sxdp_queue_id: queue_id,
        sxdp_shared_umem_fd: shared_umem_fd,
    };
    unsafe {
        if libc::bind(
            fd,
            &sxdp as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_xdp>() as libc::socklen_t,
        ) < 0
        {
            return Err(XskError::last_os("bind AF_XDP"));
        }
    }

    if config.libbpf_flags & INHIBIT_PROG_LOAD == 0 {
        prog::setup(umem, key, fd, want_rx, config.xdp_flags)?;
    }

    Ok((rx, tx))
}

fn resolve_ifindex(ifname: &str) -> Result<u32, XskError> {
    let name =
        CString::new(ifname).map_err(|_| XskError::Invalid("interface name contains NUL"))?;
    let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if idx == 0 {
        return Err(XskError::NotFound(format!("interface {ifname}")));
    }
    Ok(idx)
}

fn netns_cookie(fd: RawFd) -> Result<u64, XskError> {
    let mut cookie: u64 = 0;
    let mut len = size_of::<u64>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NETNS_COOKIE,
            &mut cookie as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOPROTOOPT) {
            return Ok(INIT_NS);
        }
        return Err(XskError::os("getsockopt SO_NETNS_COOKIE", err));
    }
    Ok(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = resolve_config(None).unwrap();
        assert_eq!(cfg.rx_size, 2048);
        assert_eq!(cfg.tx_size, 2048);
        assert_eq!(cfg.libbpf_flags, 0);
        assert_eq!(cfg.xdp_flags, 0);
        assert_eq!(cfg.bind_flags, 0);
    }

    #[test]
    fn inhibit_prog_load_is_the_only_accepted_flag() {
        let mut cfg = SocketConfig::default();
        cfg.libbpf_flags = INHIBIT_PROG_LOAD;
        assert!(resolve_config(Some(cfg)).is_ok());

        cfg.libbpf_flags = 0x4;
        assert!(matches!(
            resolve_config(Some(cfg)),
            Err(XskError::Invalid(_))
        ));

        cfg.libbpf_flags = INHIBIT_PROG_LOAD | 0x8;
        assert!(matches!(
            resolve_config(Some(cfg)),
            Err(XskError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_interface_is_not_found() {
        let err = resolve_ifindex("does-not-exist0").unwrap_err();
        assert!(matches!(err, XskError::NotFound(_)));
    }
}
