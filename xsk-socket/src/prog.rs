//! # Default XDP Redirect Program Management
//!
//! ## Purpose
//!
//! Rx-capable sockets need an XDP program on the interface that redirects
//! matching packets into the socket map. This module loads, attaches,
//! pins and reference-counts that default program so that any number of
//! sockets and cooperating processes can share one attachment per
//! interface.
//!
//! ## How it works
//!
//! The embedded object carries two maps: the socket map (`xsks_map`,
//! queue id -> socket fd) the program redirects through, and its `.data`
//! section, whose first four bytes hold the shared refcount. Attaching
//! first looks for a program already on the interface and tries to join
//! it by incrementing the refcount; a stored value of zero marks a
//! program that is being detached, in which case its pin is removed and a
//! fresh program is loaded. A fresh load patches the socket map's
//! `max_entries` to the interface's maximum rx queue count, attaches via
//! a BPF link and pins the link so other processes can find and release
//! it. All refcount traffic happens under the cross-process lock.
//!
//! ## Main components
//!
//! - `setup()`: attach-or-join called from socket creation.
//! - `release()`: detach protocol called from socket deletion.
//! - `setup_xdp_prog()`: standalone attach returning the socket map.

use crate::error::XskError;
use crate::lock;
use crate::tools::eth_channels;
use crate::umem::Umem;
use include_bytes_aligned::include_bytes_aligned;
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

static DEFAULT_PROG_OBJ: &[u8] =
    include_bytes_aligned!(16, concat!(env!("OUT_DIR"), "/xsk_def_xdp_prog.o"));

const PROG_NAME: &str = "xsk_def_prog";
const SOCKET_MAP_NAME: &str = "xsks_map";
const REFCNT_SECTION_PREFIX: &str = ".data";

/// Handles on the attached program held by a per-queue context.
pub(crate) struct ProgHandles {
    pub(crate) prog: OwnedFd,
    pub(crate) prog_id: u32,
    pub(crate) xsks_map: OwnedFd,
    /// Refcount map fd and its value size; absent when a foreign program
    /// without a refcount section is attached to the interface.
    pub(crate) refcnt_map: Option<(OwnedFd, u32)>,
}

/// Attaches (or joins) the default program for the context identified by
/// `key` and registers `xsk_fd` in the socket map when the socket can
/// receive.
pub(crate) fn setup(
    umem: &mut Umem,
    key: crate::socket::CtxKey,
    xsk_fd: RawFd,
    has_rx: bool,
    xdp_flags: u32,
) -> Result<(), XskError> {
    let _lock = lock::acquire()?;

    let ctx = umem
        .ctx_list
        .iter_mut()
        .find(|c| (c.netns_cookie, c.ifindex, c.queue_id) == key)
        .ok_or(XskError::Invalid("socket has no context"))?;

    let (handles, attached_now) = setup_prog(ctx.ifindex, &ctx.ifname, xdp_flags)?;

    // Tx-only sockets must not divert traffic into themselves.
    if has_rx {
        let fd_val: i32 = xsk_fd;
        let rc = unsafe {
            libbpf_sys::bpf_map_update_elem(
                handles.xsks_map.as_raw_fd(),
                &ctx.queue_id as *const _ as *const libc::c_void,
                &fd_val as *const _ as *const libc::c_void,
                libbpf_sys::BPF_ANY as u64,
            )
        };
        if rc < 0 {
            if attached_now {
                unpin_link(handles.prog_id);
            }
            return Err(XskError::os(
                "update socket map",
                io::Error::from_raw_os_error(-rc),
            ));
        }
    }

    ctx.prog = Some(handles);
    Ok(())
}

/// Attaches the default program to `ifname` (or joins an already attached
/// instance) and returns a handle to its socket map.
///
/// The program stays attached afterwards; the shared refcount reflects
/// this caller until a cooperating process detaches.
pub fn setup_xdp_prog(ifname: &str, xdp_flags: u32) -> Result<OwnedFd, XskError> {
    let name = CString::new(ifname).map_err(|_| XskError::Invalid("interface name contains NUL"))?;
    let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if ifindex == 0 {
        return Err(XskError::NotFound(format!("interface {ifname}")));
    }

    let _lock = lock::acquire()?;
    let (handles, _) = setup_prog(ifindex, ifname, xdp_flags)?;
    dup_cloexec(handles.xsks_map.as_raw_fd())
}

/// Detach protocol: removes the queue entry, decrements the shared
/// refcount under the cross-process lock, and unpins the link when the
/// count reaches zero. Best effort; failures are logged.
pub(crate) fn release(handles: ProgHandles, queue_id: u32) {
    let ProgHandles {
        prog,
        prog_id,
        xsks_map,
        refcnt_map,
    } = handles;

    let rc = unsafe {
        libbpf_sys::bpf_map_delete_elem(
            xsks_map.as_raw_fd(),
            &queue_id as *const _ as *const libc::c_void,
        )
    };
    if rc < 0 && rc != -libc::ENOENT {
        log::warn!(
            "failed to remove queue {queue_id} from socket map: {}",
            io::Error::from_raw_os_error(-rc)
        );
    }

    if let Some((refcnt_map, value_size)) = refcnt_map {
        match lock::acquire() {
            Ok(_lock) => match update_refcnt_locked(refcnt_map.as_raw_fd(), value_size, -1) {
                Ok(0) => unpin_link(prog_id),
                Ok(_) => {}
                Err(err) => log::warn!("failed to update program refcount: {err}"),
            },
            Err(err) => log::warn!("could not lock for program release: {err}"),
        }
    }
    // The program handle goes last; the pinned link, while it exists,
    // keeps the attachment alive regardless.
    drop(prog);
}

/// Core attach-or-join; the cross-process lock must be held.
fn setup_prog(
    ifindex: u32,
    ifname: &str,
    xdp_flags: u32,
) -> Result<(ProgHandles, bool), XskError> {
    let mut current: Option<(OwnedFd, u32)> = None;
    let mut refcnt_map: Option<(OwnedFd, u32)> = None;
    let mut foreign_prog = false;

    let attached_id = attached_prog_id(ifindex)?;
    if attached_id != 0 {
        let prog_fd = prog_fd_by_id(attached_id)?;
        match lookup_map(prog_fd.as_raw_fd(), is_refcnt_map)? {
            Some((map_fd, info)) => {
                let refcnt = update_refcnt_locked(map_fd.as_raw_fd(), info.value_size, 1)?;
                if refcnt == 0 {
                    // The program is awaiting detach; drop its pin and
                    // attach a fresh one.
                    unpin_link(attached_id);
                } else {
                    refcnt_map = Some((map_fd, info.value_size));
                    current = Some((prog_fd, attached_id));
                }
            }
            None => {
                // A program without a refcount section; use its socket
                // map if it has one, without joining any refcounting.
                foreign_prog = true;
                current = Some((prog_fd, attached_id));
            }
        }
    }

    let mut attached_now = false;
    let (prog_fd, prog_id) = match current {
        Some(found) => found,
        None => {
            let fresh = attach_default_prog(ifindex, ifname, xdp_flags)?;
            attached_now = true;
            fresh
        }
    };

    if refcnt_map.is_none() && !foreign_prog {
        match lookup_map(prog_fd.as_raw_fd(), is_refcnt_map) {
            Ok(Some((map_fd, info))) => refcnt_map = Some((map_fd, info.value_size)),
            Ok(None) => {
                if attached_now {
                    unpin_link(prog_id);
                }
                return Err(XskError::NotFound("refcount map".into()));
            }
            Err(err) => {
                if attached_now {
                    unpin_link(prog_id);
                }
                return Err(err);
            }
        }
    }

    let xsks_map = match lookup_map(prog_fd.as_raw_fd(), is_socket_map) {
        Ok(Some((map_fd, _))) => map_fd,
        Ok(None) => {
            if attached_now {
                unpin_link(prog_id);
            }
            return Err(XskError::NotFound("socket map".into()));
        }
        Err(err) => {
            if attached_now {
                unpin_link(prog_id);
            }
            return Err(err);
        }
    };

    Ok((
        ProgHandles {
            prog: prog_fd,
            prog_id,
            xsks_map,
            refcnt_map,
        },
        attached_now,
    ))
}

/// Loads the embedded object, patches the socket map size, attaches the
/// program to `ifindex` via a BPF link and pins the link.
fn attach_default_prog(
    ifindex: u32,
    ifname: &str,
    xdp_flags: u32,
) -> Result<(OwnedFd, u32), XskError> {
    struct ObjGuard(*mut libbpf_sys::bpf_object);
    impl Drop for ObjGuard {
        fn drop(&mut self) {
            if !self.0.is_null() {
                unsafe { libbpf_sys::bpf_object__close(self.0) };
            }
        }
    }

    let channels = eth_channels(ifname)?;

    let prog_fd;
    unsafe {
        let mut opts: libbpf_sys::bpf_object_open_opts = std::mem::zeroed();
        opts.sz = size_of::<libbpf_sys::bpf_object_open_opts>() as libbpf_sys::size_t;
        let obj = libbpf_sys::bpf_object__open_mem(
            DEFAULT_PROG_OBJ.as_ptr() as *const libc::c_void,
            DEFAULT_PROG_OBJ.len() as libbpf_sys::size_t,
            &opts,
        );
        if obj.is_null() {
            return Err(XskError::last_os("open embedded BPF object"));
        }
        let _guard = ObjGuard(obj);

        let map_name = CString::new(SOCKET_MAP_NAME).unwrap();
        let map = libbpf_sys::bpf_object__find_map_by_name(obj, map_name.as_ptr());
        if map.is_null() {
            return Err(XskError::NotFound("socket map in embedded object".into()));
        }
        let rc = libbpf_sys::bpf_map__set_max_entries(map, channels.max_rx);
        if rc < 0 {
            return Err(XskError::os(
                "resize socket map",
                io::Error::from_raw_os_error(-rc),
            ));
        }

        let rc = libbpf_sys::bpf_object__load(obj);
        if rc < 0 {
            return Err(XskError::os(
                "load embedded BPF object",
                io::Error::from_raw_os_error(-rc),
            ));
        }

        let prog_name = CString::new(PROG_NAME).unwrap();
        let prog = libbpf_sys::bpf_object__find_program_by_name(obj, prog_name.as_ptr());
        if prog.is_null() {
            return Err(XskError::NotFound("program in embedded object".into()));
        }
        // Outlive the object guard.
        prog_fd = dup_cloexec(libbpf_sys::bpf_program__fd(prog))?;
    }

    let prog_id = prog_id_of(prog_fd.as_raw_fd())?;

    let link_fd = unsafe {
        let mut opts: libbpf_sys::bpf_link_create_opts = std::mem::zeroed();
        opts.sz = size_of::<libbpf_sys::bpf_link_create_opts>() as libbpf_sys::size_t;
        opts.flags = xdp_flags;
        libbpf_sys::bpf_link_create(
            prog_fd.as_raw_fd(),
            ifindex as libc::c_int,
            libbpf_sys::BPF_XDP,
            &opts,
        )
    };
    if link_fd < 0 {
        return Err(XskError::os(
            "attach XDP link",
            io::Error::from_raw_os_error(-link_fd),
        ));
    }
    let link = unsafe { OwnedFd::from_raw_fd(link_fd) };

    let pin = lock::pin_path(prog_id)?;
    let pin_c = CString::new(pin.as_os_str().as_encoded_bytes())
        .map_err(|_| XskError::Invalid("pin path contains NUL"))?;
    let rc = unsafe { libbpf_sys::bpf_obj_pin(link.as_raw_fd(), pin_c.as_ptr()) };
    if rc < 0 {
        // The link drops here, which detaches the program again.
        return Err(XskError::os(
            "pin XDP link",
            io::Error::from_raw_os_error(-rc),
        ));
    }
    // The pinned file keeps the attachment alive beyond this descriptor.
    drop(link);

    Ok((prog_fd, prog_id))
}

/// Removes the pinned link of program `prog_id`, detaching it once the
/// last reference is gone. Best effort.
fn unpin_link(prog_id: u32) {
    let path = match lock::pin_path(prog_id) {
        Ok(path) => path,
        Err(err) => {
            log::warn!("no pin directory for program {prog_id}: {err}");
            return;
        }
    };
    let link = CString::new(path.as_os_str().as_encoded_bytes())
        .ok()
        .map(|c| unsafe { libbpf_sys::bpf_obj_get(c.as_ptr()) })
        .filter(|fd| *fd >= 0)
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
    if link.is_none() {
        log::warn!("no pinned link found at {}", path.display());
    }
    if let Err(err) = std::fs::remove_file(&path) {
        if err.kind() != io::ErrorKind::NotFound {
            log::warn!("failed to unpin {}: {err}", path.display());
        }
    }
    // Dropping the handle releases the last reference and detaches.
}

/// Mutates the shared program refcount. Key is always 0; the counter
/// occupies the first four little-endian bytes of the value, whose size
/// may exceed four. A stored value of zero is left untouched ("detach in
/// progress"). The caller must hold the cross-process lock.
fn update_refcnt_locked(map_fd: RawFd, value_size: u32, delta: i32) -> Result<i32, XskError> {
    let key: u32 = 0;
    let mut value = vec![0u8; (value_size as usize).max(size_of::<u32>())];
    let rc = unsafe {
        libbpf_sys::bpf_map_lookup_elem(
            map_fd,
            &key as *const _ as *const libc::c_void,
            value.as_mut_ptr() as *mut libc::c_void,
        )
    };
    if rc < 0 {
        return Err(XskError::os(
            "lookup refcount map",
            io::Error::from_raw_os_error(-rc),
        ));
    }

    let mut refcnt = read_refcnt(&value) as i32;
    if refcnt != 0 {
        refcnt += delta;
        write_refcnt(&mut value, refcnt as u32);
        let rc = unsafe {
            libbpf_sys::bpf_map_update_elem(
                map_fd,
                &key as *const _ as *const libc::c_void,
                value.as_ptr() as *const libc::c_void,
                libbpf_sys::BPF_ANY as u64,
            )
        };
        if rc < 0 {
            return Err(XskError::os(
                "update refcount map",
                io::Error::from_raw_os_error(-rc),
            ));
        }
    }
    Ok(refcnt)
}

fn read_refcnt(value: &[u8]) -> u32 {
    u32::from_le_bytes([value[0], value[1], value[2], value[3]])
}

fn write_refcnt(value: &mut [u8], refcnt: u32) {
    value[..size_of::<u32>()].copy_from_slice(&refcnt.to_le_bytes());
}

/// Id of the XDP program currently attached to `ifindex`, 0 when none.
fn attached_prog_id(ifindex: u32) -> Result<u32, XskError> {
    let mut prog_id: u32 = 0;
    let rc =
        unsafe { libbpf_sys::bpf_xdp_query_id(ifindex as libc::c_int, 0, &mut prog_id) };
    if rc < 0 {
        return Err(XskError::os(
            "query attached XDP program",
            io::Error::from_raw_os_error(-rc),
        ));
    }
    Ok(prog_id)
}

fn prog_fd_by_id(prog_id: u32) -> Result<OwnedFd, XskError> {
    let fd = unsafe { libbpf_sys::bpf_prog_get_fd_by_id(prog_id) };
    if fd < 0 {
        return Err(XskError::os(
            "open program by id",
            io::Error::from_raw_os_error(-fd),
        ));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn prog_id_of(prog_fd: RawFd) -> Result<u32, XskError> {
    let mut info: libbpf_sys::bpf_prog_info = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libbpf_sys::bpf_prog_info>() as u32;
    let rc = unsafe {
        libbpf_sys::bpf_obj_get_info_by_fd(
            prog_fd,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(XskError::os(
            "program info",
            io::Error::from_raw_os_error(-rc),
        ));
    }
    Ok(info.id)
}

/// Map ids referenced by a program, via the two-call info protocol.
fn prog_map_ids(prog_fd: RawFd) -> Result<Vec<u32>, XskError> {
    let mut info: libbpf_sys::bpf_prog_info = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libbpf_sys::bpf_prog_info>() as u32;
    let rc = unsafe {
        libbpf_sys::bpf_obj_get_info_by_fd(
            prog_fd,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(XskError::os(
            "program info",
            io::Error::from_raw_os_error(-rc),
        ));
    }
    let nr = info.nr_map_ids;
    if nr == 0 {
        return Ok(Vec::new());
    }

    let mut ids = vec![0u32; nr as usize];
    let mut info: libbpf_sys::bpf_prog_info = unsafe { std::mem::zeroed() };
    info.nr_map_ids = nr;
    info.map_ids = ids.as_mut_ptr() as u64;
    let mut len = size_of::<libbpf_sys::bpf_prog_info>() as u32;
    let rc = unsafe {
        libbpf_sys::bpf_obj_get_info_by_fd(
            prog_fd,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(XskError::os(
            "program map ids",
            io::Error::from_raw_os_error(-rc),
        ));
    }
    ids.truncate(info.nr_map_ids as usize);
    Ok(ids)
}

fn map_info(map_fd: RawFd) -> Result<libbpf_sys::bpf_map_info, XskError> {
    let mut info: libbpf_sys::bpf_map_info = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libbpf_sys::bpf_map_info>() as u32;
    let rc = unsafe {
        libbpf_sys::bpf_obj_get_info_by_fd(
            map_fd,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(XskError::os("map info", io::Error::from_raw_os_error(-rc)));
    }
    Ok(info)
}

fn map_name(info: &libbpf_sys::bpf_map_info) -> String {
    info.name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8 as char)
        .collect()
}

fn is_refcnt_map(info: &libbpf_sys::bpf_map_info) -> bool {
    map_name(info).starts_with(REFCNT_SECTION_PREFIX)
        && info.value_size >= size_of::<u32>() as u32
}

fn is_socket_map(info: &libbpf_sys::bpf_map_info) -> bool {
    map_name(info).starts_with(SOCKET_MAP_NAME) && info.key_size == 4 && info.value_size == 4
}

/// Scans the program's maps for one accepted by `filter`; returns the map
/// fd and its info. Maps that vanish mid-scan are skipped.
fn lookup_map(
    prog_fd: RawFd,
    filter: fn(&libbpf_sys::bpf_map_info) -> bool,
) -> Result<Option<(OwnedFd, libbpf_sys::bpf_map_info)>, XskError> {
    for id in prog_map_ids(prog_fd)? {
        let fd = unsafe { libbpf_sys::bpf_map_get_fd_by_id(id) };
        if fd < 0 {
            continue;
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let info = match map_info(fd.as_raw_fd()) {
            Ok(info) => info,
            Err(_) => continue,
        };
        if filter(&info) {
            return Ok(Some((fd, info)));
        }
    }
    Ok(None)
}

fn dup_cloexec(fd: RawFd) -> Result<OwnedFd, XskError> {
    let new = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if new < 0 {
        return Err(XskError::last_os("dup descriptor"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(name: &str, key_size: u32, value_size: u32) -> libbpf_sys::bpf_map_info {
        let mut info: libbpf_sys::bpf_map_info = unsafe { std::mem::zeroed() };
        for (dst, src) in info.name.iter_mut().zip(name.bytes()) {
            *dst = src as _;
        }
        info.key_size = key_size;
        info.value_size = value_size;
        info
    }

    #[test]
    fn refcnt_map_is_matched_by_section_prefix_and_value_size() {
        assert!(is_refcnt_map(&info_with(".data", 4, 4)));
        assert!(is_refcnt_map(&info_with(".data.something", 4, 16)));
        assert!(!is_refcnt_map(&info_with(".data", 4, 2)));
        assert!(!is_refcnt_map(&info_with("xsks_map", 4, 4)));
    }

    #[test]
    fn socket_map_is_matched_by_name_and_element_sizes() {
        assert!(is_socket_map(&info_with("xsks_map", 4, 4)));
        assert!(!is_socket_map(&info_with("xsks_map", 4, 8)));
        assert!(!is_socket_map(&info_with(".data", 4, 4)));
    }

    #[test]
    fn refcnt_value_roundtrip_tolerates_larger_values() {
        let mut value = vec![0u8; 16];
        write_refcnt(&mut value, 3);
        assert_eq!(read_refcnt(&value), 3);
        assert_eq!(&value[4..], &[0u8; 12]);

        // Little-endian layout of the first four bytes.
        let value = [2, 1, 0, 0, 0xaa, 0xbb];
        assert_eq!(read_refcnt(&value), 0x102);
    }
}
