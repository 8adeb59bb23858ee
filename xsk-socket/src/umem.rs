//! Umem registration and the fill/completion ring pair.
//!
//! A umem is a caller-provided, page-aligned region carved into fixed-size
//! frames and registered with the kernel through an AF_XDP socket. The
//! rings created here are stashed on the umem so the first socket bound to
//! it can adopt them; the umem itself is reference-counted by the sockets
//! that share it.

use crate::error::XskError;
use crate::ring::{self, RingCons, RingProd, RingType};
use crate::socket::Ctx;
use crate::tools::page_aligned;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Configuration of a umem: ring sizes, frame geometry and registration
/// flags.
#[derive(Debug, Clone, Copy)]
pub struct UmemConfig {
    pub fill_size: u32,
    pub comp_size: u32,
    pub frame_size: u32,
    pub frame_headroom: u32,
    pub flags: u32,
}

impl Default for UmemConfig {
    fn default() -> Self {
        UmemConfig {
            fill_size: ring::DEFAULT_PROD_NUM_DESCS,
            comp_size: ring::DEFAULT_CONS_NUM_DESCS,
            frame_size: ring::DEFAULT_FRAME_SIZE,
            frame_headroom: ring::DEFAULT_FRAME_HEADROOM,
            flags: ring::DEFAULT_UMEM_FLAGS,
        }
    }
}

/// A registered umem.
///
/// Holds the AF_XDP descriptor used for registration, the saved
/// fill/completion rings until the first socket adopts them, and the list
/// of per-queue contexts sharing this umem. All mutation happens on the
/// socket create/delete path; concurrent creates against the same umem
/// must be serialized by the caller.
pub struct Umem {
    pub(crate) fd: OwnedFd,
    pub(crate) area: *mut libc::c_void,
    pub(crate) area_len: u64,
    pub(crate) config: UmemConfig,
    pub(crate) refcount: u32,
    pub(crate) ctx_list: Vec<Ctx>,
    pub(crate) fill_save: Option<RingProd<u64>>,
    pub(crate) comp_save: Option<RingCons<u64>>,
    pub(crate) rx_ring_setup_done: bool,
    pub(crate) tx_ring_setup_done: bool,
}

// The frame area pointer is shared with the kernel; the handle itself is
// only ever driven from the owning thread.
unsafe impl Send for Umem {}

impl Umem {
    /// Registers `size` bytes at `area` as a umem and creates its
    /// fill/completion rings on a fresh AF_XDP socket.
    ///
    /// The rings stay stashed on the returned umem; the first socket
    /// created against it takes them over and returns their cursors to its
    /// caller.
    pub fn create(
        area: *mut libc::c_void,
        size: u64,
        config: Option<UmemConfig>,
    ) -> Result<Umem, XskError> {
        let fd = unsafe {
            let fd = libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0);
            if fd < 0 {
                return Err(XskError::last_os("socket AF_XDP"));
            }
            OwnedFd::from_raw_fd(fd)
        };
        Self::create_with_fd(fd, area, size, config)
    }

    /// Like [`Umem::create`], but registers the umem on a pre-supplied
    /// AF_XDP socket.
    pub fn create_with_fd(
        fd: OwnedFd,
        area: *mut libc::c_void,
        size: u64,
        config: Option<UmemConfig>,
    ) -> Result<Umem, XskError> {
        if area.is_null() {
            return Err(XskError::Invalid("umem area must not be null"));
        }
        if size == 0 && !page_aligned(area) {
            return Err(XskError::Invalid("unsized umem area must be page aligned"));
        }
        let config = config.unwrap_or_default();

        let reg = unsafe {
            libc::xdp_umem_reg {
                addr: area as u64,
                len: size,
                chunk_size: config.frame_size,
                headroom: config.frame_headroom,
                flags: config.flags,
                ..std::mem::zeroed()
            }
        };
        unsafe {
            if libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_XDP,
                libc::XDP_UMEM_REG,
                &reg as *const _ as *const libc::c_void,
                size_of::<libc::xdp_umem_reg>() as libc::socklen_t,
            ) < 0
            {
                return Err(XskError::last_os("setsockopt XDP_UMEM_REG"));
            }
        }

        // On failure the mappings created so far and the fd unwind through
        // their drop guards.
        let (fill, comp) = create_umem_rings(fd.as_raw_fd(), &config)?;

        Ok(Umem {
            fd,
            area,
            area_len: size,
            config,
            refcount: 0,
            ctx_list: Vec::new(),
            fill_save: Some(fill),
            comp_save: Some(comp),
            rx_ring_setup_done: false,
            tx_ring_setup_done: false,
        })
    }

    /// The AF_XDP descriptor the umem was registered on. The first socket
    /// bound to the umem rides this descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The registered frame area.
    pub fn area(&self) -> *mut libc::c_void {
        self.area
    }

    /// Length in bytes of the registered frame area.
    pub fn area_len(&self) -> u64 {
        self.area_len
    }

    pub fn config(&self) -> &UmemConfig {
        &self.config
    }

    /// Number of sockets currently referencing this umem.
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Releases the umem.
    ///
    /// Fails with [`XskError::Busy`] while any socket still references it,
    /// handing the umem back untouched. On success the saved rings are
    /// unmapped and the descriptor is closed.
    pub fn delete(self) -> Result<(), (Umem, XskError)> {
        if self.refcount > 0 {
            return Err((self, XskError::Busy));
        }
        Ok(())
    }
}

/// Sizes and maps the fill and completion rings on `fd`.
///
/// Used both at umem creation and when a second per-queue context on the
/// same umem needs a ring pair of its own.
pub(crate) fn create_umem_rings(
    fd: RawFd,
    config: &UmemConfig,
) -> Result<(RingProd<u64>, RingCons<u64>), XskError> {
    RingType::Fill.set_size(fd, config.fill_size)?;
    RingType::Completion.set_size(fd, config.comp_size)?;

    let offsets = ring::mmap_offsets(fd)?;

    let mut fill = RingProd::<u64>::map(fd, RingType::Fill, config.fill_size, &offsets)?;
    // Keep the cached consumer a full ring ahead of the shared counter so
    // the free count is a single subtraction.
    fill.cached_cons = config.fill_size;

    let comp = RingCons::<u64>::map(fd, RingType::Completion, config.comp_size, &offsets)?;
    Ok((fill, comp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn default_config_matches_ring_defaults() {
        let cfg = UmemConfig::default();
        assert_eq!(cfg.fill_size, 2048);
        assert_eq!(cfg.comp_size, 2048);
        assert_eq!(cfg.frame_size, 4096);
        assert_eq!(cfg.frame_headroom, 0);
        assert_eq!(cfg.flags, 0);
    }

    #[test]
    fn delete_fails_with_busy_while_referenced() {
        let fd = unsafe { OwnedFd::from_raw_fd(libc::dup(0)) };
        let umem = Umem {
            fd,
            area: 4096 as *mut libc::c_void,
            area_len: 0,
            config: UmemConfig::default(),
            refcount: 2,
            ctx_list: Vec::new(),
            fill_save: None,
            comp_save: None,
            rx_ring_setup_done: false,
            tx_ring_setup_done: false,
        };

        let (mut umem, err) = umem.delete().unwrap_err();
        assert!(matches!(err, XskError::Busy));

        umem.refcount = 0;
        assert!(umem.delete().is_ok());
    }

    #[test]
    fn null_area_is_rejected() {
        let fd = unsafe { OwnedFd::from_raw_fd(libc::dup(0)) };
        let err = Umem::create_with_fd(fd, ptr::null_mut(), 4096, None).unwrap_err();
        assert!(matches!(err, XskError::Invalid(_)));
    }

    #[test]
    fn unaligned_area_with_zero_size_is_rejected() {
        let fd = unsafe { OwnedFd::from_raw_fd(libc::dup(0)) };
        let page = crate::mmap::OwnedMmap::anon(4096).unwrap();
        let unaligned = unsafe { page.as_u8_ptr().add(1) } as *mut libc::c_void;
        let err = Umem::create_with_fd(fd, unaligned, 0, None).unwrap_err();
        assert!(matches!(err, XskError::Invalid(_)));
    }
}
