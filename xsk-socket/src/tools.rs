//! Small helpers shared across the crate: page-alignment checks, the
//! ethtool channel query used to size the redirect program's socket map,
//! and a hex dump formatter.

use crate::error::XskError;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Reports whether `ptr` is aligned to the system page size.
pub fn page_aligned(ptr: *const libc::c_void) -> bool {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    (ptr as usize) & (page_size - 1) == 0
}

const ETHTOOL_GCHANNELS: u32 = 0x0000003c;

/// Channel counts of a network interface as reported by
/// `ETHTOOL_GCHANNELS`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EthChannels {
    cmd: u32,
    pub max_rx: u32,
    pub max_tx: u32,
    pub max_other: u32,
    pub max_combined: u32,
    pub rx_count: u32,
    pub tx_count: u32,
    pub other_count: u32,
    pub combined_count: u32,
}

#[repr(C)]
struct IfreqEthtool {
    name: [u8; libc::IFNAMSIZ],
    data: *mut libc::c_void,
    // struct ifreq is 40 bytes; the kernel copies all of it.
    pad: [u8; 16],
}

/// Queries the rx/tx/combined channel counts of `ifname` via
/// `SIOCETHTOOL`.
pub fn eth_channels(ifname: &str) -> Result<EthChannels, XskError> {
    if ifname.len() >= libc::IFNAMSIZ {
        return Err(XskError::Invalid("interface name too long"));
    }
    let mut channels = EthChannels {
        cmd: ETHTOOL_GCHANNELS,
        ..Default::default()
    };
    let mut ifr = IfreqEthtool {
        name: [0; libc::IFNAMSIZ],
        data: &mut channels as *mut _ as *mut libc::c_void,
        pad: [0; 16],
    };
    ifr.name[..ifname.len()].copy_from_slice(ifname.as_bytes());

    let fd = unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(XskError::last_os("socket AF_INET"));
        }
        OwnedFd::from_raw_fd(fd)
    };
    unsafe {
        if libc::ioctl(fd.as_raw_fd(), libc::SIOCETHTOOL, &mut ifr) < 0 {
            return Err(XskError::last_os("ioctl SIOCETHTOOL"));
        }
    }
    Ok(channels)
}

/// Formats `data` as canonical 16-byte hex dump lines.
///
/// Each line carries the hex bytes, padding for short lines, and the
/// printable-ASCII rendering with dots for everything else.
pub fn hex_dump(data: &[u8]) -> String {
    const BYTES_PER_LINE: usize = 16;
    let mut out = String::with_capacity(data.len() * 4);
    for chunk in data.chunks(BYTES_PER_LINE) {
        for b in chunk {
            out.push_str(&format!("{b:02X} "));
        }
        for _ in chunk.len()..BYTES_PER_LINE {
            out.push_str("   ");
        }
        out.push_str(" | ");
        for &b in chunk {
            if (0x20..0x7f).contains(&b) {
                out.push(b as char);
            } else {
                out.push('.');
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment() {
        assert!(page_aligned(std::ptr::null()));
        assert!(!page_aligned(1 as *const libc::c_void));
        let map = crate::mmap::OwnedMmap::anon(64).unwrap();
        assert!(page_aligned(map.as_void_ptr()));
        assert!(!page_aligned(unsafe { map.as_u8_ptr().add(8) } as *const _));
    }

    #[test]
    fn hex_dump_short_line() {
        let out = hex_dump(b"Hello, World!");
        assert_eq!(
            out,
            "48 65 6C 6C 6F 2C 20 57 6F 72 6C 64 21           | Hello, World!\n"
        );
    }

    #[test]
    fn hex_dump_full_lines_and_nonprintable() {
        let mut data = Vec::new();
        data.extend_from_slice(b"0123456789abcdef");
        data.push(0x00);
        data.push(0x7f);
        let out = hex_dump(&data);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "30 31 32 33 34 35 36 37 38 39 61 62 63 64 65 66  | 0123456789abcdef"
        );
        assert_eq!(
            lines[1],
            "00 7F                                            | .."
        );
    }

    #[test]
    fn ifreq_layout_matches_kernel_expectation() {
        assert_eq!(std::mem::size_of::<IfreqEthtool>(), 40);
        assert_eq!(std::mem::size_of::<EthChannels>(), 9 * std::mem::size_of::<u32>());
    }

    #[test]
    fn long_interface_name_is_rejected() {
        let err = eth_channels("an-interface-name-way-too-long").unwrap_err();
        assert!(matches!(err, XskError::Invalid(_)));
    }
}
