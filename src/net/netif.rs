//! Host interface queries: interface index and Ethernet MAC lookup.
//!
//! Discovery responses carry the MAC of the first non-loopback Ethernet
//! interface. The lookup walks `getifaddrs(3)`; the server caches the
//! result and refreshes it at most once per second.

use core::ffi::CStr;

/// Resolve an interface name to its index, for `IPV6_MULTICAST_IF`.
pub fn interface_index(name: &str) -> Option<u32> {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= buf.len() {
        return None;
    }
    buf[..bytes.len()].copy_from_slice(bytes);

    // SAFETY: `buf` is NUL terminated by construction.
    let index = unsafe { libc::if_nametoindex(buf.as_ptr() as *const libc::c_char) };
    if index == 0 {
        None
    } else {
        Some(index)
    }
}

/// MAC address of the first non-loopback Ethernet interface, if any.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn first_ether_mac() -> Option<[u8; 6]> {
    let mut ifap: *mut libc::ifaddrs = core::ptr::null_mut();

    // SAFETY: getifaddrs fills `ifap` with a list we free below.
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return None;
    }

    let mut mac = None;
    let mut cur = ifap;
    while !cur.is_null() {
        // SAFETY: `cur` walks the list getifaddrs returned; entries stay
        // alive until freeifaddrs.
        let entry = unsafe { &*cur };
        cur = entry.ifa_next;

        if entry.ifa_flags & libc::IFF_LOOPBACK as libc::c_uint != 0 {
            continue;
        }
        if entry.ifa_addr.is_null() {
            continue;
        }
        // SAFETY: ifa_addr is valid for this entry; family is checked
        // before reinterpreting as sockaddr_ll.
        let family = unsafe { (*entry.ifa_addr).sa_family };
        if family != libc::AF_PACKET as libc::sa_family_t {
            continue;
        }
        // SAFETY: AF_PACKET addresses are sockaddr_ll.
        let ll = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_ll) };
        if ll.sll_hatype != libc::ARPHRD_ETHER || ll.sll_halen != 6 {
            continue;
        }

        let mut out = [0u8; 6];
        out.copy_from_slice(&ll.sll_addr[..6]);
        mac = Some(out);
        break;
    }

    // SAFETY: `ifap` came from getifaddrs and is freed exactly once.
    unsafe { libc::freeifaddrs(ifap) };
    mac
}

/// MAC lookup is unsupported on this platform.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn first_ether_mac() -> Option<[u8; 6]> {
    None
}

/// Interface name helper used in diagnostics.
#[allow(dead_code)]
pub(crate) fn index_to_name(index: u32, buf: &mut [u8; libc::IF_NAMESIZE]) -> Option<&str> {
    // SAFETY: `buf` has IF_NAMESIZE bytes as if_indextoname requires.
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr() as *mut libc::c_char) };
    if ret.is_null() {
        return None;
    }
    // SAFETY: on success the buffer holds a NUL-terminated name.
    unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) }
        .to_str()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_index() {
        // Every Linux host has "lo"; other platforms may differ, so only
        // assert the negative case portably.
        assert!(interface_index("").is_none());
        assert!(interface_index("definitely-not-an-interface-name").is_none());
        #[cfg(target_os = "linux")]
        assert!(interface_index("lo").is_some());
    }

    #[test]
    fn test_first_ether_mac_shape() {
        // No assertion on presence (CI hosts vary); only that a returned
        // MAC is not the broadcast address.
        if let Some(mac) = first_ether_mac() {
            assert_ne!(mac, [0xFF; 6]);
        }
    }
}
