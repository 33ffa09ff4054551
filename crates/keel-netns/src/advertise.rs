//! Unsolicited address advertisement.
//!
//! After an interface comes up with pre-allocated addresses, peers may
//! still hold stale neighbor entries from a previous container. A burst
//! of gratuitous ARP (IPv4) and unsolicited Neighbor Advertisements
//! (IPv6) flushes them. The burst is cancellable: removing the interface
//! closes its stop channel and the sender exits at the next tick.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use keel_common::{KeelError, KeelResult};

const MIN_INTERVAL: Duration = Duration::from_millis(100);
const MAX_INTERVAL: Duration = Duration::from_secs(2);
const MAX_MESSAGES: u8 = 3;

/// How many advertisements to send and how far apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertiseSettings {
    /// Number of messages; 0 disables advertisement.
    pub messages: u8,
    /// Gap between messages.
    pub interval: Duration,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            messages: 3,
            interval: Duration::from_secs(1),
        }
    }
}

impl AdvertiseSettings {
    /// Bound the settings to 0..=3 messages at 100 ms..=2 s.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            messages: self.messages.min(MAX_MESSAGES),
            interval: self.interval.clamp(MIN_INTERVAL, MAX_INTERVAL),
        }
    }
}

/// A gratuitous ARP request: sender and target protocol address both set
/// to the announced address, target hardware address zeroed.
#[must_use]
pub fn arp_announcement(mac: [u8; 6], ip: Ipv4Addr) -> Vec<u8> {
    let mut packet = Vec::with_capacity(28);
    packet.extend_from_slice(&1u16.to_be_bytes()); // htype: ethernet
    packet.extend_from_slice(&0x0800u16.to_be_bytes()); // ptype: IPv4
    packet.push(6); // hlen
    packet.push(4); // plen
    packet.extend_from_slice(&1u16.to_be_bytes()); // oper: request
    packet.extend_from_slice(&mac);
    packet.extend_from_slice(&ip.octets());
    packet.extend_from_slice(&[0u8; 6]);
    packet.extend_from_slice(&ip.octets());
    packet
}

/// An unsolicited Neighbor Advertisement with the override flag and a
/// target link-layer address option. The checksum is left to the kernel
/// (raw ICMPv6 sockets fill it in).
#[must_use]
pub fn neighbor_advertisement(mac: [u8; 6], ip: Ipv6Addr) -> Vec<u8> {
    let mut packet = Vec::with_capacity(32);
    packet.push(136); // type: neighbor advertisement
    packet.push(0); // code
    packet.extend_from_slice(&[0, 0]); // checksum, kernel-filled
    packet.extend_from_slice(&0x2000_0000u32.to_be_bytes()); // override flag
    packet.extend_from_slice(&ip.octets());
    packet.push(2); // option: target link-layer address
    packet.push(1); // length in units of 8 octets
    packet.extend_from_slice(&mac);
    packet
}

/// Send advertisement bursts until the budget is spent or `stop` closes.
/// Runs on a thread already inside the target namespace.
pub fn advertise_loop(
    ifindex: u32,
    mac: [u8; 6],
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    settings: AdvertiseSettings,
    stop: &Receiver<()>,
) {
    let settings = settings.clamped();
    for round in 0..settings.messages {
        if let Some(ip) = ipv4 {
            if let Err(e) = send_arp(ifindex, &arp_announcement(mac, ip)) {
                tracing::warn!(error = %e, ifindex, %ip, "gratuitous arp");
            }
        }
        if let Some(ip) = ipv6 {
            if let Err(e) = send_na(ifindex, &neighbor_advertisement(mac, ip)) {
                tracing::warn!(error = %e, ifindex, %ip, "neighbor advertisement");
            }
        }
        if round + 1 == settings.messages {
            break;
        }
        match stop.recv_timeout(settings.interval) {
            Err(RecvTimeoutError::Timeout) => {}
            // A message or a closed channel both mean the interface is
            // being removed.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

struct RawFdGuard(i32);

impl Drop for RawFdGuard {
    fn drop(&mut self) {
        // SAFETY: the fd was returned by socket() and is owned here.
        #[allow(unsafe_code)]
        unsafe {
            libc::close(self.0);
        }
    }
}

fn last_os_error(context: &str) -> KeelError {
    KeelError::internal(format!("{context}: {}", io::Error::last_os_error()))
}

/// Broadcast an ARP payload on `ifindex` via an `AF_PACKET` socket.
fn send_arp(ifindex: u32, packet: &[u8]) -> KeelResult<()> {
    const ETH_P_ARP: u16 = 0x0806;

    // SAFETY: plain socket creation, no pointers involved.
    #[allow(unsafe_code)]
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_DGRAM,
            i32::from(ETH_P_ARP.to_be()),
        )
    };
    if fd < 0 {
        return Err(last_os_error("arp socket"));
    }
    let fd = RawFdGuard(fd);

    // SAFETY: sockaddr_ll is plain-old-data; zeroing it is a valid state.
    #[allow(unsafe_code)]
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = ETH_P_ARP.to_be();
    addr.sll_ifindex = ifindex as i32;
    addr.sll_halen = 6;
    addr.sll_addr[..6].copy_from_slice(&[0xff; 6]);

    // SAFETY: packet and addr outlive the call; lengths are exact.
    #[allow(unsafe_code)]
    let sent = unsafe {
        libc::sendto(
            fd.0,
            packet.as_ptr().cast(),
            packet.len(),
            0,
            std::ptr::addr_of!(addr).cast(),
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(last_os_error("arp send"));
    }
    Ok(())
}

/// Send an ICMPv6 payload to the all-nodes multicast group on `ifindex`.
fn send_na(ifindex: u32, packet: &[u8]) -> KeelResult<()> {
    // SAFETY: plain socket creation, no pointers involved.
    #[allow(unsafe_code)]
    let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_RAW, libc::IPPROTO_ICMPV6) };
    if fd < 0 {
        return Err(last_os_error("icmpv6 socket"));
    }
    let fd = RawFdGuard(fd);

    // NA hop limit must be 255 or receivers discard it.
    let hops: libc::c_int = 255;
    // SAFETY: the option value points at a live c_int of the given size.
    #[allow(unsafe_code)]
    let rc = unsafe {
        libc::setsockopt(
            fd.0,
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_HOPS,
            std::ptr::addr_of!(hops).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(last_os_error("icmpv6 hop limit"));
    }

    let all_nodes = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
    // SAFETY: sockaddr_in6 is plain-old-data; zeroing it is a valid state.
    #[allow(unsafe_code)]
    let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    addr.sin6_addr.s6_addr = all_nodes.octets();
    addr.sin6_scope_id = ifindex;

    // SAFETY: packet and addr outlive the call; lengths are exact.
    #[allow(unsafe_code)]
    let sent = unsafe {
        libc::sendto(
            fd.0,
            packet.as_ptr().cast(),
            packet.len(),
            0,
            std::ptr::addr_of!(addr).cast(),
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(last_os_error("icmpv6 send"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::time::Instant;

    const MAC: [u8; 6] = [0x02, 0x42, 0xac, 0x11, 0x00, 0x02];

    #[test]
    fn arp_announcement_layout() {
        let ip: Ipv4Addr = "172.17.0.2".parse().unwrap();
        let packet = arp_announcement(MAC, ip);

        assert_eq!(packet.len(), 28);
        assert_eq!(&packet[..2], &[0, 1]); // ethernet
        assert_eq!(&packet[2..4], &[0x08, 0x00]); // IPv4
        assert_eq!(&packet[6..8], &[0, 1]); // request
        assert_eq!(&packet[8..14], &MAC); // sender hw
        assert_eq!(&packet[14..18], &ip.octets()); // sender ip
        assert_eq!(&packet[18..24], &[0; 6]); // target hw
        assert_eq!(&packet[24..28], &ip.octets()); // target ip
    }

    #[test]
    fn neighbor_advertisement_layout() {
        let ip: Ipv6Addr = "fd00::2".parse().unwrap();
        let packet = neighbor_advertisement(MAC, ip);

        assert_eq!(packet.len(), 32);
        assert_eq!(packet[0], 136);
        assert_eq!(&packet[4..8], &[0x20, 0, 0, 0]); // override only
        assert_eq!(&packet[8..24], &ip.octets());
        assert_eq!(&packet[24..26], &[2, 1]); // tll option header
        assert_eq!(&packet[26..32], &MAC);
    }

    #[test]
    fn settings_clamp_to_documented_bounds() {
        let clamped = AdvertiseSettings {
            messages: 10,
            interval: Duration::from_secs(30),
        }
        .clamped();
        assert_eq!(clamped.messages, 3);
        assert_eq!(clamped.interval, Duration::from_secs(2));

        let clamped = AdvertiseSettings {
            messages: 0,
            interval: Duration::from_millis(1),
        }
        .clamped();
        assert_eq!(clamped.messages, 0);
        assert_eq!(clamped.interval, Duration::from_millis(100));
    }

    #[test]
    fn loop_exits_when_stop_channel_closes() {
        let (tx, rx) = bounded::<()>(0);
        let started = Instant::now();
        let handle = std::thread::spawn(move || {
            // No addresses: nothing is sent, the loop just waits out the
            // intervals unless cancelled.
            advertise_loop(
                1,
                MAC,
                None,
                None,
                AdvertiseSettings {
                    messages: 3,
                    interval: Duration::from_secs(2),
                },
                &rx,
            );
        });
        drop(tx);
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
