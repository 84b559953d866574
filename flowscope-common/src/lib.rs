//! Shared flow-key types between dataplane readers and the collector
//!
//! This crate defines the flow identity that must be:
//! - `#[repr(C)]` for a stable layout that readers can use as a map key
//! - `no_std` compatible when the `userspace` feature is disabled
//! - Shared between the event sources and the flow table

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Flow identity: addresses, protocol and ports
///
/// Layout (40 bytes total, 2-byte aligned):
/// - src: Source address, 16 bytes (IPv4 stored IPv4-mapped, `::ffff:a.b.c.d`)
/// - dst: Destination address, 16 bytes
/// - src_port: Source L4 port (host byte order, 0 for portless protocols)
/// - dst_port: Destination L4 port (host byte order)
/// - proto: IP protocol number (6=TCP, 17=UDP, 1=ICMP)
/// - _padding: Always zero so that byte-wise hashing is stable
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq, Hash, PartialOrd, Ord))]
pub struct Tuple {
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub _padding: [u8; 3],
}

impl Tuple {
    pub const fn new(src: [u8; 16], dst: [u8; 16], proto: u8, src_port: u16, dst_port: u16) -> Self {
        Self {
            src,
            dst,
            src_port,
            dst_port,
            proto,
            _padding: [0; 3],
        }
    }

    /// The same connection seen from the other side.
    ///
    /// This swaps source and destination; it is not the conntrack reply tuple,
    /// which would also reflect any NAT.
    pub const fn reverse(&self) -> Self {
        Self::new(self.dst, self.src, self.proto, self.dst_port, self.src_port)
    }

    /// Copy of this tuple with a different destination address and port.
    pub const fn with_destination(&self, dst: [u8; 16], dst_port: u16) -> Self {
        Self::new(self.src, dst, self.proto, self.src_port, dst_port)
    }
}

/// Traffic direction constants, as seen from the local endpoint
pub mod direction {
    pub const INGRESS: u8 = 0;
    pub const EGRESS: u8 = 1;
}

/// IP protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const SCTP: u8 = 132;
    pub const ICMPV6: u8 = 58;
}

/// Format protocol number to string
pub fn format_protocol(proto: u8) -> &'static str {
    match proto {
        protocol::ICMP => "icmp",
        protocol::TCP => "tcp",
        protocol::UDP => "udp",
        protocol::SCTP => "sctp",
        protocol::ICMPV6 => "icmp6",
        _ => "other",
    }
}

#[cfg(feature = "userspace")]
mod addr {
    use super::Tuple;
    use std::fmt;
    use std::net::{IpAddr, Ipv6Addr};

    /// Convert an address to its 16-byte form. IPv4 addresses are IPv4-mapped.
    pub fn to_16_bytes(ip: IpAddr) -> [u8; 16] {
        match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    /// Convert a 16-byte address back, unmapping IPv4-mapped addresses.
    pub fn from_16_bytes(bytes: [u8; 16]) -> IpAddr {
        let v6 = Ipv6Addr::from(bytes);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    /// Parse a textual address into its 16-byte form.
    pub fn parse_16_bytes(s: &str) -> Option<[u8; 16]> {
        s.trim().parse::<IpAddr>().ok().map(to_16_bytes)
    }

    /// RFC1918 / unique-local addresses, used to classify unknown endpoints.
    pub fn is_private(bytes: [u8; 16]) -> bool {
        match from_16_bytes(bytes) {
            IpAddr::V4(v4) => v4.is_private(),
            IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
        }
    }

    impl Tuple {
        pub fn from_ips(src: IpAddr, dst: IpAddr, proto: u8, src_port: u16, dst_port: u16) -> Self {
            Tuple::new(to_16_bytes(src), to_16_bytes(dst), proto, src_port, dst_port)
        }

        pub fn src_ip(&self) -> IpAddr {
            from_16_bytes(self.src)
        }

        pub fn dst_ip(&self) -> IpAddr {
            from_16_bytes(self.dst)
        }
    }

    impl fmt::Display for Tuple {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "src={} dst={} proto={} sport={} dport={}",
                self.src_ip(),
                self.dst_ip(),
                self.proto,
                self.src_port,
                self.dst_port
            )
        }
    }
}

#[cfg(feature = "userspace")]
pub use addr::{from_16_bytes, is_private, parse_16_bytes, to_16_bytes};

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<Tuple>() == 40,
        "Tuple must be exactly 40 bytes"
    );
    assert!(
        core::mem::align_of::<Tuple>() == 2,
        "Tuple must be 2-byte aligned"
    );
};

#[cfg(all(test, feature = "userspace"))]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_reverse_swaps_endpoints() {
        let t = Tuple::from_ips(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(20, 0, 0, 1)),
            protocol::TCP,
            54123,
            80,
        );
        let r = t.reverse();

        assert_eq!(r.src, t.dst);
        assert_eq!(r.dst, t.src);
        assert_eq!(r.src_port, 80);
        assert_eq!(r.dst_port, 54123);
        assert_eq!(r.reverse(), t);
    }

    #[test]
    fn test_ipv4_round_trips_through_mapped_form() {
        let bytes = parse_16_bytes("192.168.1.7").expect("Should parse");
        assert_eq!(from_16_bytes(bytes), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)));
        assert!(is_private(bytes));
        assert!(!is_private(parse_16_bytes("8.8.8.8").expect("Should parse")));
        assert!(parse_16_bytes("not-an-ip").is_none());
    }

    #[test]
    fn test_display() {
        let t = Tuple::from_ips(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(20, 0, 0, 1)),
            protocol::UDP,
            5000,
            53,
        );
        assert_eq!(
            t.to_string(),
            "src=10.0.0.1 dst=20.0.0.1 proto=17 sport=5000 dport=53"
        );
        assert_eq!(format_protocol(t.proto), "udp");
    }
}
