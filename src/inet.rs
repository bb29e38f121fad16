use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Address family of an [`InetAddress`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4
    V4,
    /// IPv6
    V6,
    /// Family of a default-constructed address.
    Unknown,
}

/// An immutable IPv4 or IPv6 address.
///
/// Sixteen bytes of storage with a family tag; for IPv4 only the first
/// four bytes are meaningful and the rest are zero. Ports are carried
/// separately wherever addresses are used.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddress {
    family: Family,
    addr: [u8; 16],
}

impl InetAddress {
    /// The wildcard ("any") address of the given family, all zero bytes.
    pub const fn any(family: Family) -> InetAddress {
        InetAddress {
            family,
            addr: [0; 16],
        }
    }

    /// The loopback address of the given family: `127.0.0.1` or `::1`.
    pub const fn loopback(family: Family) -> InetAddress {
        let mut addr = [0; 16];
        match family {
            Family::V4 => {
                addr[0] = 127;
                addr[3] = 1;
            }
            Family::V6 => addr[15] = 1,
            Family::Unknown => {}
        }
        InetAddress { family, addr }
    }

    /// Builds an address from raw network-order bytes.
    ///
    /// Reads 4 bytes for [`Family::V4`] and 16 for [`Family::V6`];
    /// remaining storage is zeroed. [`Family::Unknown`] yields the zero
    /// address.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than the family requires.
    pub fn from_bytes(family: Family, bytes: &[u8]) -> InetAddress {
        let mut addr = [0; 16];
        match family {
            Family::V4 => addr[..4].copy_from_slice(&bytes[..4]),
            Family::V6 => addr.copy_from_slice(&bytes[..16]),
            Family::Unknown => {}
        }
        InetAddress { family, addr }
    }

    /// Parses a textual IPv4 or IPv6 literal.
    pub fn from_string(text: &str) -> Option<InetAddress> {
        if let Ok(v6) = text.parse::<Ipv6Addr>() {
            return Some(InetAddress::from_bytes(Family::V6, &v6.octets()));
        }
        if let Ok(v4) = text.parse::<Ipv4Addr>() {
            return Some(InetAddress::from_bytes(Family::V4, &v4.octets()));
        }
        None
    }

    /// The address family.
    pub fn family(&self) -> Family {
        self.family
    }

    /// The raw address bytes in network order.
    pub fn bytes(&self) -> &[u8; 16] {
        &self.addr
    }
}

impl Default for InetAddress {
    fn default() -> InetAddress {
        InetAddress::any(Family::Unknown)
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            Family::V4 => {
                let octets: [u8; 4] = self.addr[..4].try_into().unwrap();
                Ipv4Addr::from(octets).fmt(f)
            }
            Family::V6 => Ipv6Addr::from(self.addr).fmt(f),
            Family::Unknown => f.write_str("unknown"),
        }
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InetAddress({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_is_all_zero() {
        assert_eq!(InetAddress::any(Family::V4).bytes(), &[0; 16]);
        assert_eq!(InetAddress::any(Family::V6).bytes(), &[0; 16]);
    }

    #[test]
    fn loopback_bytes() {
        let v4 = InetAddress::loopback(Family::V4);
        assert_eq!(&v4.bytes()[..4], &[127, 0, 0, 1]);
        assert_eq!(&v4.bytes()[4..], &[0; 12]);

        let v6 = InetAddress::loopback(Family::V6);
        let mut expected = [0u8; 16];
        expected[15] = 1;
        assert_eq!(v6.bytes(), &expected);
    }

    #[test]
    fn v4_tail_is_zeroed() {
        let addr = InetAddress::from_bytes(Family::V4, &[10, 1, 2, 3]);
        assert_eq!(&addr.bytes()[..4], &[10, 1, 2, 3]);
        assert_eq!(&addr.bytes()[4..], &[0; 12]);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(InetAddress::from_string("").is_none());
        assert!(InetAddress::from_string("not an address").is_none());
        assert!(InetAddress::from_string("300.0.0.1").is_none());
    }

    #[test]
    fn display_round_trip() {
        for text in ["127.0.0.1", "0.0.0.0", "192.168.12.34", "::1", "fe80::1", "2001:db8::8:800:200c:417a"] {
            let addr = InetAddress::from_string(text).unwrap();
            let shown = addr.to_string();
            assert_eq!(InetAddress::from_string(&shown), Some(addr), "{}", text);
        }
    }
}
