use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

/// An 128-bit identifier used to identify a port on a network adapter, a port
/// on a router, or a multicast group.
///
/// On the wire a GID is a pair of 64-bit words: the subnet prefix and the
/// interface identifier, both taken in network byte order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Gid([u8; 16]);

impl Gid {
    /// The all-zero GID, used by ports that address peers by LID.
    pub const ZERO: Self = Self([0; 16]);

    /// Get the raw bytes.
    #[inline]
    pub fn raw(&self) -> [u8; 16] {
        self.0
    }

    /// Split the GID into its subnet prefix and interface identifier.
    #[inline]
    pub fn words(&self) -> [u64; 2] {
        let mut hi = [0; 8];
        let mut lo = [0; 8];
        hi.copy_from_slice(&self.0[..8]);
        lo.copy_from_slice(&self.0[8..]);
        [u64::from_be_bytes(hi), u64::from_be_bytes(lo)]
    }

    /// Assemble a GID from its subnet prefix and interface identifier.
    #[inline]
    pub fn from_words(words: [u64; 2]) -> Self {
        let mut raw = [0; 16];
        raw[..8].copy_from_slice(&words[0].to_be_bytes());
        raw[8..].copy_from_slice(&words[1].to_be_bytes());
        Self(raw)
    }

    /// Whether this GID is an IPv4-mapped address, as RoCE GIDs bound to an
    /// IPv4 interface are.
    #[inline]
    pub fn is_ipv4_mapped(&self) -> bool {
        Ipv6Addr::from(self.0).to_ipv4_mapped().is_some()
    }
}

impl fmt::Debug for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gid = Ipv6Addr::from(*self);
        f.debug_tuple("Gid").field(&gid.to_string()).finish()
    }
}

impl From<Ipv6Addr> for Gid {
    #[inline]
    fn from(addr: Ipv6Addr) -> Self {
        Self(addr.octets())
    }
}

impl From<Gid> for Ipv6Addr {
    #[inline]
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.0)
    }
}

impl From<[u8; 16]> for Gid {
    #[inline]
    fn from(raw: [u8; 16]) -> Self {
        Self(raw)
    }
}

impl From<Gid> for [u8; 16] {
    #[inline]
    fn from(gid: Gid) -> Self {
        gid.0
    }
}

impl Serialize for Gid {
    #[inline]
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        <[u64; 2] as Serialize>::serialize(&self.words(), serializer)
    }
}

impl<'de> Deserialize<'de> for Gid {
    #[inline]
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        <[u64; 2] as Deserialize<'de>>::deserialize(deserializer).map(Self::from_words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_follow_network_order() {
        let gid = Gid::from("fe80::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(gid.words(), [0xfe80_0000_0000_0000, 1]);
        assert_eq!(Gid::from_words(gid.words()), gid);
    }

    #[test]
    fn serializes_as_word_pair() {
        let gid = Gid::from("::ffff:10.0.0.7".parse::<Ipv6Addr>().unwrap());
        assert!(gid.is_ipv4_mapped());

        let json = serde_json::to_string(&gid).unwrap();
        assert_eq!(json, format!("[0,{}]", 0xffff_0a00_0007u64));
        assert_eq!(serde_json::from_str::<Gid>(&json).unwrap(), gid);
    }
}
