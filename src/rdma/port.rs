use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::gid::Gid;
use super::type_alias::*;

/// Port link layer protocol type.
///
/// The link layer decides how peers are addressed during the handshake:
/// Ethernet (RoCE) ports use GIDs, InfiniBand ports use LIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    /// RoCE over Ethernet.
    Ethernet,

    /// InfiniBand.
    #[serde(alias = "IB")]
    InfiniBand,
}

impl LinkType {
    /// Whether peers on this link layer are addressed by GID.
    #[inline]
    pub fn is_global(self) -> bool {
        self == Self::Ethernet
    }
}

impl Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ethernet => "Ethernet",
            Self::InfiniBand => "InfiniBand",
        })
    }
}

impl FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ethernet" | "ethernet" | "RoCE" | "roce" => Ok(Self::Ethernet),
            "InfiniBand" | "Infiniband" | "infiniband" | "IB" | "ib" => Ok(Self::InfiniBand),
            _ => Err(format!("unknown link type `{}`", s)),
        }
    }
}

/// Port MTU size.
///
/// Discriminants equal the `ibv_mtu` values, which is also the form exchanged
/// with peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(u32)]
pub enum Mtu {
    /// 256 bytes.
    Mtu256 = 1,

    /// 512 bytes.
    Mtu512 = 2,

    /// 1024 bytes.
    Mtu1024 = 3,

    /// 2048 bytes.
    Mtu2048 = 4,

    /// 4096 bytes.
    Mtu4096 = 5,
}

impl Mtu {
    /// Get the MTU in bytes.
    #[inline]
    pub fn bytes(self) -> usize {
        128 << (self as u32)
    }
}

impl From<Mtu> for u32 {
    #[inline]
    fn from(mtu: Mtu) -> Self {
        mtu as u32
    }
}

impl TryFrom<u32> for Mtu {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Mtu256),
            2 => Ok(Self::Mtu512),
            3 => Ok(Self::Mtu1024),
            4 => Ok(Self::Mtu2048),
            5 => Ok(Self::Mtu4096),
            x => Err(format!("invalid MTU value {}", x)),
        }
    }
}

impl Display for Mtu {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.bytes())
    }
}

/// Attributes of the physical port a connection is bound to.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Name of the device the port belongs to.
    pub dev_name: String,

    /// Index of this port.
    pub num: PortNum,

    /// Link layer protocol.
    pub link_type: LinkType,

    /// LID of this port. Meaningful on InfiniBand only.
    pub lid: Lid,

    /// The GID used for addressing, or [`Gid::ZERO`] on InfiniBand.
    pub gid: Gid,

    /// Index of `gid` in the port's GID table, or `-1` on InfiniBand.
    pub gid_index: GidIndex,

    /// Active MTU.
    pub mtu: Mtu,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_bytes_and_order() {
        assert_eq!(Mtu::Mtu256.bytes(), 256);
        assert_eq!(Mtu::Mtu4096.bytes(), 4096);
        assert_eq!(Mtu::Mtu1024.min(Mtu::Mtu4096), Mtu::Mtu1024);
        assert_eq!(Mtu::Mtu2048.to_string(), "2048B");
    }

    #[test]
    fn mtu_wire_form_is_ibv_value() {
        assert_eq!(serde_json::to_string(&Mtu::Mtu4096).unwrap(), "5");
        assert_eq!(serde_json::from_str::<Mtu>("3").unwrap(), Mtu::Mtu1024);
        assert!(serde_json::from_str::<Mtu>("9").is_err());
    }

    #[test]
    fn link_type_parsing() {
        assert_eq!("Ethernet".parse::<LinkType>(), Ok(LinkType::Ethernet));
        assert_eq!("IB".parse::<LinkType>(), Ok(LinkType::InfiniBand));
        assert!("token-ring".parse::<LinkType>().is_err());
        assert!(LinkType::Ethernet.is_global());
        assert!(!LinkType::InfiniBand.is_global());
    }
}
