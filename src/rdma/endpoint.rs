use serde::{Deserialize, Serialize};

use super::gid::Gid;
use super::port::{LinkType, Mtu, PortInfo};
use super::type_alias::*;

/// Endpoint (NIC port & queue pair) data that peers exchange out-of-band
/// before connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeParameters {
    /// GID of the port, as a pair of 64-bit words.
    pub gid: Gid,

    /// Index of `gid` in the port's GID table; `-1` selects LID addressing.
    pub gid_index: GidIndex,

    /// LID of the port.
    pub lid: Lid,

    /// Number of the queue pair to connect to.
    pub queue_pair_number: Qpn,

    /// Initial packet sequence number of the QP's send queue.
    pub packet_sequence_number: Psn,

    /// Active MTU of the port.
    pub mtu: Mtu,
}

impl ExchangeParameters {
    /// Create the endpoint data of a queue pair bound to `port`.
    pub fn new(port: &PortInfo, qpn: Qpn, psn: Psn) -> Self {
        let global = port.link_type.is_global();
        Self {
            gid: if global { port.gid } else { Gid::ZERO },
            gid_index: if global { port.gid_index } else { -1 },
            lid: port.lid,
            queue_pair_number: qpn,
            packet_sequence_number: psn & 0xFF_FFFF,
            mtu: port.mtu,
        }
    }

    /// The link layer addressing these parameters imply.
    #[inline]
    pub fn link_type(&self) -> LinkType {
        if self.gid_index < 0 {
            LinkType::InfiniBand
        } else {
            LinkType::Ethernet
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(link_type: LinkType) -> PortInfo {
        PortInfo {
            dev_name: "mlx5_0".into(),
            num: 1,
            link_type,
            lid: 17,
            gid: Gid::from_words([0xfe80 << 48, 42]),
            gid_index: 3,
            mtu: Mtu::Mtu4096,
        }
    }

    #[test]
    fn ethernet_uses_gid() {
        let ep = ExchangeParameters::new(&port(LinkType::Ethernet), 0x11, 0x1234_5678);
        assert_eq!(ep.gid_index, 3);
        assert_eq!(ep.gid.words(), [0xfe80 << 48, 42]);
        assert_eq!(ep.packet_sequence_number, 0x34_5678);
        assert_eq!(ep.link_type(), LinkType::Ethernet);
    }

    #[test]
    fn infiniband_uses_lid() {
        let ep = ExchangeParameters::new(&port(LinkType::InfiniBand), 0x11, 5);
        assert_eq!(ep.gid_index, -1);
        assert_eq!(ep.gid, Gid::ZERO);
        assert_eq!(ep.lid, 17);
        assert_eq!(ep.link_type(), LinkType::InfiniBand);
    }

    #[test]
    fn wire_shape() {
        let ep = ExchangeParameters::new(&port(LinkType::Ethernet), 9, 10);
        let value = serde_json::to_value(ep).unwrap();
        assert_eq!(value["gid"], serde_json::json!([0xfe80u64 << 48, 42]));
        assert_eq!(value["gid_index"], 3);
        assert_eq!(value["queue_pair_number"], 9);
        assert_eq!(value["packet_sequence_number"], 10);
        assert_eq!(value["mtu"], 5);
        assert_eq!(serde_json::from_value::<ExchangeParameters>(value).unwrap(), ep);
    }
}
