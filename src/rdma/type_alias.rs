/// [`u8`]: **Port number**, identifies a port on an HCA. Starts from 1.
pub type PortNum = u8;

/// [`u16`]: **Local identifier (LID)**, identifies a port on a switch or an HCA in the cluster.
pub type Lid = u16;

/// [`i32`]: **Global identifier (GID) index**, identifies a GID on a physical port.
///
/// InfiniBand endpoints that address peers by LID carry `-1` on the wire.
pub type GidIndex = i32;

/// [`u32`]: **Queue pair number**, identifies a local queue pair.
pub type Qpn = u32;

/// [`u32`]: **Packet sequence number (PSN)**, identifies a packet in a flow. Only the low 24 bits are used.
pub type Psn = u32;

/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, identifies a remote memory region.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, designated by the poster to identify a work request.
pub type WrId = u64;
