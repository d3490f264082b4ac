//! Network and node identifiers.
//!
//! A [`NetId`] names one network (a type plus an instance number) and a
//! [`Nid`] names one interface on a network. Text form is `addr@kindN`,
//! e.g. `10@tcp1`, with the number omitted for instance 0.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

const KIND_LOOPBACK: u16 = 9;
const KIND_TCP: u16 = 2;
const KIND_O2IB: u16 = 5;
const KIND_PTL: u16 = 4;
const KIND_SIM: u16 = 100;

/// Network driver type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NetKind {
    /// Local loopback, never routed.
    Loopback,
    /// Socket driver.
    Tcp,
    /// InfiniBand verbs driver.
    O2ib,
    /// Portals driver; its interfaces count as down only when all are down.
    Ptl,
    /// In-process simulation fabric.
    Sim,
    /// Unrecognised type code.
    Other(u16),
}

impl NetKind {
    fn code(self) -> u16 {
        match self {
            NetKind::Loopback => KIND_LOOPBACK,
            NetKind::Tcp => KIND_TCP,
            NetKind::O2ib => KIND_O2IB,
            NetKind::Ptl => KIND_PTL,
            NetKind::Sim => KIND_SIM,
            NetKind::Other(c) => c,
        }
    }

    fn from_code(code: u16) -> Self {
        match code {
            KIND_LOOPBACK => NetKind::Loopback,
            KIND_TCP => NetKind::Tcp,
            KIND_O2IB => NetKind::O2ib,
            KIND_PTL => NetKind::Ptl,
            KIND_SIM => NetKind::Sim,
            c => NetKind::Other(c),
        }
    }

    fn name(self) -> String {
        match self {
            NetKind::Loopback => "lo".to_string(),
            NetKind::Tcp => "tcp".to_string(),
            NetKind::O2ib => "o2ib".to_string(),
            NetKind::Ptl => "ptl".to_string(),
            NetKind::Sim => "sim".to_string(),
            NetKind::Other(c) => format!("net{}-", c),
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "lo" => Some(NetKind::Loopback),
            "tcp" => Some(NetKind::Tcp),
            "o2ib" => Some(NetKind::O2ib),
            "ptl" => Some(NetKind::Ptl),
            "sim" => Some(NetKind::Sim),
            _ => None,
        }
    }
}

/// Identifier of a network: driver type in the high half, instance number in the low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetId(u32);

impl NetId {
    /// Wildcard network.
    pub const ANY: NetId = NetId(u32::MAX);

    /// Builds a network id from its type and instance number.
    pub fn new(kind: NetKind, num: u16) -> Self {
        NetId(((kind.code() as u32) << 16) | num as u32)
    }

    /// Raw packed value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuilds from the packed value.
    pub fn from_raw(raw: u32) -> Self {
        NetId(raw)
    }

    /// Driver type.
    pub fn kind(self) -> NetKind {
        NetKind::from_code((self.0 >> 16) as u16)
    }

    /// Instance number.
    pub fn num(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// True for the loopback network.
    pub fn is_loopback(self) -> bool {
        self != NetId::ANY && self.kind() == NetKind::Loopback
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == NetId::ANY {
            return write!(f, "<any>");
        }
        match self.num() {
            0 => write!(f, "{}", self.kind().name()),
            n => write!(f, "{}{}", self.kind().name(), n),
        }
    }
}

impl FromStr for NetId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(s.len());
        let (name, digits) = s.split_at(split);
        let kind = NetKind::parse(name)
            .ok_or_else(|| TransportError::InvalidArgument(format!("unknown network type '{}'", s)))?;
        let num = if digits.is_empty() {
            0
        } else {
            digits
                .parse::<u16>()
                .map_err(|e| TransportError::InvalidArgument(format!("bad network number in '{}': {}", s, e)))?
        };
        Ok(NetId::new(kind, num))
    }
}

/// Identifier of one network interface: network in the high 32 bits, address in the low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nid(u64);

impl Nid {
    /// Wildcard interface.
    pub const ANY: Nid = Nid(u64::MAX);

    /// Builds a NID from its network and address.
    pub fn new(net: NetId, addr: u32) -> Self {
        Nid(((net.raw() as u64) << 32) | addr as u64)
    }

    /// Raw packed value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Rebuilds from the packed value.
    pub fn from_raw(raw: u64) -> Self {
        Nid(raw)
    }

    /// The network this interface is on.
    pub fn net(self) -> NetId {
        NetId::from_raw((self.0 >> 32) as u32)
    }

    /// Address within the network.
    pub fn addr(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// True for loopback interfaces.
    pub fn is_loopback(self) -> bool {
        self != Nid::ANY && self.net().is_loopback()
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Nid::ANY {
            return write!(f, "<any>");
        }
        write!(f, "{}@{}", self.addr(), self.net())
    }
}

impl FromStr for Nid {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, net) = s
            .split_once('@')
            .ok_or_else(|| TransportError::InvalidArgument(format!("missing '@' in nid '{}'", s)))?;
        let addr = addr
            .parse::<u32>()
            .map_err(|e| TransportError::InvalidArgument(format!("bad address in '{}': {}", s, e)))?;
        Ok(Nid::new(net.parse()?, addr))
    }
}

/// A process on a node: the endpoint an RPC is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    /// Interface the process is reached through.
    pub nid: Nid,
    /// Process number on that node.
    pub pid: u32,
}

/// Well-known pid of server processes.
pub const SERVER_PID: u32 = 12345;

impl ProcessId {
    /// Process id for the server process on `nid`.
    pub fn server(nid: Nid) -> Self {
        Self { nid, pid: SERVER_PID }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pid, self.nid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_roundtrip_text() {
        let net: NetId = "tcp1".parse().unwrap();
        assert_eq!(net.kind(), NetKind::Tcp);
        assert_eq!(net.num(), 1);
        assert_eq!(net.to_string(), "tcp1");

        let zero: NetId = "o2ib".parse().unwrap();
        assert_eq!(zero.num(), 0);
        assert_eq!(zero.to_string(), "o2ib");
    }

    #[test]
    fn test_nid_parse_and_parts() {
        let nid: Nid = "10@tcp2".parse().unwrap();
        assert_eq!(nid.addr(), 10);
        assert_eq!(nid.net(), NetId::new(NetKind::Tcp, 2));
        assert_eq!(nid.to_string(), "10@tcp2");
    }

    #[test]
    fn test_loopback_detection() {
        let lo: Nid = "0@lo".parse().unwrap();
        assert!(lo.is_loopback());
        assert!(!Nid::ANY.is_loopback());
        assert!(!NetId::ANY.is_loopback());
    }

    #[test]
    fn test_bad_inputs_rejected() {
        assert!("10tcp".parse::<Nid>().is_err());
        assert!("x@tcp".parse::<Nid>().is_err());
        assert!("10@bogus".parse::<Nid>().is_err());
    }

    #[test]
    fn test_any_display() {
        assert_eq!(Nid::ANY.to_string(), "<any>");
        assert_eq!(NetId::ANY.to_string(), "<any>");
    }

    #[test]
    fn test_nid_ordering_follows_raw() {
        let a = Nid::new(NetId::new(NetKind::Tcp, 0), 1);
        let b = Nid::new(NetId::new(NetKind::Tcp, 0), 2);
        assert!(a < b);
    }
}
