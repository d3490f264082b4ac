//! Router ping payload.
//!
//! A gateway answers a ping with a fixed-size record: a header
//! (magic, version, pid, interface count) followed by up to
//! [`MAX_RTR_NIS`] `(nid, status)` pairs. Records written by a host of
//! the other byte order are recognised by their swapped magic and
//! swapped back.

use serde::{Deserialize, Serialize};

use crate::error::{TransportError, TransportResult};
use crate::nid::{NetId, NetKind, Nid};

/// Magic number at the start of every ping payload ("ping").
pub const PING_MAGIC: u32 = 0x7069_6e67;
/// Current payload version; carries per-interface status.
pub const PING_VERSION: u32 = 2;
/// Legacy payload version without interface status.
pub const PING_VERSION_1: u32 = 1;
/// Interface is up.
pub const NI_STATUS_UP: u32 = 0x15aa_c0de;
/// Interface is down.
pub const NI_STATUS_DOWN: u32 = 0xdead_face;
/// Status slot not filled in.
pub const NI_STATUS_INVALID: u32 = 0x0000_0000;
/// Most interfaces a gateway reports.
pub const MAX_RTR_NIS: usize = 16;
/// Portal pings are sent to.
pub const RESERVED_PORTAL: u32 = 0;
/// Match bits pings carry.
pub const PING_MATCHBITS: u64 = 0x8000_0000_0000_0000;

const HEADER_SIZE: usize = 16;
const NI_ENTRY_SIZE: usize = 12;
/// Size of a ping buffer.
pub const PING_INFO_SIZE: usize = HEADER_SIZE + MAX_RTR_NIS * NI_ENTRY_SIZE;

/// Version of the last ping payload seen from a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PingVersion {
    /// Not parsed yet, or unparseable.
    #[default]
    Unknown,
    /// Parsed with this version.
    Known(u32),
}

/// Status of one gateway interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiStatus {
    /// The interface.
    pub nid: Nid,
    /// One of the `NI_STATUS_*` values.
    pub status: u32,
}

/// Decoded ping payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInfo {
    /// Should be [`PING_MAGIC`].
    pub magic: u32,
    /// Payload version.
    pub version: u32,
    /// Pid of the responding process.
    pub pid: u32,
    /// Interface count as declared in the header.
    pub nnis: u32,
    /// Interfaces actually carried (at most [`MAX_RTR_NIS`]).
    pub nis: Vec<NiStatus>,
}

impl PingInfo {
    /// Current-version payload for the given interfaces.
    pub fn new(pid: u32, nis: Vec<NiStatus>) -> Self {
        Self {
            magic: PING_MAGIC,
            version: PING_VERSION,
            pid,
            nnis: nis.len() as u32,
            nis,
        }
    }

    /// Encodes little-endian, padded to [`PING_INFO_SIZE`].
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(u32::to_le_bytes, u64::to_le_bytes)
    }

    /// Encodes in big-endian order, as a host of the other byte order would.
    pub fn encode_swapped(&self) -> Vec<u8> {
        self.encode_with(u32::to_be_bytes, u64::to_be_bytes)
    }

    fn encode_with(&self, w32: fn(u32) -> [u8; 4], w64: fn(u64) -> [u8; 8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(PING_INFO_SIZE);
        out.extend_from_slice(&w32(self.magic));
        out.extend_from_slice(&w32(self.version));
        out.extend_from_slice(&w32(self.pid));
        out.extend_from_slice(&w32(self.nnis));
        for ni in self.nis.iter().take(MAX_RTR_NIS) {
            out.extend_from_slice(&w64(ni.nid.raw()));
            out.extend_from_slice(&w32(ni.status));
        }
        out.resize(PING_INFO_SIZE, 0);
        out
    }

    /// Decodes a payload, undoing a byte swap if the magic reads reversed.
    /// Magic and version are not validated here.
    pub fn decode(buf: &[u8]) -> TransportResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(TransportError::MalformedPing(format!(
                "payload is {} bytes, header needs {}",
                buf.len(),
                HEADER_SIZE
            )));
        }
        let swapped = read_u32(buf, 0, false) == PING_MAGIC.swap_bytes();
        let magic = read_u32(buf, 0, swapped);
        let version = read_u32(buf, 4, swapped);
        let pid = read_u32(buf, 8, swapped);
        let nnis = read_u32(buf, 12, swapped);

        let carried = (nnis as usize)
            .min(MAX_RTR_NIS)
            .min((buf.len() - HEADER_SIZE) / NI_ENTRY_SIZE);
        let nis = (0..carried)
            .map(|i| {
                let off = HEADER_SIZE + i * NI_ENTRY_SIZE;
                NiStatus {
                    nid: Nid::from_raw(read_u64(buf, off, swapped)),
                    status: read_u32(buf, off + 8, swapped),
                }
            })
            .collect();

        Ok(Self {
            magic,
            version,
            pid,
            nnis,
            nis,
        })
    }
}

fn read_u32(buf: &[u8], off: usize, swapped: bool) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    if swapped {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    }
}

fn read_u64(buf: &[u8], off: usize, swapped: bool) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    if swapped {
        u64::from_be_bytes(raw)
    } else {
        u64::from_le_bytes(raw)
    }
}

/// What a ping payload says about the routes through one gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcInfo {
    /// Version to record on the gateway.
    pub version: PingVersion,
    /// Down-interface count per route, in the order the route nets were
    /// given; `None` leaves the routes untouched.
    pub downis: Option<Vec<u32>>,
}

impl RcInfo {
    fn unknown() -> Self {
        Self {
            version: PingVersion::Unknown,
            downis: None,
        }
    }
}

/// Counts down interfaces on a gateway for each route through it.
///
/// For each route, an UP interface on the route's own network clears the
/// count. Otherwise the count is the number of DOWN non-portals
/// interfaces, plus one if the portals interfaces are all down.
/// Loopback interfaces are ignored. Any malformed entry makes the whole
/// payload unknown.
pub fn parse_rc_info(info: &PingInfo, route_nets: &[NetId]) -> RcInfo {
    if info.magic != PING_MAGIC {
        return RcInfo::unknown();
    }
    if info.version == PING_VERSION_1 {
        return RcInfo {
            version: PingVersion::Known(PING_VERSION_1),
            downis: None,
        };
    }
    if info.version != PING_VERSION {
        return RcInfo::unknown();
    }

    let mut counts = Vec::with_capacity(route_nets.len());
    for &net in route_nets {
        let mut ptl_status = NI_STATUS_INVALID;
        let mut down = 0u32;
        let mut up = false;

        for stat in info.nis.iter().take(MAX_RTR_NIS) {
            if stat.nid == Nid::ANY {
                return RcInfo::unknown();
            }
            let ni_net = stat.nid.net();
            if ni_net.kind() == NetKind::Loopback {
                continue;
            }
            match stat.status {
                NI_STATUS_DOWN => {
                    if ni_net.kind() != NetKind::Ptl {
                        down += 1;
                    } else if ptl_status != NI_STATUS_UP {
                        ptl_status = NI_STATUS_DOWN;
                    }
                }
                NI_STATUS_UP => {
                    if ni_net == net {
                        up = true;
                        break;
                    }
                    if ni_net.kind() == NetKind::Ptl {
                        ptl_status = NI_STATUS_UP;
                    }
                }
                _ => return RcInfo::unknown(),
            }
        }

        if up {
            counts.push(0);
        } else {
            counts.push(down + u32::from(ptl_status == NI_STATUS_DOWN));
        }
    }

    RcInfo {
        version: PingVersion::Known(PING_VERSION),
        downis: Some(counts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(num: u16) -> NetId {
        NetId::new(NetKind::Tcp, num)
    }

    fn ni(net: NetId, addr: u32, status: u32) -> NiStatus {
        NiStatus {
            nid: Nid::new(net, addr),
            status,
        }
    }

    #[test]
    fn test_encode_decode_fixed_size() {
        let info = PingInfo::new(7, vec![ni(tcp(0), 1, NI_STATUS_UP)]);
        let bytes = info.encode();
        assert_eq!(bytes.len(), PING_INFO_SIZE);
        assert_eq!(PingInfo::decode(&bytes).unwrap(), info);
    }

    #[test]
    fn test_swapped_payload_is_recognised() {
        let info = PingInfo::new(9, vec![ni(tcp(1), 4, NI_STATUS_DOWN)]);
        let decoded = PingInfo::decode(&info.encode_swapped()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_short_payload_rejected() {
        assert!(PingInfo::decode(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_decode_caps_interfaces() {
        let nis = (0..20).map(|i| ni(tcp(0), i, NI_STATUS_UP)).collect();
        let info = PingInfo::new(1, nis);
        let decoded = PingInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded.nnis, 20);
        assert_eq!(decoded.nis.len(), MAX_RTR_NIS);
    }

    #[test]
    fn test_bad_magic_is_unknown() {
        let mut info = PingInfo::new(1, vec![]);
        info.magic = 0x1234_5678;
        assert_eq!(parse_rc_info(&info, &[tcp(1)]), RcInfo::unknown());
    }

    #[test]
    fn test_v1_carries_no_status() {
        let mut info = PingInfo::new(1, vec![ni(tcp(0), 1, NI_STATUS_DOWN)]);
        info.version = PING_VERSION_1;
        let parsed = parse_rc_info(&info, &[tcp(1)]);
        assert_eq!(parsed.version, PingVersion::Known(PING_VERSION_1));
        assert!(parsed.downis.is_none());
    }

    #[test]
    fn test_unexpected_version_is_unknown() {
        let mut info = PingInfo::new(1, vec![]);
        info.version = 3;
        assert_eq!(parse_rc_info(&info, &[tcp(1)]).version, PingVersion::Unknown);
    }

    #[test]
    fn test_counts_down_interfaces() {
        let info = PingInfo::new(
            1,
            vec![
                ni(tcp(2), 1, NI_STATUS_DOWN),
                ni(tcp(3), 1, NI_STATUS_DOWN),
                ni(NetId::new(NetKind::Loopback, 0), 0, NI_STATUS_DOWN),
            ],
        );
        let parsed = parse_rc_info(&info, &[tcp(1)]);
        assert_eq!(parsed.downis, Some(vec![2]));
    }

    #[test]
    fn test_up_on_destination_net_clears_count() {
        let info = PingInfo::new(
            1,
            vec![ni(tcp(2), 1, NI_STATUS_DOWN), ni(tcp(1), 1, NI_STATUS_UP)],
        );
        let parsed = parse_rc_info(&info, &[tcp(1), tcp(5)]);
        assert_eq!(parsed.downis, Some(vec![0, 1]));
    }

    #[test]
    fn test_portals_down_only_when_all_down() {
        let ptl = NetId::new(NetKind::Ptl, 0);
        let mixed = PingInfo::new(
            1,
            vec![ni(ptl, 1, NI_STATUS_DOWN), ni(ptl, 2, NI_STATUS_UP)],
        );
        assert_eq!(parse_rc_info(&mixed, &[tcp(1)]).downis, Some(vec![0]));

        let all_down = PingInfo::new(
            1,
            vec![ni(ptl, 1, NI_STATUS_DOWN), ni(ptl, 2, NI_STATUS_DOWN)],
        );
        assert_eq!(parse_rc_info(&all_down, &[tcp(1)]).downis, Some(vec![1]));
    }

    #[test]
    fn test_any_nid_or_bad_status_is_unknown() {
        let any = PingInfo::new(
            1,
            vec![NiStatus {
                nid: Nid::ANY,
                status: NI_STATUS_UP,
            }],
        );
        assert_eq!(parse_rc_info(&any, &[tcp(1)]), RcInfo::unknown());

        let bad = PingInfo::new(1, vec![ni(tcp(2), 1, 0x42)]);
        assert_eq!(parse_rc_info(&bad, &[tcp(1)]), RcInfo::unknown());
    }
}
