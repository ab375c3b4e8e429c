//! MPTCP TCP-option codec.
//!
//! Every MPTCP signal rides inside one TCP option of kind [`TCPOPT_MPTCP`]:
//! `kind, length, subtype:4|version:4, ...`. The five subtypes handled here
//! are CAPABLE, JOIN, DSS, ADD_ADDR and FAIL. Decoding produces one tagged
//! [`MptcpOption`] per option; a malformed MPTCP option is reported per
//! option so that callers can log and skip it without dropping the packet.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::types::token::{Key, Token};

/// TCP option kind carrying all MPTCP subtypes.
pub const TCPOPT_MPTCP: u8 = 30;

const TCPOPT_EOL: u8 = 0;
const TCPOPT_NOP: u8 = 1;

pub const MPTCP_SUB_CAPABLE: u8 = 0;
pub const MPTCP_SUB_JOIN: u8 = 1;
pub const MPTCP_SUB_DSS: u8 = 2;
pub const MPTCP_SUB_ADD_ADDR: u8 = 3;
pub const MPTCP_SUB_FAIL: u8 = 6;

pub const MPTCP_SUB_LEN_CAPABLE_SYN: usize = 4;
pub const MPTCP_SUB_LEN_CAPABLE_SYNACK: usize = 12;
pub const MPTCP_SUB_LEN_CAPABLE_ACK: usize = 20;

pub const MPTCP_SUB_LEN_JOIN_SYN: usize = 12;
pub const MPTCP_SUB_LEN_JOIN_SYNACK: usize = 16;
pub const MPTCP_SUB_LEN_JOIN_ACK: usize = 24;

pub const MPTCP_SUB_LEN_DSS: usize = 4;
pub const MPTCP_SUB_LEN_ACK: usize = 4;
pub const MPTCP_SUB_LEN_SEQ: usize = 10;
pub const MPTCP_SUB_LEN_SEQ_CSUM: usize = 12;

pub const MPTCP_SUB_LEN_ADD_ADDR4: usize = 8;
pub const MPTCP_SUB_LEN_ADD_ADDR6: usize = 20;

pub const MPTCP_SUB_LEN_FAIL: usize = 8;

const DSS_FLAG_A: u8 = 0x01;
const DSS_FLAG_M: u8 = 0x04;
const DSS_FLAG_F: u8 = 0x10;

const CAPABLE_FLAG_CSUM: u8 = 0x80;
const JOIN_FLAG_BACKUP: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    #[error("option truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("bad length {len} for subtype {subtype}")]
    BadLength { subtype: u8, len: usize },
    #[error("unknown subtype {0}")]
    UnknownSubtype(u8),
    #[error("not an MPTCP option (kind {0})")]
    WrongKind(u8),
    #[error("bad address version nibble {0}")]
    BadIpVersion(u8),
}

/// CAPABLE, the MPTCP capability negotiation.
///
/// The handshake stage is implied by which keys are present: none on SYN,
/// the sender's on SYN-ACK, both on the final ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capable {
    pub checksum_required: bool,
    pub sender_key: Option<Key>,
    pub receiver_key: Option<Key>,
}

impl Capable {
    pub fn syn(checksum_required: bool) -> Self {
        Self { checksum_required, sender_key: None, receiver_key: None }
    }

    pub fn synack(checksum_required: bool, sender_key: Key) -> Self {
        Self { checksum_required, sender_key: Some(sender_key), receiver_key: None }
    }

    pub fn ack(checksum_required: bool, sender_key: Key, receiver_key: Key) -> Self {
        Self {
            checksum_required,
            sender_key: Some(sender_key),
            receiver_key: Some(receiver_key),
        }
    }
}

/// JOIN, staged over the new subflow's 3-way handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    Syn { addr_id: u8, backup: bool, token: Token, nonce: u32 },
    SynAck { addr_id: u8, backup: bool, mac: u64, nonce: u32 },
    Ack { mac: [u8; 20] },
}

impl Join {
    pub fn addr_id(&self) -> Option<u8> {
        match self {
            Join::Syn { addr_id, .. } | Join::SynAck { addr_id, .. } => Some(*addr_id),
            Join::Ack { .. } => None,
        }
    }
}

/// The mapping block of a DSS option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DssMapping {
    pub data_seq: u32,
    /// Relative to the subflow ISN.
    pub sub_seq: u32,
    pub data_len: u16,
    pub checksum: Option<u16>,
}

/// DSS, the data sequence signal: any subset of DATA_ACK, a mapping, and
/// DATA_FIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dss {
    pub data_ack: Option<u32>,
    pub mapping: Option<DssMapping>,
    pub data_fin: bool,
}

/// ADD_ADDR, advertising one more address of the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddAddr {
    pub addr_id: u8,
    pub addr: IpAddr,
    pub port: Option<u16>,
}

/// FAIL, requesting infinite-mapping fallback from the given DSN on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fail {
    pub data_seq: u32,
}

/// One decoded MPTCP option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MptcpOption {
    Capable(Capable),
    Join(Join),
    Dss(Dss),
    AddAddr(AddAddr),
    Fail(Fail),
}

impl MptcpOption {
    /// Total wire length of this option, including kind and length bytes.
    pub fn wire_len(&self) -> usize {
        match self {
            MptcpOption::Capable(c) => match (c.sender_key, c.receiver_key) {
                (None, _) => MPTCP_SUB_LEN_CAPABLE_SYN,
                (Some(_), None) => MPTCP_SUB_LEN_CAPABLE_SYNACK,
                (Some(_), Some(_)) => MPTCP_SUB_LEN_CAPABLE_ACK,
            },
            MptcpOption::Join(Join::Syn { .. }) => MPTCP_SUB_LEN_JOIN_SYN,
            MptcpOption::Join(Join::SynAck { .. }) => MPTCP_SUB_LEN_JOIN_SYNACK,
            MptcpOption::Join(Join::Ack { .. }) => MPTCP_SUB_LEN_JOIN_ACK,
            MptcpOption::Dss(d) => {
                let mut len = MPTCP_SUB_LEN_DSS;
                if d.data_ack.is_some() {
                    len += MPTCP_SUB_LEN_ACK;
                }
                if let Some(m) = &d.mapping {
                    len += if m.checksum.is_some() {
                        MPTCP_SUB_LEN_SEQ_CSUM
                    } else {
                        MPTCP_SUB_LEN_SEQ
                    };
                }
                len
            }
            MptcpOption::AddAddr(a) => {
                let base = if a.addr.is_ipv4() {
                    MPTCP_SUB_LEN_ADD_ADDR4
                } else {
                    MPTCP_SUB_LEN_ADD_ADDR6
                };
                base + if a.port.is_some() { 2 } else { 0 }
            }
            MptcpOption::Fail(_) => MPTCP_SUB_LEN_FAIL,
        }
    }

    /// Appends the wire encoding, including the kind and length bytes.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(TCPOPT_MPTCP);
        out.put_u8(self.wire_len() as u8);
        match self {
            MptcpOption::Capable(c) => {
                out.put_u8(MPTCP_SUB_CAPABLE << 4);
                let mut flags = 0u8;
                if c.checksum_required {
                    flags |= CAPABLE_FLAG_CSUM;
                }
                out.put_u8(flags);
                if let Some(key) = c.sender_key {
                    out.put_u64(key.0);
                }
                if let Some(key) = c.receiver_key {
                    out.put_u64(key.0);
                }
            }
            MptcpOption::Join(join) => match *join {
                Join::Syn { addr_id, backup, token, nonce } => {
                    out.put_u8(MPTCP_SUB_JOIN << 4 | if backup { JOIN_FLAG_BACKUP } else { 0 });
                    out.put_u8(addr_id);
                    out.put_u32(token.0);
                    out.put_u32(nonce);
                }
                Join::SynAck { addr_id, backup, mac, nonce } => {
                    out.put_u8(MPTCP_SUB_JOIN << 4 | if backup { JOIN_FLAG_BACKUP } else { 0 });
                    out.put_u8(addr_id);
                    out.put_u64(mac);
                    out.put_u32(nonce);
                }
                Join::Ack { mac } => {
                    out.put_u8(MPTCP_SUB_JOIN << 4);
                    out.put_u8(0);
                    out.put_slice(&mac);
                }
            },
            MptcpOption::Dss(d) => {
                out.put_u8(MPTCP_SUB_DSS << 4);
                let mut flags = 0u8;
                if d.data_ack.is_some() {
                    flags |= DSS_FLAG_A;
                }
                if d.mapping.is_some() {
                    flags |= DSS_FLAG_M;
                }
                if d.data_fin {
                    flags |= DSS_FLAG_F;
                }
                out.put_u8(flags);
                if let Some(ack) = d.data_ack {
                    out.put_u32(ack);
                }
                if let Some(m) = &d.mapping {
                    out.put_u32(m.data_seq);
                    out.put_u32(m.sub_seq);
                    out.put_u16(m.data_len);
                    if let Some(csum) = m.checksum {
                        out.put_u16(csum);
                    }
                }
            }
            MptcpOption::AddAddr(a) => {
                let ipver = if a.addr.is_ipv4() { 4 } else { 6 };
                out.put_u8(MPTCP_SUB_ADD_ADDR << 4 | ipver);
                out.put_u8(a.addr_id);
                match a.addr {
                    IpAddr::V4(v4) => out.put_slice(&v4.octets()),
                    IpAddr::V6(v6) => out.put_slice(&v6.octets()),
                }
                if let Some(port) = a.port {
                    out.put_u16(port);
                }
            }
            MptcpOption::Fail(f) => {
                out.put_u8(MPTCP_SUB_FAIL << 4);
                out.put_u8(0);
                out.put_u32(f.data_seq);
            }
        }
    }

    /// Decodes one full option, kind and length bytes included.
    pub fn decode(opt: &[u8]) -> Result<Self, OptionError> {
        if opt.len() < 3 {
            return Err(OptionError::Truncated { need: 3, have: opt.len() });
        }
        if opt[0] != TCPOPT_MPTCP {
            return Err(OptionError::WrongKind(opt[0]));
        }
        let len = opt[1] as usize;
        if len != opt.len() {
            return Err(OptionError::Truncated { need: len, have: opt.len() });
        }
        let subtype = opt[2] >> 4;
        if len < 4 {
            // Every defined subtype needs at least its flags byte.
            return Err(OptionError::BadLength { subtype, len });
        }
        let body = &opt[2..];

        match subtype {
            MPTCP_SUB_CAPABLE => decode_capable(body, len),
            MPTCP_SUB_JOIN => decode_join(body, len),
            MPTCP_SUB_DSS => decode_dss(body, len),
            MPTCP_SUB_ADD_ADDR => decode_add_addr(body, len),
            MPTCP_SUB_FAIL => decode_fail(body, len),
            other => Err(OptionError::UnknownSubtype(other)),
        }
    }
}

fn read_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn read_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn decode_capable(body: &[u8], len: usize) -> Result<MptcpOption, OptionError> {
    let checksum_required = body[1] & CAPABLE_FLAG_CSUM != 0;
    let (sender_key, receiver_key) = match len {
        MPTCP_SUB_LEN_CAPABLE_SYN => (None, None),
        MPTCP_SUB_LEN_CAPABLE_SYNACK => (Some(Key(read_u64(&body[2..]))), None),
        MPTCP_SUB_LEN_CAPABLE_ACK => {
            (Some(Key(read_u64(&body[2..]))), Some(Key(read_u64(&body[10..]))))
        }
        _ => return Err(OptionError::BadLength { subtype: MPTCP_SUB_CAPABLE, len }),
    };
    Ok(MptcpOption::Capable(Capable { checksum_required, sender_key, receiver_key }))
}

fn decode_join(body: &[u8], len: usize) -> Result<MptcpOption, OptionError> {
    let backup = body[0] & JOIN_FLAG_BACKUP != 0;
    let addr_id = body[1];
    let join = match len {
        MPTCP_SUB_LEN_JOIN_SYN => Join::Syn {
            addr_id,
            backup,
            token: Token(read_u32(&body[2..])),
            nonce: read_u32(&body[6..]),
        },
        MPTCP_SUB_LEN_JOIN_SYNACK => Join::SynAck {
            addr_id,
            backup,
            mac: read_u64(&body[2..]),
            nonce: read_u32(&body[10..]),
        },
        MPTCP_SUB_LEN_JOIN_ACK => {
            let mut mac = [0u8; 20];
            mac.copy_from_slice(&body[2..22]);
            Join::Ack { mac }
        }
        _ => return Err(OptionError::BadLength { subtype: MPTCP_SUB_JOIN, len }),
    };
    Ok(MptcpOption::Join(join))
}

fn decode_dss(body: &[u8], len: usize) -> Result<MptcpOption, OptionError> {
    let flags = body[1];
    let mut expected = MPTCP_SUB_LEN_DSS;
    if flags & DSS_FLAG_A != 0 {
        expected += MPTCP_SUB_LEN_ACK;
    }
    let with_csum = if flags & DSS_FLAG_M != 0 {
        if len == expected + MPTCP_SUB_LEN_SEQ {
            false
        } else if len == expected + MPTCP_SUB_LEN_SEQ_CSUM {
            true
        } else {
            return Err(OptionError::BadLength { subtype: MPTCP_SUB_DSS, len });
        }
    } else {
        if len != expected {
            return Err(OptionError::BadLength { subtype: MPTCP_SUB_DSS, len });
        }
        false
    };

    let mut at = 2;
    let mut dss = Dss { data_fin: flags & DSS_FLAG_F != 0, ..Dss::default() };
    if flags & DSS_FLAG_A != 0 {
        dss.data_ack = Some(read_u32(&body[at..]));
        at += 4;
    }
    if flags & DSS_FLAG_M != 0 {
        let data_seq = read_u32(&body[at..]);
        let sub_seq = read_u32(&body[at + 4..]);
        let data_len = read_u16(&body[at + 8..]);
        let checksum = with_csum.then(|| read_u16(&body[at + 10..]));
        dss.mapping = Some(DssMapping { data_seq, sub_seq, data_len, checksum });
    }
    Ok(MptcpOption::Dss(dss))
}

fn decode_add_addr(body: &[u8], len: usize) -> Result<MptcpOption, OptionError> {
    let ipver = body[0] & 0x0f;
    let addr_id = body[1];
    let (addr, port) = match ipver {
        4 => {
            if len != MPTCP_SUB_LEN_ADD_ADDR4 && len != MPTCP_SUB_LEN_ADD_ADDR4 + 2 {
                return Err(OptionError::BadLength { subtype: MPTCP_SUB_ADD_ADDR, len });
            }
            let octets: [u8; 4] = body[2..6].try_into().unwrap();
            let port = (len == MPTCP_SUB_LEN_ADD_ADDR4 + 2).then(|| read_u16(&body[6..]));
            (IpAddr::V4(Ipv4Addr::from(octets)), port)
        }
        6 => {
            if len != MPTCP_SUB_LEN_ADD_ADDR6 && len != MPTCP_SUB_LEN_ADD_ADDR6 + 2 {
                return Err(OptionError::BadLength { subtype: MPTCP_SUB_ADD_ADDR, len });
            }
            let octets: [u8; 16] = body[2..18].try_into().unwrap();
            let port = (len == MPTCP_SUB_LEN_ADD_ADDR6 + 2).then(|| read_u16(&body[18..]));
            (IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
        other => return Err(OptionError::BadIpVersion(other)),
    };
    Ok(MptcpOption::AddAddr(AddAddr { addr_id, addr, port }))
}

fn decode_fail(body: &[u8], len: usize) -> Result<MptcpOption, OptionError> {
    if len != MPTCP_SUB_LEN_FAIL {
        return Err(OptionError::BadLength { subtype: MPTCP_SUB_FAIL, len });
    }
    Ok(MptcpOption::Fail(Fail { data_seq: read_u32(&body[2..]) }))
}

/// Walks a TCP option run and decodes every MPTCP option in it.
///
/// Non-MPTCP options are skipped. A malformed MPTCP option is logged and
/// skipped; the rest of the run is still parsed. This is the
/// OptionMalformed policy: the connection continues.
pub fn parse_run(mut options: &[u8]) -> Vec<MptcpOption> {
    let mut parsed = Vec::new();
    while !options.is_empty() {
        match options[0] {
            TCPOPT_EOL => break,
            TCPOPT_NOP => {
                options = &options[1..];
                continue;
            }
            kind => {
                if options.len() < 2 {
                    break;
                }
                let len = options[1] as usize;
                if len < 2 || len > options.len() {
                    // Silly or partial option terminates the run.
                    break;
                }
                if kind == TCPOPT_MPTCP {
                    match MptcpOption::decode(&options[..len]) {
                        Ok(opt) => parsed.push(opt),
                        Err(err) => debug!(%err, "ignoring malformed MPTCP option"),
                    }
                }
                options = &options[len..];
            }
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(opt: MptcpOption) -> MptcpOption {
        let mut buf = BytesMut::new();
        opt.encode(&mut buf);
        assert_eq!(buf.len(), opt.wire_len());
        MptcpOption::decode(&buf).unwrap()
    }

    #[test]
    fn test_capable_roundtrip_all_stages() {
        let syn = MptcpOption::Capable(Capable::syn(true));
        assert_eq!(roundtrip(syn), syn);

        let synack = MptcpOption::Capable(Capable::synack(false, Key(0x0102030405060708)));
        assert_eq!(roundtrip(synack), synack);

        let ack = MptcpOption::Capable(Capable::ack(
            true,
            Key(0x1111222233334444),
            Key(0x5555666677778888),
        ));
        assert_eq!(roundtrip(ack), ack);
    }

    #[test]
    fn test_join_roundtrip_all_stages() {
        let syn = MptcpOption::Join(Join::Syn {
            addr_id: 3,
            backup: true,
            token: Token(0xdeadbeef),
            nonce: 0xcafe0001,
        });
        assert_eq!(roundtrip(syn), syn);

        let synack = MptcpOption::Join(Join::SynAck {
            addr_id: 0,
            backup: false,
            mac: 0xa1a2a3a4a5a6a7a8,
            nonce: 42,
        });
        assert_eq!(roundtrip(synack), synack);

        let ack = MptcpOption::Join(Join::Ack { mac: [7u8; 20] });
        assert_eq!(roundtrip(ack), ack);
    }

    #[test]
    fn test_dss_roundtrip_variants() {
        let ack_only = MptcpOption::Dss(Dss { data_ack: Some(999), ..Dss::default() });
        assert_eq!(roundtrip(ack_only), ack_only);

        let map_only = MptcpOption::Dss(Dss {
            mapping: Some(DssMapping { data_seq: 1000, sub_seq: 1, data_len: 1400, checksum: None }),
            ..Dss::default()
        });
        assert_eq!(roundtrip(map_only), map_only);

        let full = MptcpOption::Dss(Dss {
            data_ack: Some(77),
            mapping: Some(DssMapping {
                data_seq: 5000,
                sub_seq: 20,
                data_len: 512,
                checksum: Some(0xbeef),
            }),
            data_fin: true,
        });
        assert_eq!(roundtrip(full), full);
        assert_eq!(full.wire_len(), 4 + 4 + 12);
    }

    #[test]
    fn test_add_addr_roundtrip_four_shapes() {
        let v4 = MptcpOption::AddAddr(AddAddr {
            addr_id: 2,
            addr: "10.0.0.2".parse().unwrap(),
            port: None,
        });
        assert_eq!(roundtrip(v4), v4);
        assert_eq!(v4.wire_len(), 8);

        let v4p = MptcpOption::AddAddr(AddAddr {
            addr_id: 2,
            addr: "10.0.0.2".parse().unwrap(),
            port: Some(8080),
        });
        assert_eq!(roundtrip(v4p), v4p);
        assert_eq!(v4p.wire_len(), 10);

        let v6 = MptcpOption::AddAddr(AddAddr {
            addr_id: 9,
            addr: "2001:db8::7".parse().unwrap(),
            port: None,
        });
        assert_eq!(roundtrip(v6), v6);
        assert_eq!(v6.wire_len(), 20);

        let v6p = MptcpOption::AddAddr(AddAddr {
            addr_id: 9,
            addr: "2001:db8::7".parse().unwrap(),
            port: Some(443),
        });
        assert_eq!(roundtrip(v6p), v6p);
        assert_eq!(v6p.wire_len(), 22);
    }

    #[test]
    fn test_fail_roundtrip() {
        let fail = MptcpOption::Fail(Fail { data_seq: 600_000 });
        assert_eq!(roundtrip(fail), fail);
        assert_eq!(fail.wire_len(), 8);
    }

    #[test]
    fn test_bad_length_rejected() {
        let mut buf = BytesMut::new();
        MptcpOption::Fail(Fail { data_seq: 1 }).encode(&mut buf);
        let mut bytes = buf.to_vec();
        bytes[1] = 7; // corrupt the length
        let truncated = &bytes[..7];
        assert!(matches!(
            MptcpOption::decode(truncated),
            Err(OptionError::BadLength { subtype: MPTCP_SUB_FAIL, len: 7 })
        ));
    }

    #[test]
    fn test_parse_run_skips_foreign_and_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(TCPOPT_NOP);
        buf.put_u8(TCPOPT_NOP);
        // A foreign option (MSS).
        buf.put_slice(&[2, 4, 0x05, 0xb4]);
        MptcpOption::Dss(Dss { data_ack: Some(5), ..Dss::default() }).encode(&mut buf);
        // A malformed MPTCP option: DSS claiming mapping but too short.
        buf.put_slice(&[TCPOPT_MPTCP, 4, MPTCP_SUB_DSS << 4, DSS_FLAG_M]);
        MptcpOption::Fail(Fail { data_seq: 3 }).encode(&mut buf);

        let parsed = parse_run(&buf);
        assert_eq!(parsed.len(), 2);
        assert!(matches!(parsed[0], MptcpOption::Dss(_)));
        assert!(matches!(parsed[1], MptcpOption::Fail(_)));
    }

    #[test]
    fn test_parse_run_stops_at_eol() {
        let mut buf = BytesMut::new();
        MptcpOption::Fail(Fail { data_seq: 3 }).encode(&mut buf);
        buf.put_u8(TCPOPT_EOL);
        MptcpOption::Fail(Fail { data_seq: 4 }).encode(&mut buf);
        let parsed = parse_run(&buf);
        assert_eq!(parsed.len(), 1);
    }
}
