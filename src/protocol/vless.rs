//! VLESS wire codec: header encode/decode and UDP sub-framing.
//!
//! Grounded in the address-probing and header-layout logic of
//! `outbound/vless.rs::build_request`, generalized into a standalone
//! encode/decode pair usable by both the node (decode inbound early data)
//! and the client (encode outbound headers). Decode is unified to a single
//! `Result` return — the originating implementation this protocol was
//! modeled on returns a non-error sentinel on some failure branches and
//! `nil` on others; that ambiguity is deliberately not carried over here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use uuid::Uuid;

use crate::common::error::{Error, Result};

pub const VERSION: u8 = 0x00;

const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x02;
const CMD_MUX: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x02;
const ATYP_IPV6: u8 = 0x03;

/// Destination address as carried in a VLESS header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlessAddress {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl VlessAddress {
    /// Probe order used both when deciding how to *encode* a destination and
    /// when a decoded domain happens to be a literal IP (the tie-break rule
    /// in the wire-format spec: prefer the IP encoding in that case).
    pub fn classify(host: &str) -> VlessAddress {
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return VlessAddress::Ipv4(v4);
        }
        if let Ok(v6) = host.parse::<Ipv6Addr>() {
            return VlessAddress::Ipv6(v6);
        }
        VlessAddress::Domain(host.to_string())
    }

    pub fn to_host_string(&self) -> String {
        match self {
            VlessAddress::Ipv4(ip) => ip.to_string(),
            VlessAddress::Ipv6(ip) => ip.to_string(),
            VlessAddress::Domain(d) => d.clone(),
        }
    }

    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            VlessAddress::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            VlessAddress::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            VlessAddress::Domain(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlessCommand {
    Tcp,
    Udp,
}

/// A decoded (or to-be-encoded) VLESS header plus the payload that follows it.
#[derive(Debug, Clone)]
pub struct VlessRequest {
    pub version: u8,
    pub uuid: Uuid,
    pub command: VlessCommand,
    pub address: VlessAddress,
    pub port: u16,
    /// Bytes following the header: early payload on decode, appended payload on encode.
    pub payload: Vec<u8>,
}

impl VlessRequest {
    /// Decode a VLESS header from the front of `buf`. Never panics and never
    /// reads past `buf`'s end; every slice is bounds-checked first.
    pub fn decode(buf: &[u8]) -> Result<VlessRequest> {
        if buf.len() < 24 {
            return Err(Error::protocol("vless: short header"));
        }

        let version = buf[0];
        let uuid_bytes: [u8; 16] = buf[1..17].try_into().unwrap();
        let uuid = Uuid::from_bytes(uuid_bytes);

        let addon_len = buf[17] as usize;
        let mut offset = 18usize;
        if buf.len() < offset + addon_len {
            return Err(Error::protocol("vless: truncated addon"));
        }
        offset += addon_len; // addon payload is opaque, skipped

        if buf.len() < offset + 1 {
            return Err(Error::protocol("vless: missing command"));
        }
        let command = match buf[offset] {
            CMD_TCP => VlessCommand::Tcp,
            CMD_UDP => VlessCommand::Udp,
            CMD_MUX => return Err(Error::protocol("vless: mux command unsupported")),
            other => return Err(Error::protocol(format!("vless: unsupported command {other}"))),
        };
        offset += 1;

        if buf.len() < offset + 2 {
            return Err(Error::protocol("vless: truncated port"));
        }
        let port = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        offset += 2;

        if buf.len() < offset + 1 {
            return Err(Error::protocol("vless: missing address type"));
        }
        let atyp = buf[offset];
        offset += 1;

        let address = match atyp {
            ATYP_IPV4 => {
                if buf.len() < offset + 4 {
                    return Err(Error::protocol("vless: truncated ipv4 address"));
                }
                let octets: [u8; 4] = buf[offset..offset + 4].try_into().unwrap();
                offset += 4;
                VlessAddress::Ipv4(Ipv4Addr::from(octets))
            }
            ATYP_DOMAIN => {
                if buf.len() < offset + 1 {
                    return Err(Error::protocol("vless: missing domain length"));
                }
                let len = buf[offset] as usize;
                offset += 1;
                if buf.len() < offset + len {
                    return Err(Error::protocol("vless: truncated domain"));
                }
                let domain = String::from_utf8_lossy(&buf[offset..offset + len]).into_owned();
                offset += len;
                VlessAddress::Domain(domain)
            }
            ATYP_IPV6 => {
                if buf.len() < offset + 16 {
                    return Err(Error::protocol("vless: truncated ipv6 address"));
                }
                let octets: [u8; 16] = buf[offset..offset + 16].try_into().unwrap();
                offset += 16;
                VlessAddress::Ipv6(Ipv6Addr::from(octets))
            }
            other => {
                return Err(Error::protocol(format!(
                    "vless: unsupported address type {other}"
                )))
            }
        };

        let payload = buf[offset..].to_vec();

        Ok(VlessRequest {
            version,
            uuid,
            command,
            address,
            port,
            payload,
        })
    }

    /// Encode this request's header followed by its payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.payload.len());
        out.push(self.version);
        out.extend_from_slice(self.uuid.as_bytes());
        out.push(0); // addon length, always empty on encode
        out.push(match self.command {
            VlessCommand::Tcp => CMD_TCP,
            VlessCommand::Udp => CMD_UDP,
        });
        out.extend_from_slice(&self.port.to_be_bytes());

        match &self.address {
            VlessAddress::Ipv4(ip) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&ip.octets());
            }
            VlessAddress::Ipv6(ip) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&ip.octets());
            }
            VlessAddress::Domain(domain) => {
                // Tie-break: a domain string that parses as an IP is encoded as that IP.
                match VlessAddress::classify(domain) {
                    VlessAddress::Ipv4(ip) => {
                        out.push(ATYP_IPV4);
                        out.extend_from_slice(&ip.octets());
                    }
                    VlessAddress::Ipv6(ip) => {
                        out.push(ATYP_IPV6);
                        out.extend_from_slice(&ip.octets());
                    }
                    VlessAddress::Domain(d) => {
                        out.push(ATYP_DOMAIN);
                        out.push(d.len() as u8);
                        out.extend_from_slice(d.as_bytes());
                    }
                }
            }
        }

        out.extend_from_slice(&self.payload);
        out
    }

    /// Build a request for an outbound dial, choosing the address encoding by probing.
    pub fn new_for_dial(
        uuid: Uuid,
        command: VlessCommand,
        host: &str,
        port: u16,
        payload: Vec<u8>,
    ) -> VlessRequest {
        VlessRequest {
            version: VERSION,
            uuid,
            command,
            address: VlessAddress::classify(host),
            port,
            payload,
        }
    }
}

/// Fixed 2-byte VLESS response header, emitted at most once, strictly before
/// any other server-to-client byte.
pub fn encode_response_header(version: u8) -> [u8; 2] {
    [version, 0x00]
}

/// Decode the payload of a UDP-command VLESS session into an ordered list of
/// sub-framed datagrams. A truncated trailing length or datagram is dropped.
pub fn decode_udp_chunks(mut payload: &[u8]) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    loop {
        if payload.len() < 2 {
            break;
        }
        let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if payload.len() < 2 + len {
            break;
        }
        datagrams.push(payload[2..2 + len].to_vec());
        payload = &payload[2 + len..];
    }
    datagrams
}

/// Encode a single UDP datagram as a length-prefixed VLESS sub-frame.
pub fn encode_udp_chunk(datagram: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + datagram.len());
    out.extend_from_slice(&(datagram.len() as u16).to_be_bytes());
    out.extend_from_slice(datagram);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_uuid() -> Uuid {
        Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap()
    }

    #[test]
    fn decode_ipv4_header() {
        let mut buf = vec![0x00];
        buf.extend_from_slice(sample_uuid().as_bytes());
        buf.push(0x00); // addon len
        buf.push(0x01); // tcp
        buf.extend_from_slice(&443u16.to_be_bytes());
        buf.push(0x01); // ipv4
        buf.extend_from_slice(&[93, 184, 216, 34]);
        buf.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");

        let req = VlessRequest::decode(&buf).unwrap();
        assert_eq!(req.version, 0);
        assert_eq!(req.uuid, sample_uuid());
        assert_eq!(req.command, VlessCommand::Tcp);
        assert_eq!(req.address, VlessAddress::Ipv4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(req.port, 443);
        assert_eq!(req.payload, b"GET / HTTP/1.0\r\n\r\n".to_vec());
    }

    #[test]
    fn decode_domain_header() {
        let mut buf = vec![0x00];
        buf.extend_from_slice(sample_uuid().as_bytes());
        buf.push(0x00);
        buf.push(0x01);
        buf.extend_from_slice(&80u16.to_be_bytes());
        buf.push(0x02); // domain
        buf.push(7);
        buf.extend_from_slice(b"example");

        let req = VlessRequest::decode(&buf).unwrap();
        assert_eq!(req.address, VlessAddress::Domain("example".to_string()));
        assert_eq!(req.port, 80);
        assert!(req.payload.is_empty());
    }

    #[test]
    fn short_header_is_error_not_panic() {
        let buf = vec![0u8; 10];
        assert!(VlessRequest::decode(&buf).is_err());
    }

    #[test]
    fn truncated_address_is_error() {
        let mut buf = vec![0x00];
        buf.extend_from_slice(sample_uuid().as_bytes());
        buf.push(0x00);
        buf.push(0x01);
        buf.extend_from_slice(&80u16.to_be_bytes());
        buf.push(0x01); // ipv4 but no bytes follow
        assert!(VlessRequest::decode(&buf).is_err());
    }

    #[test]
    fn round_trip_ipv4() {
        let req = VlessRequest::new_for_dial(sample_uuid(), VlessCommand::Tcp, "1.2.3.4", 8080, b"hi".to_vec());
        let encoded = req.encode();
        let decoded = VlessRequest::decode(&encoded).unwrap();
        assert_eq!(decoded.address, req.address);
        assert_eq!(decoded.port, req.port);
        assert_eq!(decoded.payload, req.payload);
        assert_eq!(decoded.uuid, req.uuid);
    }

    #[test]
    fn round_trip_domain() {
        let req = VlessRequest::new_for_dial(sample_uuid(), VlessCommand::Tcp, "example.com", 443, vec![]);
        let decoded = VlessRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded.address, VlessAddress::Domain("example.com".to_string()));
    }

    #[test]
    fn domain_tie_break_encodes_as_ip() {
        let req = VlessRequest::new_for_dial(
            sample_uuid(),
            VlessCommand::Tcp,
            "not-an-ip",
            80,
            vec![],
        );
        // force a domain variant that happens to parse as IP
        let mut req = req;
        req.address = VlessAddress::Domain("127.0.0.1".to_string());
        let encoded = req.encode();
        let decoded = VlessRequest::decode(&encoded).unwrap();
        assert_eq!(decoded.address, VlessAddress::Ipv4(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn udp_subframe_round_trip() {
        let datagrams: Vec<Vec<u8>> = vec![b"abc".to_vec(), b"de".to_vec()];
        let mut payload = Vec::new();
        for d in &datagrams {
            payload.extend(encode_udp_chunk(d));
        }
        let decoded = decode_udp_chunks(&payload);
        assert_eq!(decoded, datagrams);
    }

    #[test]
    fn udp_subframe_truncated_tail_is_dropped() {
        let mut payload = encode_udp_chunk(b"abc");
        payload.extend(encode_udp_chunk(b"de"));
        payload.extend_from_slice(&3u16.to_be_bytes());
        payload.extend_from_slice(b"ab"); // truncated: declares len 3, only 2 bytes follow

        let decoded = decode_udp_chunks(&payload);
        assert_eq!(decoded, vec![b"abc".to_vec(), b"de".to_vec()]);
    }

    #[test]
    fn response_header_is_two_bytes() {
        assert_eq!(encode_response_header(0), [0x00, 0x00]);
    }
}
