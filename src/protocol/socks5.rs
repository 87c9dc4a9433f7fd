//! SOCKS5 (RFC 1928 subset): v5-only greeting, CONNECT + UDP ASSOCIATE, no auth.
//!
//! Grounded in `common/socks.rs`, trimmed to the subset this system speaks:
//! username/password auth is dropped (the engine only ever advertises
//! no-auth back, regardless of what the client offers).

use super::super::common::net::Address;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_NO_AUTH: u8 = 0x00;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_BIND => Ok(Command::Bind),
            CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            _ => Err(Error::protocol(format!("unknown SOCKS5 command: {}", value))),
        }
    }
}

/// SOCKS5 greeting: `{0x05, nMethods, method...}`.
#[derive(Debug)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!("unsupported SOCKS version: {}", head[0])));
        }

        let mut methods = vec![0u8; head[1] as usize];
        reader.read_exact(&mut methods).await?;
        Ok(Greeting { methods })
    }

    /// Reply accepting no-auth, regardless of the offered method list.
    pub async fn accept_no_auth<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
        writer.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;
        Ok(())
    }
}

/// SOCKS5 request: `{0x05, CMD, 0x00, ATYP, addr, port}`.
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!("unsupported SOCKS version: {}", header[0])));
        }

        let command = Command::try_from(header[1])?;
        let (address, port) = read_address_and_port(reader, header[3]).await?;

        Ok(Request {
            command,
            address,
            port,
        })
    }
}

async fn read_address_and_port<R: AsyncRead + Unpin>(
    reader: &mut R,
    atyp: u8,
) -> Result<(Address, u16)> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            reader.read_exact(&mut buf).await?;
            let addr = Address::Ipv4(std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok((addr, port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            reader.read_exact(&mut len).await?;
            let len = len[0] as usize;
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            buf.truncate(len);
            let domain =
                String::from_utf8(buf).map_err(|e| Error::protocol(format!("invalid domain: {}", e)))?;
            Ok((Address::Domain(domain), port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            reader.read_exact(&mut buf).await?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[..16]);
            let addr = Address::Ipv6(std::net::Ipv6Addr::from(ip));
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok((addr, port))
        }
        t => Err(Error::protocol(format!("unknown address type: {}", t))),
    }
}

/// SOCKS5 reply: `{0x05, REP, 0x00, ATYP=0x01, 4 addr bytes, 2 port bytes}`.
///
/// Always emitted with an IPv4 BND.ADDR per the spec (zero is acceptable for
/// CONNECT); this implementation never has a real local bind address to
/// report for a CONNECT reply, so it always reports `0.0.0.0:0` on success
/// and only the UDP ASSOCIATE path fills in a real bound address.
pub struct Response {
    pub reply: u8,
    pub address: Address,
    pub port: u16,
}

impl Response {
    pub fn success(address: Address, port: u16) -> Self {
        Response {
            reply: REP_SUCCEEDED,
            address,
            port,
        }
    }

    pub fn failure(reply: u8) -> Self {
        Response {
            reply,
            address: Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    /// Generic failure reply for a version mismatch in the initial greeting:
    /// `{0x05, 0x01, 0x00, 0x01, 0,0,0,0, 0,0}`.
    pub fn version_mismatch() -> Self {
        Self::failure(REP_GENERAL_FAILURE)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        match &self.address {
            Address::Ipv4(ip) => {
                let mut buf = [0u8; 10];
                buf[0] = SOCKS5_VERSION;
                buf[1] = self.reply;
                buf[2] = 0x00;
                buf[3] = ATYP_IPV4;
                buf[4..8].copy_from_slice(&ip.octets());
                buf[8..10].copy_from_slice(&self.port.to_be_bytes());
                writer.write_all(&buf).await?;
                Ok(())
            }
            Address::Ipv6(ip) => {
                let mut buf = [0u8; 22];
                buf[0] = SOCKS5_VERSION;
                buf[1] = self.reply;
                buf[2] = 0x00;
                buf[3] = ATYP_IPV6;
                buf[4..20].copy_from_slice(&ip.octets());
                buf[20..22].copy_from_slice(&self.port.to_be_bytes());
                writer.write_all(&buf).await?;
                Ok(())
            }
            Address::Domain(domain) => {
                let mut buf = Vec::with_capacity(5 + domain.len() + 2);
                buf.extend_from_slice(&[SOCKS5_VERSION, self.reply, 0x00, ATYP_DOMAIN]);
                let bytes = domain.as_bytes();
                if bytes.len() > 255 {
                    return Err(Error::address("domain name too long"));
                }
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
                buf.extend_from_slice(&self.port.to_be_bytes());
                writer.write_all(&buf).await?;
                Ok(())
            }
        }
    }
}

/// SOCKS5 UDP relay header: `{0x00 0x00, FRAG, ATYP, addr, port, payload}`.
#[derive(Debug)]
pub struct UdpHeader {
    pub frag: u8,
    pub address: Address,
    pub port: u16,
}

impl UdpHeader {
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 10 {
            return Err(Error::protocol("UDP header too short"));
        }

        let frag = data[2];
        let atyp = data[3];
        let (address, addr_len) = match atyp {
            ATYP_IPV4 => {
                let ip = std::net::Ipv4Addr::new(data[4], data[5], data[6], data[7]);
                (Address::Ipv4(ip), 4)
            }
            ATYP_DOMAIN => {
                let len = data[4] as usize;
                if data.len() < 5 + len + 2 {
                    return Err(Error::protocol("UDP header too short for domain"));
                }
                let domain = String::from_utf8_lossy(&data[5..5 + len]).to_string();
                (Address::Domain(domain), 1 + len)
            }
            ATYP_IPV6 => {
                if data.len() < 22 {
                    return Err(Error::protocol("UDP header too short for IPv6"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[4..20]);
                (Address::Ipv6(std::net::Ipv6Addr::from(octets)), 16)
            }
            _ => return Err(Error::protocol(format!("unknown address type: {}", atyp))),
        };

        let port_offset = 4 + addr_len;
        if data.len() < port_offset + 2 {
            return Err(Error::protocol("UDP header missing port"));
        }
        let port = u16::from_be_bytes([data[port_offset], data[port_offset + 1]]);

        Ok((
            UdpHeader {
                frag,
                address,
                port,
            },
            port_offset + 2,
        ))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.address.len() + 4);
        buf.extend_from_slice(&[0x00, 0x00, self.frag]);

        match &self.address {
            Address::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let bytes = domain.as_bytes();
                buf.push(ATYP_DOMAIN);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }

        buf.extend_from_slice(&self.port.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::try_from(0x01).unwrap(), Command::Connect);
        assert_eq!(Command::try_from(0x03).unwrap(), Command::UdpAssociate);
        assert!(Command::try_from(0x7f).is_err());
    }

    #[test]
    fn test_udp_header_round_trip() {
        let header = UdpHeader {
            frag: 0,
            address: Address::Ipv4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
            port: 8080,
        };

        let bytes = header.to_bytes();
        let (parsed, len) = UdpHeader::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.frag, 0);
        assert_eq!(parsed.port, 8080);
        assert_eq!(len, bytes.len());
        assert!(matches!(parsed.address, Address::Ipv4(_)));
    }

    #[tokio::test]
    async fn connect_request_ipv4_round_trip() {
        let bytes: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50];
        let mut cursor = std::io::Cursor::new(bytes);
        let req = Request::read_from(&mut cursor).await.unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.port, 80);
        assert_eq!(req.address, Address::Ipv4(std::net::Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[tokio::test]
    async fn success_reply_is_fixed_ipv4_zero() {
        let mut out = Vec::new();
        Response::success(Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED), 0)
            .write_to(&mut out)
            .await
            .unwrap();
        assert_eq!(out, vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
