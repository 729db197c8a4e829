//! SOCKS-style address codec, shared by the Shadowsocks and SOCKS5 listeners.

use crate::{Error, Result};
use socket2::SockRef;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// A destination address: IPv4, IPv6, or a DNS name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// Decode a type-tagged address + port from the wire (§4.1).
    ///
    /// `ShortAddress` on a truncated read, `BadAddressType` for any tag outside
    /// {1,3,4}, `BadDomain` if the length byte overruns the buffer or the bytes
    /// are not valid UTF-8.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Self, u16)> {
        let mut atyp = [0u8; 1];
        read_exact_short(reader, &mut atyp).await?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                read_exact_short(reader, &mut buf).await?;
                let addr = Address::Ipv4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok((addr, port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                read_exact_short(reader, &mut len).await?;
                let len = len[0] as usize;
                let mut buf = vec![0u8; len + 2];
                read_exact_short(reader, &mut buf).await?;
                let domain = String::from_utf8(buf[..len].to_vec())
                    .map_err(|e| Error::bad_domain(e.to_string()))?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                Ok((Address::Domain(domain), port))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                read_exact_short(reader, &mut buf).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                let addr = Address::Ipv6(Ipv6Addr::from(ip));
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok((addr, port))
            }
            tag => Err(Error::bad_address_type(tag)),
        }
    }

    /// Decode from an in-memory buffer (used by the Shadowsocks codec, which
    /// decrypts a whole blob before parsing the address out of its prefix).
    /// Returns the address, port, and number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, u16, usize)> {
        if buf.is_empty() {
            return Err(Error::short_address("empty buffer"));
        }
        match buf[0] {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Err(Error::short_address("ipv4 address truncated"));
                }
                let addr = Address::Ipv4(Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]));
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((addr, port, 7))
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    return Err(Error::short_address("domain length truncated"));
                }
                let len = buf[1] as usize;
                if buf.len() < 2 + len + 2 {
                    return Err(Error::short_address("domain body truncated"));
                }
                let domain = String::from_utf8(buf[2..2 + len].to_vec())
                    .map_err(|e| Error::bad_domain(e.to_string()))?;
                let port = u16::from_be_bytes([buf[2 + len], buf[2 + len + 1]]);
                Ok((Address::Domain(domain), port, 2 + len + 2))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Err(Error::short_address("ipv6 address truncated"));
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let addr = Address::Ipv6(Ipv6Addr::from(ip));
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((addr, port, 19))
            }
            tag => Err(Error::bad_address_type(tag)),
        }
    }

    /// Encode a type-tagged address + port to the wire (§4.1, inverse of decode).
    pub fn encode(&self, port: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        match self {
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
        buf.extend_from_slice(&port.to_be_bytes());
        buf
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W, port: u16) -> Result<()> {
        writer.write_all(&self.encode(port)).await?;
        Ok(())
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 1 + 4 + 2,
            Address::Ipv6(_) => 1 + 16 + 2,
            Address::Domain(d) => 1 + 1 + d.len() + 2,
        }
    }

    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv4(ip) => format!("{}:{}", ip, port),
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            Address::Domain(d) => format!("{}:{}", d, port),
        }
    }

    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

/// Reads that come up short (including a clean EOF) map to `ShortAddress`
/// rather than the generic `io::Error` the teacher's net.rs surfaces.
async fn read_exact_short<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader
        .read_exact(buf)
        .await
        .map_err(|e| Error::short_address(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_len() {
        let ipv4 = Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(ipv4.len(), 7);

        let domain = Address::Domain("example.com".to_string());
        assert_eq!(domain.len(), 1 + 1 + 11 + 2);
    }

    #[test]
    fn test_roundtrip_ipv4() {
        let addr = Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1));
        let encoded = addr.encode(8080);
        let (decoded, port, consumed) = Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(port, 8080);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_roundtrip_domain() {
        let addr = Address::Domain("example.com".to_string());
        let encoded = addr.encode(443);
        let (decoded, port, consumed) = Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(port, 443);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_roundtrip_ipv6() {
        let addr = Address::Ipv6(Ipv6Addr::LOCALHOST);
        let encoded = addr.encode(9000);
        let (decoded, port, _) = Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(port, 9000);
    }

    #[test]
    fn test_decode_short_rejects_every_truncation() {
        let full = Address::Domain("example.com".to_string()).encode(443);
        for n in 0..full.len() {
            assert!(Address::decode(&full[..n]).is_err(), "expected error at len {}", n);
        }
    }

    #[test]
    fn test_decode_bad_address_type() {
        let buf = [0x02u8, 0, 0, 0, 0];
        match Address::decode(&buf) {
            Err(Error::BadAddressType(2)) => {}
            other => panic!("expected BadAddressType(2), got {:?}", other),
        }
    }

    #[test]
    fn test_decode_bad_domain_utf8() {
        let buf = [0x03u8, 2, 0xff, 0xfe, 0, 0];
        assert!(matches!(Address::decode(&buf), Err(Error::BadDomain(_))));
    }
}
