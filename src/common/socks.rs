//! SOCKS5 protocol primitives (RFC 1928 subset + RFC 1929 username/password).

use super::addr::Address;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 command (CONNECT is the only one this gateway services).
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

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        match cmd {
            Command::Connect => CMD_CONNECT,
            Command::Bind => CMD_BIND,
            Command::UdpAssociate => CMD_UDP_ASSOCIATE,
        }
    }
}

/// Greeting: `VER NMETHODS METHODS[]`.
#[derive(Debug)]
pub struct AuthRequest {
    pub methods: Vec<u8>,
}

impl AuthRequest {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!("unsupported SOCKS version: {}", head[0])));
        }

        let mut methods = vec![0u8; head[1] as usize];
        reader.read_exact(&mut methods).await?;

        Ok(AuthRequest { methods })
    }

    pub fn supports(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

pub struct AuthResponse {
    pub method: u8,
}

impl AuthResponse {
    pub fn new(method: u8) -> Self {
        AuthResponse { method }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[SOCKS5_VERSION, self.method]).await?;
        Ok(())
    }
}

/// Request: `VER CMD RSV ATYP ADDR PORT`.
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 3];
        reader.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!("unsupported SOCKS version: {}", header[0])));
        }

        let command = Command::try_from(header[1])?;
        // header[2] is the reserved byte.
        let (address, port) = Address::read_from(reader).await?;

        Ok(Request { command, address, port })
    }
}

/// Reply: `VER REP RSV ATYP ADDR PORT`.
pub struct Response {
    pub reply: u8,
    pub address: Address,
    pub port: u16,
}

impl Response {
    pub fn success(address: Address, port: u16) -> Self {
        Response { reply: REP_SUCCEEDED, address, port }
    }

    pub fn failure(reply: u8) -> Self {
        Response {
            reply,
            address: Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[SOCKS5_VERSION, self.reply, 0x00]).await?;
        self.address.write_to(writer, self.port).await
    }
}

/// RFC 1929 username/password subnegotiation.
pub struct UsernamePasswordAuth {
    pub username: String,
    pub password: String,
}

impl UsernamePasswordAuth {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut version = [0u8; 1];
        reader.read_exact(&mut version).await?;

        if version[0] != 0x01 {
            return Err(Error::protocol("unsupported auth version"));
        }

        let mut ulen = [0u8; 1];
        reader.read_exact(&mut ulen).await?;
        let mut username = vec![0u8; ulen[0] as usize];
        reader.read_exact(&mut username).await?;

        let mut plen = [0u8; 1];
        reader.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        reader.read_exact(&mut password).await?;

        Ok(UsernamePasswordAuth {
            username: String::from_utf8_lossy(&username).to_string(),
            password: String::from_utf8_lossy(&password).to_string(),
        })
    }

    pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, success: bool) -> Result<()> {
        let status = if success { 0x00 } else { 0x01 };
        writer.write_all(&[0x01, status]).await?;
        Ok(())
    }
}
