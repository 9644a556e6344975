//! SOCKS5 client handshake (RFC 1928, RFC 1929).
//!
//! Hostnames are always sent as ATYP `0x03` so resolution happens inside
//! Tor; only IP literals use the address forms.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use super::ProxyError;
use super::target::TargetHost;

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// Non-success reply from the SOCKS server, including Tor's onion-service
/// extended codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksReply {
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    OnionDescriptorNotFound,
    OnionDescriptorInvalid,
    OnionIntroFailed,
    OnionRendezvousFailed,
    OnionMissingClientAuth,
    OnionWrongClientAuth,
    OnionBadAddress,
    OnionIntroTimedOut,
    Other(u8),
}

impl SocksReply {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => SocksReply::GeneralFailure,
            0x02 => SocksReply::NotAllowed,
            0x03 => SocksReply::NetworkUnreachable,
            0x04 => SocksReply::HostUnreachable,
            0x05 => SocksReply::ConnectionRefused,
            0x06 => SocksReply::TtlExpired,
            0x07 => SocksReply::CommandNotSupported,
            0x08 => SocksReply::AddressTypeNotSupported,
            0xF0 => SocksReply::OnionDescriptorNotFound,
            0xF1 => SocksReply::OnionDescriptorInvalid,
            0xF2 => SocksReply::OnionIntroFailed,
            0xF3 => SocksReply::OnionRendezvousFailed,
            0xF4 => SocksReply::OnionMissingClientAuth,
            0xF5 => SocksReply::OnionWrongClientAuth,
            0xF6 => SocksReply::OnionBadAddress,
            0xF7 => SocksReply::OnionIntroTimedOut,
            other => SocksReply::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            SocksReply::GeneralFailure => 0x01,
            SocksReply::NotAllowed => 0x02,
            SocksReply::NetworkUnreachable => 0x03,
            SocksReply::HostUnreachable => 0x04,
            SocksReply::ConnectionRefused => 0x05,
            SocksReply::TtlExpired => 0x06,
            SocksReply::CommandNotSupported => 0x07,
            SocksReply::AddressTypeNotSupported => 0x08,
            SocksReply::OnionDescriptorNotFound => 0xF0,
            SocksReply::OnionDescriptorInvalid => 0xF1,
            SocksReply::OnionIntroFailed => 0xF2,
            SocksReply::OnionRendezvousFailed => 0xF3,
            SocksReply::OnionMissingClientAuth => 0xF4,
            SocksReply::OnionWrongClientAuth => 0xF5,
            SocksReply::OnionBadAddress => 0xF6,
            SocksReply::OnionIntroTimedOut => 0xF7,
            SocksReply::Other(code) => *code,
        }
    }
}

impl fmt::Display for SocksReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SocksReply::GeneralFailure => "general failure",
            SocksReply::NotAllowed => "connection not allowed by ruleset",
            SocksReply::NetworkUnreachable => "network unreachable",
            SocksReply::HostUnreachable => "host unreachable",
            SocksReply::ConnectionRefused => "connection refused by destination",
            SocksReply::TtlExpired => "TTL expired",
            SocksReply::CommandNotSupported => "command not supported",
            SocksReply::AddressTypeNotSupported => "address type not supported",
            SocksReply::OnionDescriptorNotFound => "onion service descriptor not found",
            SocksReply::OnionDescriptorInvalid => "onion service descriptor is invalid",
            SocksReply::OnionIntroFailed => "onion service introduction failed",
            SocksReply::OnionRendezvousFailed => "onion service rendezvous failed",
            SocksReply::OnionMissingClientAuth => "onion service requires client authorization",
            SocksReply::OnionWrongClientAuth => "onion service client authorization rejected",
            SocksReply::OnionBadAddress => "invalid onion address",
            SocksReply::OnionIntroTimedOut => "onion service introduction timed out",
            SocksReply::Other(code) => return write!(f, "unknown reply 0x{code:02x}"),
        };
        write!(f, "{text} (0x{:02x})", self.code())
    }
}

/// RFC 1929 credentials. Tor uses distinct credentials as a circuit
/// isolation key.
#[derive(Clone)]
pub struct SocksAuth {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl fmt::Debug for SocksAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn tunnel_err(msg: impl Into<String>) -> ProxyError {
    ProxyError::Tunnel(msg.into())
}

fn io_err(e: std::io::Error) -> ProxyError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => tunnel_err("SOCKS server closed the connection"),
        _ => ProxyError::Io(e.to_string()),
    }
}

/// Encode the CONNECT request for `host:port`.
pub fn encode_connect(host: &TargetHost, port: u16) -> Result<Vec<u8>, ProxyError> {
    let mut buf = vec![VERSION, CMD_CONNECT, 0x00];
    match host {
        TargetHost::Ipv4(addr) => {
            buf.push(ATYP_V4);
            buf.extend_from_slice(&addr.octets());
        }
        TargetHost::Ipv6(addr) => {
            buf.push(ATYP_V6);
            buf.extend_from_slice(&addr.octets());
        }
        TargetHost::Domain(_) | TargetHost::Onion(_) => {
            let name = host.hostname();
            let len = u8::try_from(name.len()).map_err(|_| {
                ProxyError::InvalidTarget(format!("hostname longer than 255 bytes: {name}"))
            })?;
            buf.push(ATYP_DOMAIN);
            buf.push(len);
            buf.extend_from_slice(name.as_bytes());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(buf)
}

fn encode_user_pass(auth: &SocksAuth) -> Result<Zeroizing<Vec<u8>>, ProxyError> {
    let user = auth.username.as_bytes();
    let pass = auth.password.as_bytes();
    let (Ok(ulen), Ok(plen)) = (u8::try_from(user.len()), u8::try_from(pass.len())) else {
        return Err(tunnel_err("SOCKS credentials longer than 255 bytes"));
    };
    let mut buf = Zeroizing::new(Vec::with_capacity(3 + user.len() + pass.len()));
    buf.push(0x01);
    buf.push(ulen);
    buf.extend_from_slice(user);
    buf.push(plen);
    buf.extend_from_slice(pass);
    Ok(buf)
}

/// Negotiate a CONNECT tunnel to `host:port` over `stream`.
pub async fn handshake<S>(
    stream: &mut S,
    host: &TargetHost,
    port: u16,
    auth: Option<&SocksAuth>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = encode_connect(host, port)?;

    let greeting: &[u8] = match auth {
        Some(_) => &[VERSION, 1, METHOD_USER_PASS],
        None => &[VERSION, 1, METHOD_NONE],
    };
    stream.write_all(greeting).await.map_err(io_err)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(io_err)?;
    if choice[0] != VERSION {
        return Err(tunnel_err(format!("not a SOCKS5 server (version {})", choice[0])));
    }
    match (choice[1], auth) {
        (METHOD_NONE, _) => {}
        (METHOD_USER_PASS, Some(auth)) => {
            stream
                .write_all(&encode_user_pass(auth)?)
                .await
                .map_err(io_err)?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await.map_err(io_err)?;
            if status[1] != 0x00 {
                return Err(tunnel_err("SOCKS authentication rejected"));
            }
        }
        (METHOD_UNACCEPTABLE, _) => {
            return Err(tunnel_err("SOCKS server accepted none of the offered methods"));
        }
        (other, _) => {
            return Err(tunnel_err(format!("SOCKS server chose unsupported method {other}")));
        }
    }

    stream.write_all(&request).await.map_err(io_err)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(io_err)?;
    if head[0] != VERSION {
        return Err(tunnel_err(format!("bad SOCKS reply version {}", head[0])));
    }
    if head[1] != 0x00 {
        return Err(ProxyError::Socks(SocksReply::from_code(head[1])));
    }

    // Discard the bound address
    let addr_len = match head[3] {
        ATYP_V4 => 4,
        ATYP_V6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io_err)?;
            usize::from(len[0])
        }
        other => return Err(tunnel_err(format!("bad SOCKS bound address type {other}"))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await.map_err(io_err)?;
    Ok(())
}
