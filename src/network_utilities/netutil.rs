//! Network utilities: stream framing and address prefix matching.

use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one length-prefixed DNS message from a TCP or TLS stream.
/// Returns `None` on a clean end of stream before the prefix.
pub async fn read_frame<S>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buffer = [0u8; 2];
    match stream.read_exact(&mut len_buffer).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let length = u16::from_be_bytes(len_buffer) as usize;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;

    Ok(Some(body))
}

/// Writes one length-prefixed DNS message to a TCP or TLS stream.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len_buffer = (payload.len() as u16).to_be_bytes();
    stream.write_all(&len_buffer).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;

    Ok(())
}

/// An address with a prefix length, e.g. `192.168.1.0/24` or a bare host
/// address. Used to scope conditional forwarding and policy rules to
/// client networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPrefix {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IpPrefix {
    pub fn new(addr: IpAddr, prefix_len: u8) -> IpPrefix {
        IpPrefix { addr, prefix_len }
    }

    /// A prefix covering exactly one host.
    pub fn host(addr: IpAddr) -> IpPrefix {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        IpPrefix { addr, prefix_len }
    }

    pub fn contains(&self, candidate: IpAddr) -> bool {
        match (self.addr, candidate) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = self.prefix_len.min(32) as u32;
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = self.prefix_len.min(128) as u32;
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpPrefix {
    type Err = std::net::AddrParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse()?;
                // A malformed length falls back to a host prefix.
                let max = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                let prefix_len = len.parse::<u8>().unwrap_or(max).min(max);
                Ok(IpPrefix { addr, prefix_len })
            }
            None => Ok(IpPrefix::host(input.parse()?)),
        }
    }
}

impl<'de> Deserialize<'de> for IpPrefix {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
