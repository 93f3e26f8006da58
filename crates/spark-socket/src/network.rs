use crate::error::SocketError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 框架支持的四类传输协议。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    Tcp,
    Udp,
    Unix,
    #[serde(rename = "unixgram")]
    UnixGram,
}

impl NetworkProtocol {
    /// 面向连接的字节流传输。
    pub fn is_stream(self) -> bool {
        matches!(self, NetworkProtocol::Tcp | NetworkProtocol::Unix)
    }

    pub fn is_datagram(self) -> bool {
        !self.is_stream()
    }

    /// 基于文件系统路径寻址的 Unix 域传输。
    pub fn is_unix(self) -> bool {
        matches!(self, NetworkProtocol::Unix | NetworkProtocol::UnixGram)
    }

    /// 当前平台是否提供该传输。
    pub fn is_supported(self) -> bool {
        !self.is_unix() || cfg!(unix)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NetworkProtocol::Tcp => "tcp",
            NetworkProtocol::Udp => "udp",
            NetworkProtocol::Unix => "unix",
            NetworkProtocol::UnixGram => "unixgram",
        }
    }
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkProtocol {
    type Err = SocketError;

    /// 接受 `tcp4`/`tcp6`/`udp4`/`udp6` 等族别后缀，统一折叠为协议本身。
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(NetworkProtocol::Tcp),
            "udp" | "udp4" | "udp6" => Ok(NetworkProtocol::Udp),
            "unix" => Ok(NetworkProtocol::Unix),
            "unixgram" => Ok(NetworkProtocol::UnixGram),
            _ => Err(SocketError::InvalidProtocol {
                network: value.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_family_suffixes() {
        assert_eq!("TCP6".parse::<NetworkProtocol>().ok(), Some(NetworkProtocol::Tcp));
        assert_eq!("udp4".parse::<NetworkProtocol>().ok(), Some(NetworkProtocol::Udp));
        assert_eq!(
            "unixgram".parse::<NetworkProtocol>().ok(),
            Some(NetworkProtocol::UnixGram)
        );
        assert!(matches!(
            "sctp".parse::<NetworkProtocol>(),
            Err(SocketError::InvalidProtocol { .. })
        ));
    }

    #[test]
    fn classifies_transports() {
        assert!(NetworkProtocol::Tcp.is_stream());
        assert!(NetworkProtocol::Unix.is_stream());
        assert!(NetworkProtocol::Udp.is_datagram());
        assert!(NetworkProtocol::UnixGram.is_unix());
        assert!(NetworkProtocol::Tcp.is_supported());
        assert_eq!(NetworkProtocol::UnixGram.to_string(), "unixgram");
    }
}
