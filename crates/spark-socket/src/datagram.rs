use crate::address::SocketAddress;
use crate::error::{OperationKind, SocketError};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
#[cfg(unix)]
use tokio::net::UnixDatagram;

/// UDP 与 Unix 数据报套接字的统一封装。
///
/// 服务端通过 `recv_from`/`send_to` 与任意对端交互；客户端在 `connect` 后使用
/// `recv`/`send` 与固定对端交互。
#[derive(Debug)]
pub enum DatagramSocket {
    Udp(UdpSocket),
    #[cfg(unix)]
    Unix(UnixDatagram),
}

impl DatagramSocket {
    /// 绑定 UDP 监听地址。
    pub async fn bind_udp(target: &str) -> Result<Self, SocketError> {
        UdpSocket::bind(target)
            .await
            .map(DatagramSocket::Udp)
            .map_err(|err| SocketError::io(OperationKind::BIND, err))
    }

    /// 绑定与 `peer` 同族的临时端口并连接到 `peer`。
    pub async fn connect_udp(peer: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(DatagramSocket::Udp(socket))
    }

    #[cfg(unix)]
    pub fn bind_unix(path: &std::path::Path) -> Result<Self, SocketError> {
        UnixDatagram::bind(path)
            .map(DatagramSocket::Unix)
            .map_err(|err| SocketError::io(OperationKind::BIND, err))
    }

    /// 创建匿名 Unix 数据报套接字并连接到 `path`。
    #[cfg(unix)]
    pub fn connect_unix(path: &std::path::Path) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        Ok(DatagramSocket::Unix(socket))
    }

    pub fn local_addr(&self) -> SocketAddress {
        match self {
            DatagramSocket::Udp(socket) => socket
                .local_addr()
                .map(SocketAddress::from)
                .unwrap_or(SocketAddress::Unspecified),
            #[cfg(unix)]
            DatagramSocket::Unix(socket) => socket
                .local_addr()
                .map(SocketAddress::from)
                .unwrap_or(SocketAddress::Unix(None)),
        }
    }

    pub fn peer_addr(&self) -> SocketAddress {
        match self {
            DatagramSocket::Udp(socket) => socket
                .peer_addr()
                .map(SocketAddress::from)
                .unwrap_or(SocketAddress::Unspecified),
            #[cfg(unix)]
            DatagramSocket::Unix(socket) => socket
                .peer_addr()
                .map(SocketAddress::from)
                .unwrap_or(SocketAddress::Unix(None)),
        }
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddress)> {
        match self {
            DatagramSocket::Udp(socket) => socket
                .recv_from(buf)
                .await
                .map(|(len, peer)| (len, SocketAddress::from(peer))),
            #[cfg(unix)]
            DatagramSocket::Unix(socket) => socket
                .recv_from(buf)
                .await
                .map(|(len, peer)| (len, SocketAddress::from(peer))),
        }
    }

    /// 向指定对端发送；匿名 Unix 对端无法回复，返回 [`SocketError::Connection`]。
    pub async fn send_to(&self, buf: &[u8], peer: &SocketAddress) -> Result<usize, SocketError> {
        let result = match (self, peer) {
            (DatagramSocket::Udp(socket), SocketAddress::Inet(addr)) => {
                socket.send_to(buf, *addr).await
            }
            #[cfg(unix)]
            (DatagramSocket::Unix(socket), SocketAddress::Unix(Some(path))) => {
                socket.send_to(buf, path).await
            }
            _ => return Err(SocketError::Connection),
        };
        result.map_err(|err| SocketError::io(OperationKind::WRITE, err))
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DatagramSocket::Udp(socket) => socket.recv(buf).await,
            #[cfg(unix)]
            DatagramSocket::Unix(socket) => socket.recv(buf).await,
        }
    }

    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DatagramSocket::Udp(socket) => socket.send(buf).await,
            #[cfg(unix)]
            DatagramSocket::Unix(socket) => socket.send(buf).await,
        }
    }

    /// 零长度发送探测；`WouldBlock` 视为仍然可用。
    pub fn probe(&self) -> bool {
        let result = match self {
            DatagramSocket::Udp(socket) => socket.try_send(&[]),
            #[cfg(unix)]
            DatagramSocket::Unix(socket) => socket.try_send(&[]),
        };
        match result {
            Ok(_) => true,
            Err(err) => err.kind() == io::ErrorKind::WouldBlock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn udp_reply_reaches_sender() -> anyhow::Result<()> {
        let server = DatagramSocket::bind_udp("127.0.0.1:0").await?;
        let server_addr = server
            .local_addr()
            .as_inet()
            .ok_or_else(|| anyhow::anyhow!("UDP 监听地址应为 IP 地址"))?;
        let client = DatagramSocket::connect_udp(server_addr).await?;
        assert!(client.probe());

        client.send(b"ping").await?;
        let mut buf = [0u8; 16];
        let (len, peer) = server.recv_from(&mut buf).await?;
        assert_eq!(&buf[..len], b"ping");

        server.send_to(b"pong", &peer).await?;
        let len = client.recv(&mut buf).await?;
        assert_eq!(&buf[..len], b"pong");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn unnamed_unix_peer_cannot_be_answered() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gram.sock");
        let server = DatagramSocket::bind_unix(&path)?;
        let client = DatagramSocket::connect_unix(&path)?;
        client.send(b"hello").await?;

        let mut buf = [0u8; 16];
        let (len, peer) = server.recv_from(&mut buf).await?;
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(peer, SocketAddress::Unix(None));
        assert!(matches!(
            server.send_to(b"reply", &peer).await,
            Err(SocketError::Connection)
        ));
        Ok(())
    }
}
