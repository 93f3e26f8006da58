use spark_socket::{OperationKind, SocketAddress, SocketDescriptor, SocketError};
#[cfg(unix)]
use spark_socket::UnixSocketFile;
use spark_socket_tls::StreamConn;
use std::io;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

/// 流式监听器：TCP 或 Unix 流。
///
/// # 契约（What）
/// - `bind` 成功返回时套接字已可接受连接；Unix 变体已清理残留文件并应用权限与属组；
/// - `accept` 返回未经 TLS 握手的原始连接与对端地址；
/// - `close` 释放监听套接字，Unix 变体随之删除套接字文件。
#[derive(Debug)]
pub(crate) enum StreamListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        file: UnixSocketFile,
    },
}

impl StreamListener {
    pub(crate) async fn bind(descriptor: &SocketDescriptor) -> Result<Self, SocketError> {
        if !descriptor.network.is_unix() {
            let target = descriptor.listen_target()?;
            return TcpListener::bind(target.as_str())
                .await
                .map(StreamListener::Tcp)
                .map_err(|err| SocketError::io(OperationKind::BIND, err));
        }
        Self::bind_unix(descriptor)
    }

    #[cfg(unix)]
    fn bind_unix(descriptor: &SocketDescriptor) -> Result<Self, SocketError> {
        let file = UnixSocketFile::new(descriptor.unix_path()?);
        file.remove_stale()?;
        let listener =
            UnixListener::bind(file.path()).map_err(|err| SocketError::io(OperationKind::BIND, err))?;
        if let Err(err) = file.apply(descriptor.permissions, descriptor.group) {
            drop(listener);
            file.remove();
            return Err(err);
        }
        Ok(StreamListener::Unix { listener, file })
    }

    #[cfg(not(unix))]
    fn bind_unix(descriptor: &SocketDescriptor) -> Result<Self, SocketError> {
        Err(SocketError::InvalidProtocol {
            network: descriptor.network.to_string(),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddress {
        match self {
            StreamListener::Tcp(listener) => listener
                .local_addr()
                .map(SocketAddress::from)
                .unwrap_or(SocketAddress::Unspecified),
            #[cfg(unix)]
            StreamListener::Unix { file, .. } => {
                SocketAddress::Unix(Some(file.path().to_path_buf()))
            }
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<(StreamConn, SocketAddress)> {
        match self {
            StreamListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((StreamConn::from(stream), SocketAddress::from(peer)))
            }
            #[cfg(unix)]
            StreamListener::Unix { listener, .. } => {
                let (stream, peer) = listener.accept().await?;
                Ok((StreamConn::from(stream), SocketAddress::from(peer)))
            }
        }
    }

    pub(crate) fn close(self) {
        match self {
            StreamListener::Tcp(listener) => drop(listener),
            #[cfg(unix)]
            StreamListener::Unix { listener, file } => {
                drop(listener);
                file.remove();
            }
        }
    }
}
