use spark_socket::SocketAddress;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::TlsStream;

/// 明文 TCP、Unix 流或 TLS 流的统一字节流。
pub enum StreamConn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl StreamConn {
    pub fn local_addr(&self) -> SocketAddress {
        let result = match self {
            StreamConn::Tcp(stream) => stream.local_addr().map(SocketAddress::from),
            #[cfg(unix)]
            StreamConn::Unix(stream) => stream.local_addr().map(SocketAddress::from),
            StreamConn::Tls(stream) => tcp_of(stream).local_addr().map(SocketAddress::from),
        };
        result.unwrap_or(SocketAddress::Unspecified)
    }

    pub fn peer_addr(&self) -> SocketAddress {
        let result = match self {
            StreamConn::Tcp(stream) => stream.peer_addr().map(SocketAddress::from),
            #[cfg(unix)]
            StreamConn::Unix(stream) => stream.peer_addr().map(SocketAddress::from),
            StreamConn::Tls(stream) => tcp_of(stream).peer_addr().map(SocketAddress::from),
        };
        result.unwrap_or(SocketAddress::Unspecified)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, StreamConn::Tls(_))
    }

    /// 零长度写探测连接是否仍可用；`WouldBlock` 视为可用。
    pub fn probe(&self) -> bool {
        let result = match self {
            StreamConn::Tcp(stream) => stream.try_write(&[]),
            #[cfg(unix)]
            StreamConn::Unix(stream) => stream.try_write(&[]),
            StreamConn::Tls(stream) => tcp_of(stream).try_write(&[]),
        };
        match result {
            Ok(_) => true,
            Err(err) => err.kind() == io::ErrorKind::WouldBlock,
        }
    }
}

impl fmt::Debug for StreamConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            StreamConn::Tcp(_) => "tcp",
            #[cfg(unix)]
            StreamConn::Unix(_) => "unix",
            StreamConn::Tls(_) => "tls",
        };
        f.debug_struct("StreamConn")
            .field("kind", &kind)
            .field("peer", &self.peer_addr())
            .finish()
    }
}

fn tcp_of(stream: &TlsStream<TcpStream>) -> &TcpStream {
    match stream {
        TlsStream::Client(stream) => stream.get_ref().0,
        TlsStream::Server(stream) => stream.get_ref().0,
    }
}

impl From<TcpStream> for StreamConn {
    fn from(stream: TcpStream) -> Self {
        StreamConn::Tcp(stream)
    }
}

#[cfg(unix)]
impl From<UnixStream> for StreamConn {
    fn from(stream: UnixStream) -> Self {
        StreamConn::Unix(stream)
    }
}

impl AsyncRead for StreamConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamConn::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            StreamConn::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            StreamConn::Tls(stream) => Pin::new(&mut **stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            StreamConn::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            StreamConn::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            StreamConn::Tls(stream) => Pin::new(&mut **stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamConn::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            StreamConn::Unix(stream) => Pin::new(stream).poll_flush(cx),
            StreamConn::Tls(stream) => Pin::new(&mut **stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamConn::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            StreamConn::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            StreamConn::Tls(stream) => Pin::new(&mut **stream).poll_shutdown(cx),
        }
    }
}
