use crate::SocketClient;
use crate::once::once;
use async_trait::async_trait;
use futures::future::BoxFuture;
use spark_socket::{
    CallContext, CallbackRegistry, ConnState, DatagramSocket, FuncError, FuncInfo, OperationKind,
    SocketAddress, SocketDescriptor, SocketError, run_with_context,
};
use spark_socket_config::ClientConfig;
use spark_socket_tls::TlsConfig;
use std::fmt;
use std::io;
use tokio::io::AsyncRead;

/// UDP / Unix 数据报客户端。
///
/// `connect` 只固定对端地址，不产生网络往返；每次 `write` 发送一个数据报，
/// 每次 `read` 接收一个数据报。TLS 配置被忽略。
pub struct DatagramClient {
    descriptor: SocketDescriptor,
    callbacks: CallbackRegistry,
    socket: Option<DatagramSocket>,
    local: SocketAddress,
    remote: SocketAddress,
}

impl DatagramClient {
    pub fn new(config: &ClientConfig) -> Result<Self, SocketError> {
        if !config.network.is_datagram() {
            return Err(SocketError::InvalidProtocol {
                network: config.network.to_string(),
            });
        }
        config.validate()?;
        Ok(Self {
            descriptor: config.descriptor(),
            callbacks: CallbackRegistry::new(),
            socket: None,
            local: SocketAddress::Unspecified,
            remote: SocketAddress::Unspecified,
        })
    }

    pub async fn once<R, F>(
        &mut self,
        ctx: &CallContext,
        request: Option<R>,
        on_response: Option<F>,
    ) -> Result<(), SocketError>
    where
        R: AsyncRead + Unpin + Send,
        F: for<'c> FnOnce(&'c mut DatagramClient) -> BoxFuture<'c, Result<(), SocketError>>
            + Send,
    {
        once(self, ctx, request, on_response).await
    }

    async fn dial(&self, ctx: &CallContext) -> Result<DatagramSocket, SocketError> {
        if self.descriptor.network.is_unix() {
            return self.dial_unix(ctx);
        }
        let target = self.descriptor.dial_target()?;
        run_with_context(ctx, OperationKind::CONNECT, async {
            let peer = tokio::net::lookup_host(target.as_str())
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
                })?;
            DatagramSocket::connect_udp(peer).await
        })
        .await
    }

    #[cfg(unix)]
    fn dial_unix(&self, ctx: &CallContext) -> Result<DatagramSocket, SocketError> {
        if ctx.is_done() {
            return Err(crate::stream::context_error(ctx, OperationKind::CONNECT));
        }
        let path = self.descriptor.unix_path()?;
        DatagramSocket::connect_unix(path).map_err(|err| SocketError::io(OperationKind::CONNECT, err))
    }

    #[cfg(not(unix))]
    fn dial_unix(&self, _ctx: &CallContext) -> Result<DatagramSocket, SocketError> {
        Err(SocketError::InvalidProtocol {
            network: self.descriptor.network.to_string(),
        })
    }

    fn fail(&self, err: SocketError) -> SocketError {
        self.callbacks.emit_error(&err);
        err
    }
}

impl fmt::Debug for DatagramClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramClient")
            .field("descriptor", &self.descriptor)
            .field("connected", &self.socket.is_some())
            .field("remote", &self.remote)
            .finish()
    }
}

#[async_trait]
impl SocketClient for DatagramClient {
    fn register_func_error(&self, func: Option<FuncError>) {
        self.callbacks.register_func_error(func);
    }

    fn register_func_info(&self, func: Option<FuncInfo>) {
        self.callbacks.register_func_info(func);
    }

    fn set_tls(
        &self,
        _enable: bool,
        _config: Option<&TlsConfig>,
        _server_name: &str,
    ) -> Result<(), SocketError> {
        tracing::debug!("tls ignored on datagram client");
        Ok(())
    }

    async fn connect(&mut self, ctx: &CallContext) -> Result<(), SocketError> {
        self.socket = None;
        self.callbacks
            .emit_info(&SocketAddress::Unspecified, &SocketAddress::Unspecified, ConnState::Dial);
        let socket = self.dial(ctx).await.map_err(|err| self.fail(err))?;
        self.local = socket.local_addr();
        self.remote = socket.peer_addr();
        tracing::debug!(
            network = %self.descriptor.network,
            remote = %self.remote,
            "datagram client connected"
        );
        self.callbacks
            .emit_info(&self.local, &self.remote, ConnState::New);
        self.socket = Some(socket);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.callbacks
            .emit_info(&self.local, &self.remote, ConnState::Read);
        let Some(socket) = self.socket.as_ref() else {
            return Err(SocketError::Connection);
        };
        let result = socket.recv(buf).await;
        result.map_err(|err| self.fail(SocketError::io(OperationKind::READ, err)))
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        self.callbacks
            .emit_info(&self.local, &self.remote, ConnState::Write);
        let Some(socket) = self.socket.as_ref() else {
            return Err(SocketError::Connection);
        };
        let result = socket.send(buf).await;
        result.map_err(|err| self.fail(SocketError::io(OperationKind::WRITE, err)))
    }

    async fn close(&mut self) -> Result<(), SocketError> {
        self.callbacks
            .emit_info(&self.local, &self.remote, ConnState::Close);
        match self.socket.take() {
            Some(_) => Ok(()),
            None => Err(SocketError::Connection),
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.as_ref().is_some_and(DatagramSocket::probe)
    }

    fn local_addr(&self) -> SocketAddress {
        self.local.clone()
    }

    fn peer_addr(&self) -> SocketAddress {
        self.remote.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_socket::NetworkProtocol;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    #[tokio::test(flavor = "multi_thread")]
    async fn udp_round_trip_against_plain_socket() -> anyhow::Result<()> {
        let server = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = server.local_addr()?;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((len, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(&buf[..len], peer).await;
            }
        });

        let config = ClientConfig::new(NetworkProtocol::Udp, addr.to_string());
        let mut client = DatagramClient::new(&config)?;
        client.set_tls(true, None, "localhost")?;
        client.connect(&CallContext::background()).await?;
        assert!(client.is_connected());
        assert_eq!(client.peer_addr(), SocketAddress::Inet(addr));

        client.write(b"datagram").await?;
        let mut buf = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await??;
        assert_eq!(&buf[..len], b"datagram");

        client.close().await?;
        assert!(!client.is_connected());
        assert!(matches!(client.close().await, Err(SocketError::Connection)));
        Ok(())
    }

    #[test]
    fn stream_networks_are_rejected() {
        let config = ClientConfig::new(NetworkProtocol::Tcp, "127.0.0.1:1");
        assert!(matches!(
            DatagramClient::new(&config),
            Err(SocketError::InvalidProtocol { .. })
        ));
    }
}
