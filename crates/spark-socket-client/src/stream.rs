use crate::SocketClient;
use crate::once::once;
use async_trait::async_trait;
use futures::future::BoxFuture;
use spark_socket::{
    CallContext, CallbackRegistry, ConnState, FuncError, FuncInfo, OperationKind, SocketAddress,
    SocketDescriptor, SocketError, run_with_context,
};
use spark_socket_config::ClientConfig;
use spark_socket_tls::{ClientTlsBinding, StreamConn, TlsConfig};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// TCP / Unix 流客户端。
///
/// # 逻辑（How）
/// - 拨号在 [`run_with_context`] 中执行，继承取消与截止语义；
/// - TCP 连接建立后按当前 TLS 绑定决定是否握手，握手同样受上下文约束；
/// - 本端/对端地址在连接成功时记录，供事件回调使用。
pub struct StreamClient {
    descriptor: SocketDescriptor,
    tls: ClientTlsBinding,
    callbacks: CallbackRegistry,
    conn: Option<StreamConn>,
    local: SocketAddress,
    remote: SocketAddress,
}

impl StreamClient {
    pub fn new(config: &ClientConfig, default_tls: Option<TlsConfig>) -> Result<Self, SocketError> {
        if !config.network.is_stream() {
            return Err(SocketError::InvalidProtocol {
                network: config.network.to_string(),
            });
        }
        let mut config = config.clone();
        if config.tls.config.is_none() {
            config.tls.config = default_tls;
        }
        config.validate()?;

        let client = Self {
            descriptor: config.descriptor(),
            tls: ClientTlsBinding::new(),
            callbacks: CallbackRegistry::new(),
            conn: None,
            local: SocketAddress::Unspecified,
            remote: SocketAddress::Unspecified,
        };
        if config.tls.enable {
            client.set_tls(true, config.tls.config.as_ref(), &config.server_name())?;
        }
        Ok(client)
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_enabled()
    }

    pub async fn once<R, F>(
        &mut self,
        ctx: &CallContext,
        request: Option<R>,
        on_response: Option<F>,
    ) -> Result<(), SocketError>
    where
        R: AsyncRead + Unpin + Send,
        F: for<'c> FnOnce(&'c mut StreamClient) -> BoxFuture<'c, Result<(), SocketError>> + Send,
    {
        once(self, ctx, request, on_response).await
    }

    /// 拨号前可知的对端地址，仅用于 `Dial` 事件。
    fn dial_address(&self) -> SocketAddress {
        if let Ok(path) = self.descriptor.unix_path() {
            return SocketAddress::Unix(Some(path.to_path_buf()));
        }
        self.descriptor
            .dial_target()
            .ok()
            .and_then(|target| target.parse::<SocketAddr>().ok())
            .map(SocketAddress::Inet)
            .unwrap_or(SocketAddress::Unspecified)
    }

    async fn dial(&self, ctx: &CallContext) -> Result<StreamConn, SocketError> {
        if self.descriptor.network.is_unix() {
            return self.dial_unix(ctx).await;
        }
        let target = self.descriptor.dial_target()?;
        let stream =
            run_with_context(ctx, OperationKind::CONNECT, TcpStream::connect(target.as_str()))
                .await?;
        if !self.tls.is_enabled() {
            return Ok(StreamConn::Tcp(stream));
        }
        tokio::select! {
            biased;
            _ = ctx.done() => Err(context_error(ctx, OperationKind::HANDSHAKE)),
            conn = self.tls.connect(stream) => conn,
        }
    }

    #[cfg(unix)]
    async fn dial_unix(&self, ctx: &CallContext) -> Result<StreamConn, SocketError> {
        let path = self.descriptor.unix_path()?;
        run_with_context(
            ctx,
            OperationKind::CONNECT,
            tokio::net::UnixStream::connect(path),
        )
        .await
        .map(StreamConn::from)
    }

    #[cfg(not(unix))]
    async fn dial_unix(&self, _ctx: &CallContext) -> Result<StreamConn, SocketError> {
        Err(SocketError::InvalidProtocol {
            network: self.descriptor.network.to_string(),
        })
    }

    fn fail(&self, err: SocketError) -> SocketError {
        self.callbacks.emit_error(&err);
        err
    }
}

pub(crate) fn context_error(ctx: &CallContext, kind: OperationKind) -> SocketError {
    if ctx.cancellation().is_cancelled() {
        SocketError::Cancelled { kind }
    } else {
        SocketError::Timeout { kind }
    }
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("descriptor", &self.descriptor)
            .field("tls", &self.tls)
            .field("connected", &self.conn.is_some())
            .field("remote", &self.remote)
            .finish()
    }
}

#[async_trait]
impl SocketClient for StreamClient {
    fn register_func_error(&self, func: Option<FuncError>) {
        self.callbacks.register_func_error(func);
    }

    fn register_func_info(&self, func: Option<FuncInfo>) {
        self.callbacks.register_func_info(func);
    }

    fn set_tls(
        &self,
        enable: bool,
        config: Option<&TlsConfig>,
        server_name: &str,
    ) -> Result<(), SocketError> {
        if self.descriptor.network.is_unix() {
            tracing::debug!("tls ignored on unix stream client");
            return Ok(());
        }
        self.tls.configure(enable, config, server_name)
    }

    async fn connect(&mut self, ctx: &CallContext) -> Result<(), SocketError> {
        if let Some(mut previous) = self.conn.take() {
            if let Err(err) = previous.shutdown().await {
                self.callbacks
                    .emit_error(&SocketError::io(OperationKind::SHUTDOWN, err));
            }
            tracing::debug!(remote = %self.remote, "replaced previous connection");
        }
        let target = self.dial_address();
        self.callbacks
            .emit_info(&SocketAddress::Unspecified, &target, ConnState::Dial);

        let conn = self.dial(ctx).await.map_err(|err| self.fail(err))?;
        self.local = conn.local_addr();
        self.remote = conn.peer_addr();
        tracing::debug!(
            network = %self.descriptor.network,
            remote = %self.remote,
            tls = conn.is_tls(),
            "client connected"
        );
        self.callbacks
            .emit_info(&self.local, &self.remote, ConnState::New);
        self.conn = Some(conn);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.callbacks
            .emit_info(&self.local, &self.remote, ConnState::Read);
        let Some(conn) = self.conn.as_mut() else {
            return Err(SocketError::Connection);
        };
        let result = conn.read(buf).await;
        match result {
            Ok(0) if !buf.is_empty() => {
                self.callbacks
                    .emit_info(&self.local, &self.remote, ConnState::CloseRead);
                Ok(0)
            }
            Ok(len) => Ok(len),
            Err(err) => Err(self.fail(SocketError::io(OperationKind::READ, err))),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        self.callbacks
            .emit_info(&self.local, &self.remote, ConnState::Write);
        let Some(conn) = self.conn.as_mut() else {
            return Err(SocketError::Connection);
        };
        let written = async {
            conn.write_all(buf).await?;
            conn.flush().await
        }
        .await;
        match written {
            Ok(()) => Ok(buf.len()),
            Err(err) => Err(self.fail(SocketError::io(OperationKind::WRITE, err))),
        }
    }

    async fn close(&mut self) -> Result<(), SocketError> {
        self.callbacks
            .emit_info(&self.local, &self.remote, ConnState::Close);
        let Some(mut conn) = self.conn.take() else {
            return Err(SocketError::Connection);
        };
        match conn.shutdown().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = self.fail(SocketError::io(OperationKind::SHUTDOWN, err));
                if err.is_closed() { Ok(()) } else { Err(err) }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(StreamConn::probe)
    }

    fn local_addr(&self) -> SocketAddress {
        self.local.clone()
    }

    fn peer_addr(&self) -> SocketAddress {
        self.remote.clone()
    }
}
