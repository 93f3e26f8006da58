use crate::handler::Handler;
use crate::listener::StreamListener;
use crate::session::Session;
use crate::shared::ServerCore;
use crate::{SocketServer, UpdateConn};
use async_trait::async_trait;
use socket2::SockRef;
use spark_socket::{
    CallContext, ConnState, ConnectionGuard, FileMode, FuncError, FuncInfo, FuncInfoServer,
    OperationKind, SocketAddress, SocketError, is_closed_error,
};
use spark_socket_config::ServerConfig;
use spark_socket_tls::{ServerTlsBinding, StreamConn, TlsAcceptor, TlsConfig};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// accept 出现非关闭类错误（如文件描述符耗尽）后的退避时间。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// TCP / Unix 流服务端。
///
/// # 意图（Why）
/// - 每个入站连接由独立任务服务，连接之间互不阻塞；
/// - TLS 终结、空闲超时与套接字定制在交给处理器之前完成，处理器只面对 [`Session`]。
///
/// # 逻辑（How）
/// - `listen`：校验描述 → 置位运行标记 → 同步绑定 → 记录本端地址 → 取 TLS 快照 → 派生 accept 循环；
/// - accept 循环在停止信号、监听上下文结束或监听套接字关闭时退出，
///   退出时删除 Unix 套接字文件并清除运行标记；
/// - 每个连接先登记 [`ConnectionGuard`]，连接任务结束时守卫析构，计数恰好扣减一次。
///
/// # 契约（What）
/// - 连接事件顺序：`New` → `Handler` →（处理器内的 `Read`/`Write`/`CloseRead`/`CloseWrite`）→ `Close`；
///   TLS 握手失败时只有 `New` → `Close`，处理器不会被调用；
/// - 处理器 panic 被捕获并经错误回调上报，连接照常计入关闭；
/// - `set_tls` 仅对 TCP 生效，Unix 流上为空操作。
pub struct StreamServer {
    core: Arc<ServerCore>,
    tls: ServerTlsBinding,
    idle_timeout: Option<Duration>,
}

impl StreamServer {
    pub fn new<H>(config: &ServerConfig, handler: H) -> Result<Self, SocketError>
    where
        H: Handler,
    {
        if !config.network.is_stream() {
            return Err(SocketError::InvalidProtocol {
                network: config.network.to_string(),
            });
        }
        config.validate()?;
        let server = Self {
            core: Arc::new(ServerCore::new(config.descriptor(), Arc::new(handler))),
            tls: ServerTlsBinding::new(),
            idle_timeout: config.idle_timeout(),
        };
        if config.tls.enable {
            server.set_tls(true, config.tls.config.as_ref())?;
        }
        Ok(server)
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_enabled()
    }

    fn is_unix(&self) -> bool {
        self.core.descriptor.load().network.is_unix()
    }
}

/// 未经 `shutdown` 直接丢弃时通知监听循环退出，由循环释放监听套接字并删除 Unix 套接字文件。
impl Drop for StreamServer {
    fn drop(&mut self) {
        self.core.state.begin_drain();
    }
}

impl fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamServer")
            .field("core", &self.core)
            .field("tls", &self.tls)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

#[async_trait]
impl SocketServer for StreamServer {
    fn register_func_error(&self, func: Option<FuncError>) {
        self.core.register_func_error(func);
    }

    fn register_func_info(&self, func: Option<FuncInfo>) {
        self.core.register_func_info(func);
    }

    fn register_func_info_server(&self, func: Option<FuncInfoServer>) {
        self.core.register_func_info_server(func);
    }

    fn register_server(&self, address: &str) -> Result<(), SocketError> {
        self.core.register_server(address)
    }

    fn register_socket(
        &self,
        path: &Path,
        permissions: Option<FileMode>,
        group: Option<i32>,
    ) -> Result<(), SocketError> {
        self.core.register_socket(path, permissions, group)
    }

    fn set_update_conn(&self, hook: Option<UpdateConn>) {
        self.core.set_update_conn(hook);
    }

    fn set_tls(&self, enable: bool, config: Option<&TlsConfig>) -> Result<(), SocketError> {
        if self.is_unix() {
            tracing::debug!("tls ignored on unix stream server");
            return Ok(());
        }
        self.tls.configure(enable, config)
    }

    async fn listen(&self, ctx: &CallContext) -> Result<(), SocketError> {
        let descriptor = self.core.begin_listen(ctx)?;
        let listener = match StreamListener::bind(&descriptor).await {
            Ok(listener) => listener,
            Err(err) => return Err(self.core.fail_listen(err)),
        };
        let acceptor = if descriptor.network.is_unix() {
            None
        } else {
            self.tls.acceptor()
        };
        self.core.started(listener.local_addr());
        tokio::spawn(accept_loop(
            Arc::clone(&self.core),
            listener,
            acceptor,
            self.idle_timeout,
            ctx.clone(),
        ));
        Ok(())
    }

    async fn shutdown(&self, ctx: &CallContext) -> Result<(), SocketError> {
        let result = self.core.state.shutdown(ctx).await;
        if let Err(err) = &result {
            self.core.callbacks.emit_error(err);
        }
        result
    }

    async fn done(&self) {
        self.core.state.wait_stopped().await;
    }

    fn is_running(&self) -> bool {
        self.core.state.is_running()
    }

    fn is_gone(&self) -> bool {
        self.core.state.is_gone()
    }

    fn open_connections(&self) -> i64 {
        self.core.state.open_connections()
    }

    fn local_addr(&self) -> Option<SocketAddress> {
        self.core.local_addr()
    }
}

async fn accept_loop(
    core: Arc<ServerCore>,
    listener: StreamListener,
    acceptor: Option<TlsAcceptor>,
    idle_timeout: Option<Duration>,
    ctx: CallContext,
) {
    loop {
        let stop = core.state.stop_signal();
        tokio::pin!(stop);
        stop.as_mut().enable();
        if core.state.is_gone() {
            break;
        }

        let accepted = tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ctx.done() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((conn, remote)) => {
                let guard = core.state.connection_opened();
                tokio::spawn(serve_connection(
                    Arc::clone(&core),
                    conn,
                    remote,
                    acceptor.clone(),
                    idle_timeout,
                    guard,
                ));
            }
            Err(err) if is_closed_error(&err) => break,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                core.callbacks.emit_server(&format!("accept failed: {err}"));
                core.callbacks
                    .emit_error(&SocketError::io(OperationKind::ACCEPT, err));
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    listener.close();
    core.finish_listen();
}

async fn serve_connection(
    core: Arc<ServerCore>,
    conn: StreamConn,
    remote: SocketAddress,
    acceptor: Option<TlsAcceptor>,
    idle_timeout: Option<Duration>,
    _guard: ConnectionGuard,
) {
    let local = conn.local_addr();
    core.callbacks.emit_info(&local, &remote, ConnState::New);
    if let Some(hook) = core.update_conn.load_full() {
        update_socket(&hook, &conn);
    }

    let conn = match (acceptor, conn) {
        (Some(acceptor), StreamConn::Tcp(stream)) => {
            let handshake = ServerTlsBinding::accept(&acceptor, stream);
            let result = match idle_timeout {
                Some(idle) => tokio::time::timeout(idle, handshake)
                    .await
                    .unwrap_or_else(|_| Err(SocketError::IdleTimeout(idle))),
                None => handshake.await,
            };
            match result {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::debug!(%remote, %err, "tls handshake failed");
                    core.callbacks.emit_error(&err);
                    core.callbacks.emit_info(&local, &remote, ConnState::Close);
                    return;
                }
            }
        }
        (_, conn) => conn,
    };

    core.callbacks.emit_info(&local, &remote, ConnState::Handler);
    let session = Session::stream(
        conn,
        local.clone(),
        remote.clone(),
        Arc::clone(&core.callbacks),
        idle_timeout,
    );
    core.run_handler(session).await;
    core.callbacks.emit_info(&local, &remote, ConnState::Close);
}

fn update_socket(hook: &UpdateConn, conn: &StreamConn) {
    match conn {
        StreamConn::Tcp(stream) => hook(SockRef::from(stream)),
        #[cfg(unix)]
        StreamConn::Unix(stream) => hook(SockRef::from(stream)),
        StreamConn::Tls(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_socket::{NetworkProtocol, Phase};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn echo(mut session: Session) {
        let mut buf = vec![0u8; 1024];
        loop {
            match session.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(len) => {
                    if session.write(&buf[..len]).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn tcp_server<H: Handler>(handler: H) -> anyhow::Result<StreamServer> {
        let config = ServerConfig::new(NetworkProtocol::Tcp, "127.0.0.1:0");
        Ok(StreamServer::new(&config, handler)?)
    }

    fn inet(server: &StreamServer) -> anyhow::Result<std::net::SocketAddr> {
        server
            .local_addr()
            .and_then(|addr| addr.as_inet())
            .ok_or_else(|| anyhow::anyhow!("监听后应能取得 TCP 地址"))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tcp_echo_and_event_order() -> anyhow::Result<()> {
        let server = tcp_server(echo)?;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        server.register_func_info(Some(Arc::new(move |_: &SocketAddress, _: &SocketAddress, state: ConnState| {
            if let Ok(mut events) = sink.lock() {
                events.push(state);
            }
        })));
        server.listen(&CallContext::background()).await?;
        assert!(server.is_running());

        let mut client = TcpStream::connect(inet(&server)?).await?;
        client.write_all(b"ping").await?;
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await?;
        assert_eq!(&reply, b"ping");
        assert!(wait_for(|| server.open_connections() == 1).await);

        drop(client);
        assert!(wait_for(|| server.open_connections() == 0).await, "断开后计数应归零");
        server.close().await?;
        assert!(!server.is_running());

        let events = events.lock().map_err(|_| anyhow::anyhow!("事件锁中毒"))?.clone();
        assert_eq!(events.first(), Some(&ConnState::New));
        assert_eq!(events.get(1), Some(&ConnState::Handler));
        assert!(events.contains(&ConnState::CloseRead));
        assert_eq!(events.last(), Some(&ConnState::Close));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listen_twice_is_rejected() -> anyhow::Result<()> {
        let server = tcp_server(echo)?;
        server.listen(&CallContext::background()).await?;
        assert!(matches!(
            server.listen(&CallContext::background()).await,
            Err(SocketError::AlreadyRunning)
        ));
        server.close().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stuck_handler_times_out_shutdown() -> anyhow::Result<()> {
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = Arc::clone(&release);
        let server = tcp_server(move |_session: Session| {
            let gate = Arc::clone(&gate);
            async move { gate.notified().await }
        })?;
        server.listen(&CallContext::background()).await?;
        let _client = TcpStream::connect(inet(&server)?).await?;
        assert!(wait_for(|| server.open_connections() == 1).await);

        let result = server.shutdown(&CallContext::with_timeout(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(SocketError::ShutdownTimeout { open: 1 })));
        assert!(server.is_gone());

        release.notify_one();
        assert!(wait_for(|| server.open_connections() == 0).await);
        server.shutdown(&CallContext::background()).await?;
        assert_eq!(server.core.state.phase(), Phase::Stopped);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn handler_panic_is_reported() -> anyhow::Result<()> {
        async fn exploding(_session: Session) {
            panic!("handler exploded");
        }

        let server = tcp_server(exploding)?;
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        server.register_func_error(Some(Arc::new(move |err: &SocketError| {
            if matches!(err, SocketError::Panicked(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })));
        server.listen(&CallContext::background()).await?;
        let _client = TcpStream::connect(inet(&server)?).await?;
        assert!(wait_for(|| errors.load(Ordering::SeqCst) == 1).await);
        assert!(wait_for(|| server.open_connections() == 0).await);
        assert!(logs_contain("handler panicked"));
        server.close().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_conn_hook_runs_per_connection() -> anyhow::Result<()> {
        let server = tcp_server(echo)?;
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&applied);
        server.set_update_conn(Some(Arc::new(move |socket: SockRef<'_>| {
            if socket.set_keepalive(true).is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })));
        server.listen(&CallContext::background()).await?;
        let _first = TcpStream::connect(inet(&server)?).await?;
        let _second = TcpStream::connect(inet(&server)?).await?;
        assert!(wait_for(|| applied.load(Ordering::SeqCst) == 2).await);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listen_context_end_stops_accepting() -> anyhow::Result<()> {
        let server = tcp_server(echo)?;
        let ctx = CallContext::with_timeout(Duration::from_millis(30));
        server.listen(&ctx).await?;
        tokio::time::timeout(Duration::from_secs(1), server.done()).await?;
        assert!(!server.is_running());
        assert!(server.is_gone());
        Ok(())
    }

    #[test]
    fn register_server_rejects_bad_addresses() -> anyhow::Result<()> {
        let server = tcp_server(echo)?;
        assert!(matches!(
            server.register_server("no-port"),
            Err(SocketError::InvalidAddress { .. })
        ));
        assert!(matches!(
            server.register_socket(Path::new("/tmp/x.sock"), None, None),
            Err(SocketError::InvalidProtocol { .. })
        ));
        server.register_server(":0")?;
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_server_stops_accepting_and_removes_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dropped.sock");
        let config = ServerConfig::new(NetworkProtocol::Unix, path.to_string_lossy());
        let server = StreamServer::new(&config, echo)?;
        server.listen(&CallContext::background()).await?;
        assert!(path.exists());

        drop(server);
        assert!(wait_for(|| !path.exists()).await, "丢弃服务端后套接字文件应被删除");
        assert!(
            tokio::net::UnixStream::connect(&path).await.is_err(),
            "丢弃服务端后不应再接受连接"
        );
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn unix_socket_file_lifecycle() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("server.sock");
        let config = ServerConfig::new(NetworkProtocol::Unix, path.to_string_lossy());
        let server = StreamServer::new(&config, echo)?;

        assert!(matches!(
            server.register_socket(&path, Some(FileMode::new(0o600)), Some(-1)),
            Err(SocketError::InvalidGroup { .. })
        ));
        server.register_socket(&path, Some(FileMode::new(0o600)), None)?;
        server.set_tls(true, None)?;
        assert!(!server.is_tls(), "Unix 流上 TLS 应为空操作");

        server.listen(&CallContext::background()).await?;
        let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let mut client = tokio::net::UnixStream::connect(&path).await?;
        client.write_all(b"unix").await?;
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await?;
        assert_eq!(&reply, b"unix");
        drop(client);

        server.close().await?;
        assert!(!path.exists(), "关闭后套接字文件应被删除");
        Ok(())
    }
}
