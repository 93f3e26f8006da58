use crate::handler::Handler;
use crate::session::Session;
use crate::shared::ServerCore;
use crate::{SocketServer, UpdateConn};
use async_trait::async_trait;
use socket2::SockRef;
use spark_socket::{
    CallContext, DatagramSocket, FileMode, FuncError, FuncInfo, FuncInfoServer,
    SHUTDOWN_POLL_INTERVAL, SocketAddress, SocketDescriptor, SocketError, UnixSocketFile,
};
use spark_socket_config::ServerConfig;
use spark_socket_tls::TlsConfig;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// UDP / Unix 数据报服务端。
///
/// # 意图（Why）
/// - 数据报没有连接，服务端只有一个绑定套接字；处理器在监听期间被反复调用，
///   每次调用拿到同一套接字上的 [`Session`]，由会话记录最近的发送方以便回复。
///
/// # 契约（What）
/// - 开放连接数在监听期间报告为 1，其余时间为 0；
/// - 停止后会话读取返回 `Ok(0)`，处理器据此返回，读取循环随即退出；
/// - Unix 数据报的套接字文件处理与 Unix 流一致：绑定前清理、绑定后设置权限与属组、退出时删除；
/// - `set_tls` 为空操作；`set_update_conn` 的钩子在每次 `listen` 绑定成功后对绑定套接字调用一次。
///
/// # 注意事项（Trade-offs）
/// - 处理器返回后间隔 3ms 再次调用，立即返回的处理器会形成低频轮询。
pub struct DatagramServer {
    core: Arc<ServerCore>,
}

impl DatagramServer {
    pub fn new<H>(config: &ServerConfig, handler: H) -> Result<Self, SocketError>
    where
        H: Handler,
    {
        if !config.network.is_datagram() {
            return Err(SocketError::InvalidProtocol {
                network: config.network.to_string(),
            });
        }
        config.validate()?;
        Ok(Self {
            core: Arc::new(ServerCore::new(config.descriptor(), Arc::new(handler))),
        })
    }
}

/// 未经 `shutdown` 直接丢弃时通知监听循环退出，由循环释放监听套接字并删除 Unix 套接字文件。
impl Drop for DatagramServer {
    fn drop(&mut self) {
        self.core.state.begin_drain();
    }
}

impl fmt::Debug for DatagramServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramServer")
            .field("core", &self.core)
            .finish()
    }
}

#[async_trait]
impl SocketServer for DatagramServer {
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

    fn set_tls(&self, _enable: bool, _config: Option<&TlsConfig>) -> Result<(), SocketError> {
        tracing::debug!("tls ignored on datagram server");
        Ok(())
    }

    async fn listen(&self, ctx: &CallContext) -> Result<(), SocketError> {
        let descriptor = self.core.begin_listen(ctx)?;
        let (socket, file) = match bind(&descriptor).await {
            Ok(bound) => bound,
            Err(err) => return Err(self.core.fail_listen(err)),
        };
        if let Some(hook) = self.core.update_conn.load_full() {
            update_socket(&hook, &socket);
        }
        let local = socket.local_addr();
        self.core.started(local.clone());
        tokio::spawn(read_loop(
            Arc::clone(&self.core),
            Arc::new(socket),
            local,
            file,
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
        i64::from(self.core.state.is_running())
    }

    fn local_addr(&self) -> Option<SocketAddress> {
        self.core.local_addr()
    }
}

async fn bind(
    descriptor: &SocketDescriptor,
) -> Result<(DatagramSocket, Option<UnixSocketFile>), SocketError> {
    if !descriptor.network.is_unix() {
        let target = descriptor.listen_target()?;
        return Ok((DatagramSocket::bind_udp(&target).await?, None));
    }
    bind_unix(descriptor)
}

#[cfg(unix)]
fn bind_unix(
    descriptor: &SocketDescriptor,
) -> Result<(DatagramSocket, Option<UnixSocketFile>), SocketError> {
    let file = UnixSocketFile::new(descriptor.unix_path()?);
    file.remove_stale()?;
    let socket = DatagramSocket::bind_unix(file.path())?;
    if let Err(err) = file.apply(descriptor.permissions, descriptor.group) {
        drop(socket);
        file.remove();
        return Err(err);
    }
    Ok((socket, Some(file)))
}

#[cfg(not(unix))]
fn bind_unix(
    descriptor: &SocketDescriptor,
) -> Result<(DatagramSocket, Option<UnixSocketFile>), SocketError> {
    Err(SocketError::InvalidProtocol {
        network: descriptor.network.to_string(),
    })
}

fn update_socket(hook: &UpdateConn, socket: &DatagramSocket) {
    match socket {
        DatagramSocket::Udp(socket) => hook(SockRef::from(socket)),
        #[cfg(unix)]
        DatagramSocket::Unix(socket) => hook(SockRef::from(socket)),
    }
}

async fn read_loop(
    core: Arc<ServerCore>,
    socket: Arc<DatagramSocket>,
    local: SocketAddress,
    file: Option<UnixSocketFile>,
    ctx: CallContext,
) {
    loop {
        let stop = core.state.stop_signal();
        tokio::pin!(stop);
        stop.as_mut().enable();
        if core.state.is_gone() || ctx.is_done() {
            break;
        }

        let session = Session::datagram(
            Arc::clone(&socket),
            local.clone(),
            Arc::clone(&core.callbacks),
            Arc::clone(&core.state),
            ctx.clone(),
        );
        core.run_handler(session).await;

        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ctx.done() => break,
            _ = tokio::time::sleep(SHUTDOWN_POLL_INTERVAL) => {}
        }
    }
    drop(socket);
    if let Some(file) = file {
        file.remove();
    }
    core.finish_listen();
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_socket::{ConnState, NetworkProtocol};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    async fn reply_upper(mut session: Session) {
        let mut buf = vec![0u8; 2048];
        while let Ok(len) = session.read(&mut buf).await {
            if len == 0 {
                break;
            }
            buf[..len].make_ascii_uppercase();
            let _ = session.write(&buf[..len]).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn udp_replies_to_last_sender() -> anyhow::Result<()> {
        let config = ServerConfig::new(NetworkProtocol::Udp, "127.0.0.1:0");
        let server = DatagramServer::new(&config, reply_upper)?;
        assert_eq!(server.open_connections(), 0);
        server.listen(&CallContext::background()).await?;
        assert_eq!(server.open_connections(), 1);

        let target = server
            .local_addr()
            .and_then(|addr| addr.as_inet())
            .ok_or_else(|| anyhow::anyhow!("UDP 服务端应有本端地址"))?;
        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
        client.connect(target).await?;
        client.send(b"hello").await?;
        let mut buf = [0u8; 16];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf)).await??;
        assert_eq!(&buf[..len], b"HELLO");

        let started = Instant::now();
        server.close().await?;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(server.open_connections(), 0);
        assert!(!server.is_running());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_conn_runs_once_per_listen_and_only_io_events_are_emitted() -> anyhow::Result<()> {
        let config = ServerConfig::new(NetworkProtocol::Udp, "127.0.0.1:0");
        let server = DatagramServer::new(&config, reply_upper)?;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        server.set_update_conn(Some(Arc::new(move |socket: SockRef<'_>| {
            if socket.set_broadcast(true).is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        server.register_func_info(Some(Arc::new(
            move |_: &SocketAddress, _: &SocketAddress, state: ConnState| {
                if let Ok(mut events) = sink.lock() {
                    events.push(state);
                }
            },
        )));

        server.listen(&CallContext::background()).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let target = server
            .local_addr()
            .and_then(|addr| addr.as_inet())
            .ok_or_else(|| anyhow::anyhow!("UDP 服务端应有本端地址"))?;
        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
        client.connect(target).await?;
        client.send(b"once").await?;
        let mut buf = [0u8; 16];
        tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf)).await??;
        server.close().await?;

        server.register_server("127.0.0.1:0")?;
        server.listen(&CallContext::background()).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 2, "每次 listen 恰好调用一次钩子");
        server.close().await?;

        let events = events.lock().map_err(|_| anyhow::anyhow!("事件锁中毒"))?.clone();
        assert!(events.contains(&ConnState::Read) && events.contains(&ConnState::Write));
        assert!(
            events
                .iter()
                .all(|state| matches!(state, ConnState::Read | ConnState::Write)),
            "数据报服务端只应发出 Read/Write 事件: {events:?}"
        );
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_a_listening_server_removes_the_socket_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dropped.sock");
        let config = ServerConfig::new(NetworkProtocol::UnixGram, path.to_string_lossy());
        let server = DatagramServer::new(&config, reply_upper)?;
        server.listen(&CallContext::background()).await?;
        assert!(path.exists());

        drop(server);
        let mut removed = false;
        for _ in 0..200 {
            if !path.exists() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(removed, "丢弃服务端后套接字文件应被删除");
        Ok(())
    }

    #[test]
    fn tls_is_a_no_op() -> anyhow::Result<()> {
        let config = ServerConfig::new(NetworkProtocol::Udp, ":0");
        let server = DatagramServer::new(&config, reply_upper)?;
        server.set_tls(true, None)?;
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn unixgram_reply_and_unnamed_peer() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gram.sock");
        let config = ServerConfig::new(NetworkProtocol::UnixGram, path.to_string_lossy());
        let server = DatagramServer::new(&config, reply_upper)?;
        server.listen(&CallContext::background()).await?;
        assert!(path.exists());

        let anonymous = tokio::net::UnixDatagram::unbound()?;
        anonymous.send_to(b"nobody", &path).await?;

        let client_path = dir.path().join("client.sock");
        let client = tokio::net::UnixDatagram::bind(&client_path)?;
        client.connect(&path)?;
        client.send(b"gram").await?;
        let mut buf = [0u8; 16];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf)).await??;
        assert_eq!(&buf[..len], b"GRAM", "无名对端的回复失败不应影响后续数据报");

        server.close().await?;
        assert!(!path.exists(), "关闭后套接字文件应被删除");
        Ok(())
    }
}
