use spark_socket::{
    CallContext, CallbackRegistry, ConnState, DatagramSocket, OperationKind, RuntimeState,
    SocketAddress, SocketError,
};
use spark_socket_tls::StreamConn;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

enum SessionIo {
    Stream {
        conn: StreamConn,
        idle_timeout: Option<Duration>,
        last_activity: Instant,
    },
    Datagram {
        socket: Arc<DatagramSocket>,
        state: Arc<RuntimeState>,
        ctx: CallContext,
    },
}

/// 交给处理器的连接会话。
///
/// # 契约（What）
/// - `read`/`write` 先发出 `Read`/`Write` 事件再执行 IO；
/// - 流式会话：读到流末尾返回 `Ok(0)` 并发出 `CloseRead`；空闲超时或 IO 错误先经错误回调上报，
///   随后会话进入关闭状态，后续读写返回 [`SocketError::Connection`]；
/// - 数据报会话：读取记录最近的发送方，写入总是回复该发送方；服务端开始关闭后读取返回 `Ok(0)`。
///
/// # 注意事项（Trade-offs）
/// - 会话按值交给处理器，读写需要 `&mut self`，同一会话上的并发读写由所有权天然串行化。
pub struct Session {
    local: SocketAddress,
    remote: SocketAddress,
    callbacks: Arc<CallbackRegistry>,
    io: SessionIo,
    closed: bool,
}

impl Session {
    pub(crate) fn stream(
        conn: StreamConn,
        local: SocketAddress,
        remote: SocketAddress,
        callbacks: Arc<CallbackRegistry>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            local,
            remote,
            callbacks,
            io: SessionIo::Stream {
                conn,
                idle_timeout,
                last_activity: Instant::now(),
            },
            closed: false,
        }
    }

    pub(crate) fn datagram(
        socket: Arc<DatagramSocket>,
        local: SocketAddress,
        callbacks: Arc<CallbackRegistry>,
        state: Arc<RuntimeState>,
        ctx: CallContext,
    ) -> Self {
        Self {
            local,
            remote: SocketAddress::Unspecified,
            callbacks,
            io: SessionIo::Datagram { socket, state, ctx },
            closed: false,
        }
    }

    pub fn local_addr(&self) -> &SocketAddress {
        &self.local
    }

    /// 对端地址；数据报会话为最近一次读取到的发送方。
    pub fn remote_addr(&self) -> &SocketAddress {
        &self.remote
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self.io, SessionIo::Datagram { .. })
    }

    pub fn is_tls(&self) -> bool {
        matches!(&self.io, SessionIo::Stream { conn, .. } if conn.is_tls())
    }

    pub fn is_connected(&self) -> bool {
        if self.closed {
            return false;
        }
        match &self.io {
            SessionIo::Stream { conn, .. } => conn.probe(),
            SessionIo::Datagram { state, .. } => state.is_running() && !state.is_gone(),
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        if self.closed {
            return Err(SocketError::Connection);
        }
        self.callbacks
            .emit_info(&self.local, &self.remote, ConnState::Read);

        let result = match &mut self.io {
            SessionIo::Stream {
                conn,
                idle_timeout,
                last_activity,
            } => {
                let result =
                    within_idle(*idle_timeout, *last_activity, OperationKind::READ, conn.read(buf))
                        .await;
                if result.is_ok() {
                    *last_activity = Instant::now();
                }
                if let Ok(0) = result {
                    self.callbacks
                        .emit_info(&self.local, &self.remote, ConnState::CloseRead);
                }
                result
            }
            SessionIo::Datagram { socket, state, ctx } => {
                let stop = state.stop_signal();
                tokio::pin!(stop);
                stop.as_mut().enable();
                if state.is_gone() || ctx.is_done() {
                    return Ok(0);
                }
                tokio::select! {
                    biased;
                    _ = &mut stop => Ok(0),
                    _ = ctx.done() => Ok(0),
                    received = socket.recv_from(buf) => match received {
                        Ok((len, peer)) => {
                            self.remote = peer;
                            Ok(len)
                        }
                        Err(err) => Err(SocketError::io(OperationKind::READ, err)),
                    },
                }
            }
        };
        result.map_err(|err| self.fail(err))
    }

    /// 写出整个缓冲区，成功时返回写出的字节数。
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        if self.closed {
            return Err(SocketError::Connection);
        }
        self.callbacks
            .emit_info(&self.local, &self.remote, ConnState::Write);

        let result = match &mut self.io {
            SessionIo::Stream {
                conn,
                idle_timeout,
                last_activity,
            } => {
                let written = within_idle(
                    *idle_timeout,
                    *last_activity,
                    OperationKind::WRITE,
                    async {
                        conn.write_all(buf).await?;
                        conn.flush().await?;
                        Ok(buf.len())
                    },
                )
                .await;
                if written.is_ok() {
                    *last_activity = Instant::now();
                }
                written
            }
            SessionIo::Datagram { socket, .. } => socket.send_to(buf, &self.remote).await,
        };
        result.map_err(|err| self.fail(err))
    }

    /// 关闭写方向并结束会话；重复调用为空操作。
    pub async fn close(&mut self) -> Result<(), SocketError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let SessionIo::Stream { conn, .. } = &mut self.io {
            let result = conn.shutdown().await;
            self.callbacks
                .emit_info(&self.local, &self.remote, ConnState::CloseWrite);
            if let Err(err) = result {
                let err = SocketError::io(OperationKind::SHUTDOWN, err);
                self.callbacks.emit_error(&err);
                if !err.is_closed() {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// 上报错误；流式会话随之进入关闭状态。数据报会话的回复失败不影响后续读取。
    fn fail(&mut self, err: SocketError) -> SocketError {
        self.callbacks.emit_error(&err);
        if !self.is_datagram() {
            self.closed = true;
        }
        err
    }
}

async fn within_idle<F, T>(
    idle_timeout: Option<Duration>,
    last_activity: Instant,
    kind: OperationKind,
    io: F,
) -> Result<T, SocketError>
where
    F: Future<Output = io::Result<T>>,
{
    let result = match idle_timeout {
        Some(idle) => tokio::time::timeout_at(last_activity + idle, io)
            .await
            .map_err(|_| SocketError::IdleTimeout(idle))?,
        None => io.await,
    };
    result.map_err(|err| SocketError::io(kind, err))
}
