use crate::UpdateConn;
use crate::handler::Handler;
use crate::session::Session;
use arc_swap::{ArcSwap, ArcSwapOption};
use futures::FutureExt;
use spark_socket::{
    CallContext, CallbackRegistry, FileMode, FuncError, FuncInfo, FuncInfoServer, OperationKind,
    RuntimeState, SocketAddress, SocketDescriptor, SocketError, validate_group,
};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

/// 流式与数据报服务端共享的控制面：监听描述、回调、运行状态与处理器。
///
/// 所有字段均为原子单元或不可变共享引用，`&self` 即可在任意任务中读写。
pub(crate) struct ServerCore {
    pub(crate) descriptor: ArcSwap<SocketDescriptor>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) callbacks: Arc<CallbackRegistry>,
    pub(crate) state: Arc<RuntimeState>,
    pub(crate) local_addr: ArcSwapOption<SocketAddress>,
    pub(crate) update_conn: ArcSwapOption<UpdateConn>,
}

impl ServerCore {
    pub(crate) fn new(descriptor: SocketDescriptor, handler: Arc<dyn Handler>) -> Self {
        Self {
            descriptor: ArcSwap::from_pointee(descriptor),
            handler,
            callbacks: Arc::new(CallbackRegistry::new()),
            state: Arc::new(RuntimeState::new()),
            local_addr: ArcSwapOption::empty(),
            update_conn: ArcSwapOption::empty(),
        }
    }

    pub(crate) fn register_func_error(&self, func: Option<FuncError>) {
        self.callbacks.register_func_error(func);
    }

    pub(crate) fn register_func_info(&self, func: Option<FuncInfo>) {
        self.callbacks.register_func_info(func);
    }

    pub(crate) fn register_func_info_server(&self, func: Option<FuncInfoServer>) {
        self.callbacks.register_func_info_server(func);
    }

    pub(crate) fn set_update_conn(&self, hook: Option<UpdateConn>) {
        self.update_conn.store(hook.map(Arc::new));
    }

    /// 替换 TCP/UDP 监听地址；新描述须通过校验才会生效。
    pub(crate) fn register_server(&self, address: &str) -> Result<(), SocketError> {
        let current = self.descriptor.load();
        if current.network.is_unix() {
            return Err(SocketError::InvalidProtocol {
                network: current.network.to_string(),
            });
        }
        let next = SocketDescriptor::new(current.network, address);
        next.validate()?;
        self.descriptor.store(Arc::new(next));
        Ok(())
    }

    /// 替换 Unix 套接字路径与文件属性；属组先于网络类型校验。
    pub(crate) fn register_socket(
        &self,
        path: &Path,
        permissions: Option<FileMode>,
        group: Option<i32>,
    ) -> Result<(), SocketError> {
        validate_group(group)?;
        let current = self.descriptor.load();
        if !current.network.is_unix() {
            return Err(SocketError::InvalidProtocol {
                network: current.network.to_string(),
            });
        }
        let next = SocketDescriptor {
            network: current.network,
            address: path.to_string_lossy().into_owned(),
            permissions,
            group,
        };
        next.validate()?;
        self.descriptor.store(Arc::new(next));
        Ok(())
    }

    /// 监听前置检查：描述合法、上下文未结束、控制器未在运行。
    ///
    /// 成功返回时运行标记已置位；后续绑定失败必须调用 [`ServerCore::fail_listen`] 回滚。
    pub(crate) fn begin_listen(&self, ctx: &CallContext) -> Result<Arc<SocketDescriptor>, SocketError> {
        let descriptor = self.descriptor.load_full();
        descriptor.validate()?;
        if ctx.cancellation().is_cancelled() {
            return Err(SocketError::Cancelled {
                kind: OperationKind::BIND,
            });
        }
        if ctx.deadline().is_expired() {
            return Err(SocketError::Timeout {
                kind: OperationKind::BIND,
            });
        }
        self.state.try_start()?;
        Ok(descriptor)
    }

    pub(crate) fn fail_listen(&self, err: SocketError) -> SocketError {
        self.state.mark_stopped();
        self.callbacks.emit_error(&err);
        err
    }

    pub(crate) fn started(&self, local: SocketAddress) {
        tracing::info!(local = %local, "server listening");
        let message = format!("listening on {local}");
        self.local_addr.store(Some(Arc::new(local)));
        self.callbacks.emit_server(&message);
    }

    /// 监听循环退出：进入排空（若尚未进入）并清除运行标记。
    pub(crate) fn finish_listen(&self) {
        self.state.begin_drain();
        self.state.mark_stopped();
        self.callbacks.emit_server("listener stopped");
        tracing::info!(open = self.state.open_connections(), "server stopped accepting");
    }

    /// 运行处理器并隔离其 panic。
    pub(crate) async fn run_handler(&self, session: Session) {
        let handler = Arc::clone(&self.handler);
        let result = AssertUnwindSafe(async move { handler.handle(session).await })
            .catch_unwind()
            .await;
        if let Err(payload) = result {
            let err = SocketError::from_panic(payload);
            tracing::error!(%err, "handler panicked");
            self.callbacks.emit_error(&err);
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddress> {
        self.local_addr.load_full().map(|addr| (*addr).clone())
    }
}

impl fmt::Debug for ServerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCore")
            .field("descriptor", &**self.descriptor.load())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
