use crate::address::SocketAddress;
use crate::error::SocketError;
use crate::state::ConnState;
use arc_swap::ArcSwapOption;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// 错误回调：接收会话或控制器内部产生的错误。
pub type FuncError = Arc<dyn Fn(&SocketError) + Send + Sync>;

/// 连接事件回调：`(本端地址, 对端地址, 事件)`。
pub type FuncInfo = Arc<dyn Fn(&SocketAddress, &SocketAddress, ConnState) + Send + Sync>;

/// 服务端生命周期信息回调（监听启动、停止、accept 异常等文本消息）。
pub type FuncInfoServer = Arc<dyn Fn(&str) + Send + Sync>;

/// 三个可独立替换的回调槽位。
///
/// # 意图（Why）
/// - 回调可能在任意时刻被替换，而会话任务会并发地触发它们；
///   每个槽位是一个原子指针，替换与读取都不需要加锁。
///
/// # 契约（What）
/// - 每个槽位最多持有一个回调，注册即整体替换；
/// - 注册 `None` 清空槽位，之后的触发为空操作；
/// - 回调在触发任务上同步执行，回调内部的 panic 被捕获并记录日志，不会传播到会话。
///
/// # 注意事项（Trade-offs）
/// - 并发触发与替换之间只保证“看到旧值或新值之一”，不保证替换瞬间之后的触发一定使用新值。
#[derive(Default)]
pub struct CallbackRegistry {
    error: ArcSwapOption<FuncError>,
    info: ArcSwapOption<FuncInfo>,
    server: ArcSwapOption<FuncInfoServer>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_func_error(&self, func: Option<FuncError>) {
        self.error.store(func.map(Arc::new));
    }

    pub fn register_func_info(&self, func: Option<FuncInfo>) {
        self.info.store(func.map(Arc::new));
    }

    pub fn register_func_info_server(&self, func: Option<FuncInfoServer>) {
        self.server.store(func.map(Arc::new));
    }

    /// 上报错误；“已关闭连接”类噪声错误只记录 trace 日志。
    pub fn emit_error(&self, error: &SocketError) {
        if error.is_closed() {
            tracing::trace!(code = error.code(), %error, "closed connection error filtered");
            return;
        }
        tracing::debug!(code = error.code(), %error, "socket error");
        let guard = self.error.load();
        if let Some(func) = guard.as_ref() {
            guard_callback("error", || func(error));
        }
    }

    pub fn emit_info(&self, local: &SocketAddress, remote: &SocketAddress, state: ConnState) {
        tracing::trace!(%local, %remote, state = %state, "connection event");
        let guard = self.info.load();
        if let Some(func) = guard.as_ref() {
            guard_callback("info", || func(local, remote, state));
        }
    }

    pub fn emit_server(&self, message: &str) {
        tracing::debug!(message, "server info");
        let guard = self.server.load();
        if let Some(func) = guard.as_ref() {
            guard_callback("info_server", || func(message));
        }
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("error", &self.error.load().is_some())
            .field("info", &self.info.load().is_some())
            .field("server", &self.server.load().is_some())
            .finish()
    }
}

fn guard_callback(slot: &'static str, call: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(call)) {
        let error = SocketError::from_panic(payload);
        tracing::error!(slot, %error, "callback panicked");
    }
}
