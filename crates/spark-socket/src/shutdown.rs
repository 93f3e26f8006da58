use crate::context::{CallContext, Deadline};
use crate::error::SocketError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// 优雅关闭的内部等待上限；调用方截止时间更早时以调用方为准。
pub const SHUTDOWN_CEILING: Duration = Duration::from_secs(1);

/// 关闭等待期间检查运行标记与连接计数的间隔。
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(3);

/// 服务端生命周期阶段，由原子标记与计数推导得出。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// 尚未监听。
    Idle,
    Running,
    /// 已停止接收新连接，等待存量连接结束。
    Draining,
    Stopped,
}

/// 服务端运行状态与优雅关闭协调器。
///
/// # 意图（Why）
/// - accept 循环、会话任务与关闭调用三方并发读写同一份状态；
///   每个字段都是独立的原子单元，单次更新即一次原子操作。
///
/// # 逻辑（How）
/// - `running`：监听循环存活期间为真，循环退出时清除；
/// - `gone`：关闭开始后置位，accept 循环据此停止接收；
/// - `open`：开放连接计数，由 [`ConnectionGuard`] 在创建/析构时增减，保证每个连接恰好一次；
/// - [`RuntimeState::shutdown`] 置位 `gone`、唤醒监听循环，然后每 3ms 轮询一次，
///   直到 `running == false && open == 0` 或到达
///   `min(SHUTDOWN_CEILING, ctx 截止时间)`。
///
/// # 契约（What）
/// - `Idle`/`Stopped` 阶段调用关闭立即成功；
/// - `Draining` 阶段再次调用不会重复触发状态迁移，而是重新进入有界等待；
/// - 超时返回 [`SocketError::ShutdownTimeout`]，`gone` 保持置位，状态不被破坏；
/// - 协调器从不强制终止会话，排空完全依赖会话自行结束。
///
/// # 注意事项（Trade-offs）
/// - 轮询带来毫秒级的关闭延迟，但避免了连接计数与通知之间的竞态。
pub struct RuntimeState {
    running: AtomicBool,
    gone: AtomicBool,
    open: AtomicI64,
    stop: Notify,
    stopped: Notify,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            open: AtomicI64::new(0),
            stop: Notify::new(),
            stopped: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    pub fn open_connections(&self) -> i64 {
        self.open.load(Ordering::Acquire).max(0)
    }

    pub fn phase(&self) -> Phase {
        match (self.is_running(), self.is_gone()) {
            (false, false) => Phase::Idle,
            (true, false) => Phase::Running,
            (_, true) if self.is_running() || self.open_connections() > 0 => Phase::Draining,
            (_, true) => Phase::Stopped,
        }
    }

    /// 进入运行阶段；已在运行或仍在排空时返回 [`SocketError::AlreadyRunning`]。
    pub fn try_start(&self) -> Result<(), SocketError> {
        if self.is_gone() && self.open_connections() > 0 {
            return Err(SocketError::AlreadyRunning);
        }
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SocketError::AlreadyRunning)?;
        self.gone.store(false, Ordering::Release);
        Ok(())
    }

    /// 监听循环退出时调用，清除运行标记并唤醒等待者。
    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::Release);
        self.stopped.notify_waiters();
    }

    /// 进入排空：置位 `gone` 并唤醒监听循环。返回 `true` 表示本次调用触发了迁移。
    pub fn begin_drain(&self) -> bool {
        let first = !self.gone.swap(true, Ordering::AcqRel);
        self.stop.notify_waiters();
        first
    }

    /// 登记一个新连接，返回的守卫在析构时扣减计数。
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.open.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            state: Arc::clone(self),
        }
    }

    /// 获取停止信号；调用方须先 `enable` 再检查 [`RuntimeState::is_gone`]，避免丢失唤醒。
    pub fn stop_signal(&self) -> Notified<'_> {
        self.stop.notified()
    }

    /// 等待监听循环退出。
    pub async fn wait_stopped(&self) {
        loop {
            let notified = self.stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    /// 执行有界轮询的优雅关闭。
    pub async fn shutdown(&self, ctx: &CallContext) -> Result<(), SocketError> {
        match self.phase() {
            Phase::Idle | Phase::Stopped => return Ok(()),
            Phase::Running => {
                self.begin_drain();
                tracing::debug!(open = self.open_connections(), "shutdown requested");
            }
            Phase::Draining => {}
        }

        let deadline = Deadline::after(SHUTDOWN_CEILING).earliest(ctx.deadline());
        loop {
            if !self.is_running() && self.open_connections() == 0 {
                return Ok(());
            }
            if deadline.is_expired() || ctx.cancellation().is_cancelled() {
                let open = self.open_connections();
                tracing::warn!(open, running = self.is_running(), "shutdown timed out");
                return Err(SocketError::ShutdownTimeout { open });
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeState")
            .field("phase", &self.phase())
            .field("open", &self.open_connections())
            .finish_non_exhaustive()
    }
}

/// 单个开放连接的计数凭证，析构即扣减。
#[must_use = "dropping the guard immediately closes the accounting for this connection"]
pub struct ConnectionGuard {
    state: Arc<RuntimeState>,
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard").finish_non_exhaustive()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.open.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_shutdown_returns_immediately() {
        let state = RuntimeState::new();
        assert_eq!(state.phase(), Phase::Idle);
        let started = Instant::now();
        assert!(state.shutdown(&CallContext::background()).await.is_ok());
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!state.is_gone(), "空闲状态下关闭不应进入排空");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_waits_for_guards() {
        let state = Arc::new(RuntimeState::new());
        state.try_start().expect("首次启动应成功");
        assert!(matches!(state.try_start(), Err(SocketError::AlreadyRunning)));

        let guard = state.connection_opened();
        assert_eq!(state.open_connections(), 1);

        let listener = Arc::clone(&state);
        tokio::spawn(async move {
            let stop = listener.stop_signal();
            tokio::pin!(stop);
            stop.as_mut().enable();
            if !listener.is_gone() {
                stop.await;
            }
            listener.mark_stopped();
        });

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        state
            .shutdown(&CallContext::background())
            .await
            .expect("连接释放后关闭应成功");
        releaser.await.expect("释放任务不应 panic");
        assert_eq!(state.phase(), Phase::Stopped);
        assert_eq!(state.open_connections(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stuck_connection_times_out_and_retry_waits_again() {
        let state = Arc::new(RuntimeState::new());
        state.try_start().expect("首次启动应成功");
        let guard = state.connection_opened();
        let stopper = Arc::clone(&state);
        tokio::spawn(async move {
            let stop = stopper.stop_signal();
            tokio::pin!(stop);
            stop.as_mut().enable();
            if !stopper.is_gone() {
                stop.await;
            }
            stopper.mark_stopped();
        });

        let ctx = CallContext::with_timeout(Duration::from_millis(60));
        let started = Instant::now();
        let result = state.shutdown(&ctx).await;
        assert!(matches!(result, Err(SocketError::ShutdownTimeout { open: 1 })));
        assert!(started.elapsed() < SHUTDOWN_CEILING, "调用方截止时间更早时应以其为准");
        assert_eq!(state.phase(), Phase::Draining);

        drop(guard);
        state
            .shutdown(&CallContext::background())
            .await
            .expect("连接释放后再次关闭应成功");
        assert_eq!(state.phase(), Phase::Stopped);
    }
}
