//! 调用上下文：取消令牌与截止时间。
//!
//! 拨号、监听与优雅关闭都接受一个 [`CallContext`]，调用方借此表达“最迟何时完成”
//! 以及“何时放弃”。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// 取消令牌，克隆后共享同一原子位。
#[derive(Clone, Debug)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState::default()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 标记取消。返回 `true` 表示本次调用首次触发取消。
    pub fn cancel(&self) -> bool {
        self.inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 派生共享同一原子位的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// 截止时间，空值表示调用方未施加硬超时。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    pub const fn none() -> Self {
        Self { instant: None }
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以当前时间加上 `timeout` 生成截止时间；溢出时视为未设置。
    pub fn after(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Self::none(), Self::at)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    pub fn is_expired(&self) -> bool {
        self.instant.is_some_and(|deadline| deadline <= Instant::now())
    }

    /// 距离截止时间的剩余时长；未设置时返回 `None`。
    pub fn remaining(&self) -> Option<Duration> {
        self.instant
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// 取两者中更早的截止时间。
    pub fn earliest(self, other: Deadline) -> Deadline {
        match (self.instant, other.instant) {
            (Some(left), Some(right)) => Deadline::at(left.min(right)),
            (Some(_), None) => self,
            (None, _) => other,
        }
    }
}

/// 取消令牌与截止时间的组合。
///
/// # 契约（What）
/// - 克隆开销为一次 `Arc` 引用计数递增，可随任务传递；
/// - [`CallContext::background`] 既不会被取消也没有截止时间；
/// - [`CallContext::done`] 在取消或截止时间到达时完成。
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<CallContextInner>,
}

struct CallContextInner {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    /// 永不取消、没有截止时间的上下文。
    pub fn background() -> Self {
        Self::builder().build()
    }

    /// 在 `timeout` 之后到期的上下文。
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::builder().with_deadline(Deadline::after(timeout)).build()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.inner.cancellation
    }

    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }

    /// 已取消或已到期。
    pub fn is_done(&self) -> bool {
        self.inner.cancellation.is_cancelled() || self.inner.deadline.is_expired()
    }

    /// 等待取消或截止时间到达。
    pub async fn done(&self) {
        let cancelled = crate::util::wait_for_cancellation(self.cancellation());
        match crate::util::to_tokio_deadline(self.deadline()) {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = cancelled => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => cancelled.await,
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("cancelled", &self.inner.cancellation.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

/// [`CallContext`] 构建器。
#[derive(Default)]
pub struct CallContextBuilder {
    cancellation: Option<Cancellation>,
    deadline: Deadline,
}

impl CallContextBuilder {
    /// 绑定外部取消令牌，使多个上下文共享同一取消信号。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn build(self) -> CallContext {
        CallContext {
            inner: Arc::new(CallContextInner {
                cancellation: self.cancellation.unwrap_or_default(),
                deadline: self.deadline,
            }),
        }
    }
}
