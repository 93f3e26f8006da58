#![deny(unsafe_code)]
#![doc = r#"
# spark-socket

## 设计动机（Why）
- 为 TCP、UDP、Unix 流与 Unix 数据报四类传输提供统一的生命周期与回调契约，
  使客户端与服务端角色在不同传输之间共享同一套心智模型。
- 将跨任务共享的运行状态（运行/排空标记、连接计数、回调槽位）收敛为独立的原子单元，
  避免在热路径上引入互斥锁。

## 核心契约（What）
- [`SocketDescriptor`]：经过校验的端点描述（网络类型、地址、Unix 文件权限与属组）。
- [`CallbackRegistry`]：错误、连接事件、服务端信息三个可原子替换的回调槽位。
- [`RuntimeState`]：服务端的运行标记、排空标记与开放连接计数，以及有界轮询的优雅关闭协议。
- [`CallContext`]：取消令牌与截止时间的组合，贯穿拨号、监听与关闭流程。
- [`DatagramSocket`]：UDP 与 Unix 数据报的统一收发封装。

## 实现策略（How）
- 所有 IO 均基于 Tokio；取消语义采用轮询式 [`Cancellation`]，与截止时间一同经由
  [`run_with_context`] 作用于任意 IO Future。
- 回调在触发任务上同步执行，并以 `catch_unwind` 隔离 panic。

## 风险与考量（Trade-offs）
- 优雅关闭采用 3ms 轮询而非通知，换取实现简单与跨传输一致；代价是关闭时存在毫秒级延迟。
- 数据报服务端没有“连接”概念，开放连接数固定报告为 1（监听中）或 0。
"#]

pub mod address;
pub mod callback;
pub mod context;
pub mod datagram;
pub mod error;
pub mod network;
pub mod shutdown;
pub mod state;
mod util;

pub use address::{
    FileMode, MAX_GID, SocketAddress, SocketDescriptor, UnixSocketFile, validate_group,
};
pub use callback::{CallbackRegistry, FuncError, FuncInfo, FuncInfoServer};
pub use context::{CallContext, CallContextBuilder, Cancellation, Deadline};
pub use datagram::DatagramSocket;
pub use error::{ErrorCategory, OperationKind, SocketError, is_closed_error};
pub use network::NetworkProtocol;
pub use shutdown::{
    ConnectionGuard, Phase, RuntimeState, SHUTDOWN_CEILING, SHUTDOWN_POLL_INTERVAL,
};
pub use state::ConnState;
pub use util::run_with_context;

/// 默认读缓冲区大小（32 KiB），供会话与客户端拷贝循环复用。
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// 空闲超时的最小有效值；小于该值的配置视为关闭空闲超时。
pub const MIN_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// 将配置中的空闲超时归一化：低于 [`MIN_IDLE_TIMEOUT`] 的取值视为禁用。
pub fn effective_idle_timeout(
    configured: Option<std::time::Duration>,
) -> Option<std::time::Duration> {
    configured.filter(|timeout| *timeout >= MIN_IDLE_TIMEOUT)
}
