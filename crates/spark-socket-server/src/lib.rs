#![deny(unsafe_code)]
#![doc = r#"
# spark-socket-server

## 设计动机（Why）
- 以同一组接口驱动 TCP、Unix 流、UDP 与 Unix 数据报服务端：监听、回调注册、开放连接计数与有界优雅关闭。

## 核心契约（What）
- [`SocketServer`]：所有服务端共享的生命周期接口；[`new`] 按网络类型选择实现。
- [`StreamServer`]：TCP / Unix 流，每个连接一个任务，可选 TLS 终结与空闲超时。
- [`DatagramServer`]：UDP / Unix 数据报，单个读取任务反复调用处理器，开放连接数报告为 1/0。
- [`Handler`]：连接处理器，接收一个 [`Session`]。

## 实现策略（How）
- `listen` 同步完成校验与绑定，随后把 accept/读取循环交给独立任务并立即返回；
- 运行状态、回调与 TLS 绑定均保存在原子单元中，控制器可被多个任务共享。

## 风险与考量（Trade-offs）
- 优雅关闭只等待、不强制终止：处理器若永不返回，`shutdown` 将以超时告终。
"#]

mod datagram;
mod handler;
mod listener;
mod session;
mod shared;
mod stream;

pub use datagram::DatagramServer;
pub use handler::Handler;
pub use session::Session;
pub use stream::StreamServer;

use async_trait::async_trait;
use socket2::SockRef;
use spark_socket::{
    CallContext, FileMode, FuncError, FuncInfo, FuncInfoServer, SocketAddress, SocketError,
};
use spark_socket_config::ServerConfig;
use spark_socket_tls::TlsConfig;
use std::path::Path;
use std::sync::Arc;

/// 连接建立后、交给处理器之前对底层套接字的定制钩子（keep-alive、no-delay 等）。
pub type UpdateConn = Arc<dyn Fn(SockRef<'_>) + Send + Sync>;

/// 服务端生命周期接口。
#[async_trait]
pub trait SocketServer: Send + Sync {
    fn register_func_error(&self, func: Option<FuncError>);

    fn register_func_info(&self, func: Option<FuncInfo>);

    fn register_func_info_server(&self, func: Option<FuncInfoServer>);

    /// 替换监听地址，下一次 `listen` 生效。
    fn register_server(&self, address: &str) -> Result<(), SocketError>;

    /// 替换 Unix 套接字路径、权限与属组，下一次 `listen` 生效。
    fn register_socket(
        &self,
        path: &Path,
        permissions: Option<FileMode>,
        group: Option<i32>,
    ) -> Result<(), SocketError>;

    fn set_update_conn(&self, hook: Option<UpdateConn>);

    /// 开启或关闭 TLS；非 TCP 传输上为空操作。
    fn set_tls(&self, enable: bool, config: Option<&TlsConfig>) -> Result<(), SocketError>;

    /// 绑定并开始接收；`ctx` 结束时监听循环随之停止。
    async fn listen(&self, ctx: &CallContext) -> Result<(), SocketError>;

    /// 停止接收新连接并在有界时间内等待存量连接结束。
    async fn shutdown(&self, ctx: &CallContext) -> Result<(), SocketError>;

    /// 以默认上下文执行 [`SocketServer::shutdown`]。
    async fn close(&self) -> Result<(), SocketError> {
        self.shutdown(&CallContext::background()).await
    }

    /// 等待监听循环退出。
    async fn done(&self);

    fn is_running(&self) -> bool;

    fn is_gone(&self) -> bool;

    fn open_connections(&self) -> i64;

    /// 监听中的本端地址；用于发现临时端口。
    fn local_addr(&self) -> Option<SocketAddress>;
}

/// 按配置的网络类型创建服务端。
pub fn new<H>(config: &ServerConfig, handler: H) -> Result<Box<dyn SocketServer>, SocketError>
where
    H: Handler,
{
    if config.network.is_stream() {
        Ok(Box::new(StreamServer::new(config, handler)?))
    } else {
        Ok(Box::new(DatagramServer::new(config, handler)?))
    }
}
