#![deny(unsafe_code)]
#![doc = r#"
# spark-socket-client

## 设计动机（Why）
- 调用方只关心“连上、读写、关闭”，不关心底层是 TCP、Unix 流、UDP 还是 Unix 数据报；
  本 crate 以 [`SocketClient`] 统一四种传输的客户端生命周期。

## 核心契约（What）
- `connect` 发出 `Dial`，在 [`CallContext`] 的取消与截止约束下拨号，成功后发出 `New`；
  再次连接会先关闭旧连接；
- `read`/`write` 先发出 `Read`/`Write` 事件，未连接时返回 [`SocketError::Connection`]；
- `close` 发出 `Close` 并释放连接，未连接时返回 [`SocketError::Connection`]；
- [`once`]：连接 → 拷贝请求直到流末尾 → 可选的响应回调 → 必定关闭；关闭失败只经错误回调上报。

## 实现策略（How）
- [`StreamClient`] 覆盖 TCP / Unix 流，TCP 可选 TLS；[`DatagramClient`] 覆盖 UDP / Unix 数据报；
- [`Client`] 是按网络类型分派的枚举，由 [`new`] 构造。

## 风险与考量（Trade-offs）
- 读写接收 `&mut self`，同一客户端上的并发访问由调用方以所有权串行化。
- 匿名 Unix 数据报客户端无法收到服务端回复，需要回复时请让服务端使用 UDP 或流式传输。
"#]

mod datagram;
mod once;
mod stream;

pub use datagram::DatagramClient;
pub use once::{ResponseFn, once};
pub use stream::StreamClient;

use async_trait::async_trait;
use futures::future::BoxFuture;
use spark_socket::{CallContext, FuncError, FuncInfo, SocketAddress, SocketError};
use spark_socket_config::ClientConfig;
use spark_socket_tls::TlsConfig;
use tokio::io::AsyncRead;

/// 客户端生命周期接口。
#[async_trait]
pub trait SocketClient: Send {
    fn register_func_error(&self, func: Option<FuncError>);

    fn register_func_info(&self, func: Option<FuncInfo>);

    /// 开启或关闭 TLS，下一次 `connect` 生效；非 TCP 传输上为空操作。
    fn set_tls(
        &self,
        enable: bool,
        config: Option<&TlsConfig>,
        server_name: &str,
    ) -> Result<(), SocketError>;

    async fn connect(&mut self, ctx: &CallContext) -> Result<(), SocketError>;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError>;

    /// 写出整个缓冲区。
    async fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError>;

    async fn close(&mut self) -> Result<(), SocketError>;

    fn is_connected(&self) -> bool;

    fn local_addr(&self) -> SocketAddress;

    fn peer_addr(&self) -> SocketAddress;
}

/// 按网络类型分派的客户端。
#[derive(Debug)]
pub enum Client {
    Stream(StreamClient),
    Datagram(DatagramClient),
}

/// 按配置创建客户端；`default_tls` 在配置未携带证书材料时作为 TLS 材料。
pub fn new(config: &ClientConfig, default_tls: Option<TlsConfig>) -> Result<Client, SocketError> {
    if config.network.is_stream() {
        StreamClient::new(config, default_tls).map(Client::Stream)
    } else {
        DatagramClient::new(config).map(Client::Datagram)
    }
}

impl Client {
    pub async fn once<R, F>(
        &mut self,
        ctx: &CallContext,
        request: Option<R>,
        on_response: Option<F>,
    ) -> Result<(), SocketError>
    where
        R: AsyncRead + Unpin + Send,
        F: for<'c> FnOnce(&'c mut Client) -> BoxFuture<'c, Result<(), SocketError>> + Send,
    {
        once(self, ctx, request, on_response).await
    }

    fn inner(&self) -> &dyn SocketClient {
        match self {
            Client::Stream(client) => client,
            Client::Datagram(client) => client,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn SocketClient {
        match self {
            Client::Stream(client) => client,
            Client::Datagram(client) => client,
        }
    }
}

#[async_trait]
impl SocketClient for Client {
    fn register_func_error(&self, func: Option<FuncError>) {
        self.inner().register_func_error(func);
    }

    fn register_func_info(&self, func: Option<FuncInfo>) {
        self.inner().register_func_info(func);
    }

    fn set_tls(
        &self,
        enable: bool,
        config: Option<&TlsConfig>,
        server_name: &str,
    ) -> Result<(), SocketError> {
        self.inner().set_tls(enable, config, server_name)
    }

    async fn connect(&mut self, ctx: &CallContext) -> Result<(), SocketError> {
        self.inner_mut().connect(ctx).await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.inner_mut().read(buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        self.inner_mut().write(buf).await
    }

    async fn close(&mut self) -> Result<(), SocketError> {
        self.inner_mut().close().await
    }

    fn is_connected(&self) -> bool {
        self.inner().is_connected()
    }

    fn local_addr(&self) -> SocketAddress {
        self.inner().local_addr()
    }

    fn peer_addr(&self) -> SocketAddress {
        self.inner().peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_socket::NetworkProtocol;

    #[test]
    fn factory_dispatches_on_network() -> anyhow::Result<()> {
        let stream = new(&ClientConfig::new(NetworkProtocol::Tcp, ":9000"), None)?;
        assert!(matches!(stream, Client::Stream(_)));
        let datagram = new(&ClientConfig::new(NetworkProtocol::Udp, ":9000"), None)?;
        assert!(matches!(datagram, Client::Datagram(_)));
        assert!(!datagram.is_connected());
        assert!(matches!(
            new(&ClientConfig::new(NetworkProtocol::Tcp, "missing-port"), None),
            Err(SocketError::InvalidAddress { .. })
        ));
        Ok(())
    }
}
