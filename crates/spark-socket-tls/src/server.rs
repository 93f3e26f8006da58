use crate::config::{TlsConfig, default_config};
use crate::stream::StreamConn;
use arc_swap::ArcSwapOption;
use rustls::ServerConfig;
use spark_socket::SocketError;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsStream};

/// 服务端 TLS 绑定。
///
/// # 意图（Why）
/// - `set_tls` 可能与监听并发调用；绑定以原子指针保存已构建好的 rustls 配置，
///   读写都不需要锁。
///
/// # 契约（What）
/// - [`ServerTlsBinding::configure`] 在关闭时清空绑定，开启时要求至少一张身份证书；
/// - 监听器在绑定时调用一次 [`ServerTlsBinding::acceptor`] 取得快照，之后的修改只影响下一次监听。
///
/// # 逻辑（How）
/// - 叠加方配置先与进程级默认配置合并，再构建 `rustls::ServerConfig`，最后原子替换。
#[derive(Clone, Default)]
pub struct ServerTlsBinding {
    inner: Arc<ArcSwapOption<ServerConfig>>,
}

impl ServerTlsBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开启或关闭 TLS。
    pub fn configure(&self, enable: bool, config: Option<&TlsConfig>) -> Result<(), SocketError> {
        if !enable {
            self.inner.store(None);
            return Ok(());
        }
        let material = match config {
            Some(config) => config.clone().with_default(),
            None => default_config()
                .cloned()
                .ok_or_else(|| SocketError::invalid_tls("未提供 TLS 配置"))?,
        };
        if material.certificate_count() == 0 {
            return Err(SocketError::invalid_tls("TLS 配置不包含任何证书"));
        }
        let built = material.build_server_config()?;
        self.inner.store(Some(built));
        tracing::debug!(certificates = material.certificate_count(), "server tls configured");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.load().is_some()
    }

    /// 当前配置的握手器快照；未开启时为 `None`。
    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.inner.load_full().map(TlsAcceptor::from)
    }

    /// 使用给定快照完成服务端握手。
    pub async fn accept(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<StreamConn, SocketError> {
        acceptor
            .accept(stream)
            .await
            .map(|stream| StreamConn::Tls(Box::new(TlsStream::Server(stream))))
            .map_err(|source| SocketError::Handshake { source })
    }
}

impl fmt::Debug for ServerTlsBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTlsBinding")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
