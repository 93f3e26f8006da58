//! 断言共用的夹具与工具函数。

use anyhow::Context;
use spark_socket::{DEFAULT_BUFFER_SIZE, NetworkProtocol, SocketError};
use spark_socket_client::{SocketClient, StreamClient};
use spark_socket_config::{ClientConfig, ServerConfig};
use spark_socket_server::{Session, SocketServer};
use spark_socket_tls::{PrivateKeyDer, TlsConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// 安装测试用日志订阅器；重复调用无副作用。
///
/// 过滤规则取自 `RUST_LOG`，缺省为 `warn`。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// 同一张自签名证书的服务端与客户端视图。
pub struct TlsFixture {
    /// 携带证书链与私钥。
    pub server: TlsConfig,
    /// 以该证书为唯一信任根。
    pub client: TlsConfig,
}

/// 以 rcgen 生成 `localhost` 自签名证书。
pub fn tls_fixture() -> anyhow::Result<TlsFixture> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
        .context("生成自签名证书失败")?;
    let certificate = certified.cert.der().clone();
    let key = PrivateKeyDer::try_from(certified.key_pair.serialize_der())
        .map_err(|err| anyhow::anyhow!("私钥格式无效: {err}"))?;
    Ok(TlsFixture {
        server: TlsConfig::new().with_certificate(vec![certificate.clone()], key),
        client: TlsConfig::new().with_root_certificate(certificate),
    })
}

/// 回显处理器：把读到的字节原样写回，直到对端关闭或出错。
pub async fn echo(mut session: Session) {
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    loop {
        match session.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(len) => {
                if session.write(&buf[..len]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// 轮询等待条件成立，超时返回错误。
pub async fn wait_until(
    timeout: Duration,
    what: &str,
    mut condition: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("等待超时: {what}");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    Ok(())
}

/// 在回环地址临时端口上启动 TCP 回显服务端。
pub async fn tcp_echo_server(config: ServerConfig) -> anyhow::Result<Box<dyn SocketServer>> {
    let server = spark_socket_server::new(&config, echo).context("创建 TCP 服务端失败")?;
    server
        .listen(&spark_socket::CallContext::background())
        .await
        .context("TCP 服务端监听失败")?;
    Ok(server)
}

pub fn loopback_server_config() -> ServerConfig {
    ServerConfig::new(NetworkProtocol::Tcp, "127.0.0.1:0")
}

/// 服务端实际监听的 TCP 地址。
pub fn inet_addr(server: &dyn SocketServer) -> anyhow::Result<SocketAddr> {
    server
        .local_addr()
        .and_then(|addr| addr.as_inet())
        .context("服务端尚未监听 TCP/UDP 地址")
}

pub fn tcp_client(addr: SocketAddr) -> Result<StreamClient, SocketError> {
    StreamClient::new(&ClientConfig::new(NetworkProtocol::Tcp, addr.to_string()), None)
}

/// 从客户端读满 `len` 字节。
pub async fn read_exact<C>(client: &mut C, len: usize) -> anyhow::Result<Vec<u8>>
where
    C: SocketClient + ?Sized,
{
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let read = client
            .read(&mut buf[filled..])
            .await
            .context("读取回显失败")?;
        anyhow::ensure!(read > 0, "对端在 {filled}/{len} 字节处提前关闭");
        filled += read;
    }
    Ok(buf)
}
