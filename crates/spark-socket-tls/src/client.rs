use crate::config::{TlsConfig, default_config};
use crate::stream::StreamConn;
use arc_swap::ArcSwapOption;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use spark_socket::SocketError;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, TlsStream};

struct ClientTls {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

/// 客户端 TLS 绑定：rustls 客户端配置与 SNI 服务器名。
#[derive(Default)]
pub struct ClientTlsBinding {
    inner: ArcSwapOption<ClientTls>,
}

impl ClientTlsBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开启或关闭 TLS；开启时 `server_name` 必须是合法的 DNS 名或 IP。
    pub fn configure(
        &self,
        enable: bool,
        config: Option<&TlsConfig>,
        server_name: &str,
    ) -> Result<(), SocketError> {
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
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| SocketError::invalid_tls(format!("非法的服务器名 {server_name:?}")))?;
        let config = material.build_client_config()?;
        self.inner.store(Some(Arc::new(ClientTls {
            config,
            server_name,
        })));
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.load().is_some()
    }

    /// 按当前绑定包装已建立的 TCP 连接；未开启 TLS 时原样返回明文流。
    pub async fn connect(&self, stream: TcpStream) -> Result<StreamConn, SocketError> {
        let Some(tls) = self.inner.load_full() else {
            return Ok(StreamConn::Tcp(stream));
        };
        TlsConnector::from(Arc::clone(&tls.config))
            .connect(tls.server_name.clone(), stream)
            .await
            .map(|stream| StreamConn::Tls(Box::new(TlsStream::Client(stream))))
            .map_err(|source| SocketError::Handshake { source })
    }
}

impl fmt::Debug for ClientTlsBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTlsBinding")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::self_signed;
    use crate::server::ServerTlsBinding;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn invalid_server_name_is_rejected() -> anyhow::Result<()> {
        let (_, client) = self_signed("localhost")?;
        let binding = ClientTlsBinding::new();
        let result = binding.configure(true, Some(&client), "not a host name");
        assert!(matches!(result, Err(SocketError::InvalidTlsConfig { .. })));
        assert!(!binding.is_enabled());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handshake_round_trip() -> anyhow::Result<()> {
        let (server_material, client_material) = self_signed("localhost")?;
        let server = ServerTlsBinding::new();
        server.configure(true, Some(&server_material))?;
        let acceptor = server
            .acceptor()
            .ok_or_else(|| anyhow::anyhow!("服务端 TLS 应已开启"))?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut conn = ServerTlsBinding::accept(&acceptor, stream).await?;
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await?;
            conn.write_all(&buf).await?;
            conn.flush().await?;
            anyhow::Ok(())
        });

        let client = ClientTlsBinding::new();
        client.configure(true, Some(&client_material), "localhost")?;
        let mut conn = client.connect(TcpStream::connect(addr).await?).await?;
        assert!(conn.is_tls());
        conn.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");
        accept_task.await??;
        Ok(())
    }
}
