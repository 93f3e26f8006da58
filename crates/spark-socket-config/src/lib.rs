#![deny(unsafe_code)]
//! 套接字控制器的声明式配置。
//!
//! # 意图（Why）
//! - 服务端与客户端的网络类型、地址、Unix 权限、空闲超时与 TLS 开关通常来自配置文件；
//!   这里集中定义其 TOML 形态与校验规则，让非法配置在构造控制器之前就被拒绝。
//!
//! # 契约（What）
//! - [`ServerConfig::validate`] / [`ClientConfig::validate`] 拒绝：非法地址、越界属组、
//!   当前平台不支持的 Unix 传输、在非 TCP 传输上开启 TLS、开启 TLS 却没有证书材料；
//! - 证书材料（[`TlsConfig`]）由外部证书构建器产出，只能以编程方式挂载，不参与序列化。
//!
//! # 示例
//! ```toml
//! network = "unix"
//! address = "/run/spark/api.sock"
//! perm_file = 0o660
//! group_perm = 100
//! con_idle_timeout_ms = 30000
//! ```

mod duration_ms;

use serde::{Deserialize, Serialize};
use spark_socket::{
    FileMode, NetworkProtocol, SocketDescriptor, SocketError, effective_idle_timeout,
};
use spark_socket_tls::{TlsConfig, default_config};
use std::path::Path;
use std::time::Duration;

/// 服务端 TLS 段落。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerTlsSection {
    #[serde(default)]
    pub enable: bool,
    #[serde(skip)]
    pub config: Option<TlsConfig>,
}

/// 服务端配置。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub network: NetworkProtocol,
    pub address: String,
    /// Unix 套接字文件权限。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perm_file: Option<FileMode>,
    /// Unix 套接字文件属组。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_perm: Option<i32>,
    /// 连接空闲超时；小于一秒视为禁用。
    #[serde(
        default,
        rename = "con_idle_timeout_ms",
        with = "duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub con_idle_timeout: Option<Duration>,
    #[serde(default)]
    pub tls: ServerTlsSection,
}

impl ServerConfig {
    pub fn new(network: NetworkProtocol, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            perm_file: None,
            group_perm: None,
            con_idle_timeout: None,
            tls: ServerTlsSection::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SocketError> {
        toml::from_str(text).map_err(|err| SocketError::config(err.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SocketError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|err| SocketError::config(format!("{}: {err}", path.as_ref().display())))?;
        Self::from_toml_str(&text)
    }

    pub fn with_permissions(mut self, mode: FileMode, group: Option<i32>) -> Self {
        self.perm_file = Some(mode);
        self.group_perm = group;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.con_idle_timeout = Some(timeout);
        self
    }

    /// 挂载证书材料并开启 TLS。
    pub fn with_tls(mut self, config: TlsConfig) -> Self {
        self.tls = ServerTlsSection {
            enable: true,
            config: Some(config),
        };
        self
    }

    pub fn descriptor(&self) -> SocketDescriptor {
        SocketDescriptor {
            network: self.network,
            address: self.address.clone(),
            permissions: self.perm_file,
            group: self.group_perm,
        }
    }

    /// 归一化后的空闲超时。
    pub fn idle_timeout(&self) -> Option<Duration> {
        effective_idle_timeout(self.con_idle_timeout)
    }

    /// 与进程级默认配置合并后的证书材料。
    pub fn tls_material(&self) -> Option<TlsConfig> {
        match &self.tls.config {
            Some(config) => Some(config.clone().with_default()),
            None => default_config().cloned(),
        }
    }

    pub fn validate(&self) -> Result<(), SocketError> {
        self.descriptor().validate()?;
        if self.tls.enable {
            if self.network != NetworkProtocol::Tcp {
                return Err(SocketError::invalid_tls(format!(
                    "TLS 仅支持 tcp，当前为 {}",
                    self.network
                )));
            }
            let certificates = self
                .tls_material()
                .map(|material| material.certificate_count())
                .unwrap_or(0);
            if certificates == 0 {
                return Err(SocketError::invalid_tls("开启 TLS 但未提供任何证书"));
            }
        }
        Ok(())
    }
}

/// 客户端 TLS 段落。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientTlsSection {
    #[serde(default)]
    pub enable: bool,
    /// SNI 服务器名；为空时取地址中的主机部分。
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(skip)]
    pub config: Option<TlsConfig>,
}

/// 客户端配置。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub network: NetworkProtocol,
    pub address: String,
    #[serde(default)]
    pub tls: ClientTlsSection,
}

impl ClientConfig {
    pub fn new(network: NetworkProtocol, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            tls: ClientTlsSection::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SocketError> {
        toml::from_str(text).map_err(|err| SocketError::config(err.to_string()))
    }

    pub fn with_tls(mut self, config: TlsConfig, server_name: impl Into<String>) -> Self {
        self.tls = ClientTlsSection {
            enable: true,
            server_name: server_name.into(),
            config: Some(config),
        };
        self
    }

    pub fn descriptor(&self) -> SocketDescriptor {
        SocketDescriptor::new(self.network, self.address.clone())
    }

    /// SNI 服务器名；未配置时从地址推导，主机名为空则回退到 `localhost`。
    pub fn server_name(&self) -> String {
        if !self.tls.server_name.is_empty() {
            return self.tls.server_name.clone();
        }
        let host = self
            .address
            .rsplit_once(':')
            .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or_default();
        if host.is_empty() {
            "localhost".to_owned()
        } else {
            host.to_owned()
        }
    }

    pub fn tls_material(&self) -> Option<TlsConfig> {
        match &self.tls.config {
            Some(config) => Some(config.clone().with_default()),
            None => default_config().cloned(),
        }
    }

    pub fn validate(&self) -> Result<(), SocketError> {
        self.descriptor().validate()?;
        if self.tls.enable {
            if self.network != NetworkProtocol::Tcp {
                return Err(SocketError::invalid_tls(format!(
                    "TLS 仅支持 tcp，当前为 {}",
                    self.network
                )));
            }
            let roots = self
                .tls_material()
                .map(|material| material.root_certificate_count())
                .unwrap_or(0);
            if roots == 0 {
                return Err(SocketError::invalid_tls("开启 TLS 但未提供任何信任根证书"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use spark_socket::MAX_GID;

    fn certificate() -> anyhow::Result<TlsConfig> {
        let key_pair = rcgen::KeyPair::generate()?;
        let certificate =
            rcgen::CertificateParams::new(vec!["localhost".to_owned()])?.self_signed(&key_pair)?;
        let key = spark_socket_tls::PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|err| anyhow::anyhow!("私钥格式无效: {err}"))?;
        Ok(TlsConfig::new().with_certificate(vec![certificate.der().clone()], key))
    }

    #[test]
    fn parses_unix_server_from_toml() -> anyhow::Result<()> {
        let config = ServerConfig::from_toml_str(
            r#"
            network = "unix"
            address = "/tmp/spark-config.sock"
            perm_file = 0o660
            group_perm = 100
            con_idle_timeout_ms = 1500
            "#,
        )?;
        assert_eq!(config.network, NetworkProtocol::Unix);
        assert_eq!(config.perm_file, Some(FileMode::new(0o660)));
        assert_eq!(config.idle_timeout(), Some(Duration::from_millis(1500)));
        if cfg!(unix) {
            config.validate()?;
        }
        Ok(())
    }

    #[test]
    fn unknown_fields_and_protocols_are_rejected() {
        assert!(matches!(
            ServerConfig::from_toml_str("network = \"tcp\"\naddress = \":80\"\nbogus = 1"),
            Err(SocketError::Config { .. })
        ));
        assert!(matches!(
            ClientConfig::from_toml_str("network = \"sctp\"\naddress = \":80\""),
            Err(SocketError::Config { .. })
        ));
    }

    #[test]
    fn sub_second_idle_timeout_is_disabled() {
        let config = ServerConfig::new(NetworkProtocol::Tcp, ":0")
            .with_idle_timeout(Duration::from_millis(200));
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn tls_requires_tcp_and_certificates() -> anyhow::Result<()> {
        let config = ServerConfig {
            tls: ServerTlsSection {
                enable: true,
                config: Some(TlsConfig::new()),
            },
            ..ServerConfig::new(NetworkProtocol::Tcp, "127.0.0.1:0")
        };
        assert!(matches!(
            config.validate(),
            Err(SocketError::InvalidTlsConfig { .. })
        ));

        let config = ServerConfig::new(NetworkProtocol::Udp, "127.0.0.1:0").with_tls(certificate()?);
        assert!(matches!(
            config.validate(),
            Err(SocketError::InvalidTlsConfig { .. })
        ));

        let config = ServerConfig::new(NetworkProtocol::Tcp, "127.0.0.1:0").with_tls(certificate()?);
        config.validate()?;

        let client = ClientConfig::new(NetworkProtocol::Tcp, "127.0.0.1:0")
            .with_tls(TlsConfig::new(), "localhost");
        assert!(matches!(
            client.validate(),
            Err(SocketError::InvalidTlsConfig { .. })
        ));
        Ok(())
    }

    #[test]
    fn server_name_falls_back_to_address_host() {
        let config = ClientConfig::new(NetworkProtocol::Tcp, "example.org:443");
        assert_eq!(config.server_name(), "example.org");
        let config = ClientConfig::new(NetworkProtocol::Tcp, ":443");
        assert_eq!(config.server_name(), "localhost");
        let config = ClientConfig::new(NetworkProtocol::Tcp, "[::1]:443");
        assert_eq!(config.server_name(), "::1");
    }

    proptest! {
        #[test]
        fn unix_group_validation_matches_range(group in -100i32..40_000) {
            prop_assume!(cfg!(unix));
            let config = ServerConfig::new(NetworkProtocol::Unix, "/tmp/spark-prop.sock")
                .with_permissions(FileMode::new(0o600), Some(group));
            let accepted = config.validate().is_ok();
            prop_assert_eq!(accepted, (0..=MAX_GID).contains(&group));
        }
    }
}
