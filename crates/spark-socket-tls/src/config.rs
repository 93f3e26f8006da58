use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use spark_socket::SocketError;
use std::fmt;
use std::sync::{Arc, OnceLock};

static DEFAULT_CONFIG: OnceLock<TlsConfig> = OnceLock::new();

/// 设置进程级默认 TLS 配置，仅首次调用生效。
///
/// 返回 `false` 表示默认配置此前已被设置，本次调用被忽略。
pub fn set_default_config(config: TlsConfig) -> bool {
    DEFAULT_CONFIG.set(config).is_ok()
}

pub fn default_config() -> Option<&'static TlsConfig> {
    DEFAULT_CONFIG.get()
}

/// 声明式 TLS 证书材料。
///
/// # 意图（Why）
/// - 控制器只关心“有没有可用的证书与信任根”，证书的生成与加载由外部证书构建器负责；
/// - 以叠加（overlay）方式与进程级默认配置合并，便于全局统一信任根、局部替换身份证书。
///
/// # 契约（What）
/// - 服务端至少需要一条证书链与对应私钥；客户端至少需要一个信任根；
/// - [`TlsConfig::merge`] 中叠加方的非空字段覆盖默认值，空字段沿用默认值。
#[derive(Default)]
pub struct TlsConfig {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: Option<PrivateKeyDer<'static>>,
    root_certificates: Vec<CertificateDer<'static>>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置身份证书链与私钥。
    pub fn with_certificate(
        mut self,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        self.cert_chain = cert_chain;
        self.private_key = Some(private_key);
        self
    }

    pub fn with_root_certificate(mut self, certificate: CertificateDer<'static>) -> Self {
        self.root_certificates.push(certificate);
        self
    }

    pub fn with_alpn_protocol(mut self, protocol: impl Into<Vec<u8>>) -> Self {
        self.alpn_protocols.push(protocol.into());
        self
    }

    /// 身份证书链中的证书数量；缺少私钥时视为 0。
    pub fn certificate_count(&self) -> usize {
        if self.private_key.is_some() {
            self.cert_chain.len()
        } else {
            0
        }
    }

    pub fn root_certificate_count(&self) -> usize {
        self.root_certificates.len()
    }

    /// 以 `self` 为默认值叠加 `overlay`。
    pub fn merge(&self, overlay: &TlsConfig) -> TlsConfig {
        let identity = if overlay.certificate_count() > 0 {
            overlay
        } else {
            self
        };
        TlsConfig {
            cert_chain: identity.cert_chain.clone(),
            private_key: identity.private_key.as_ref().map(PrivateKeyDer::clone_key),
            root_certificates: if overlay.root_certificates.is_empty() {
                self.root_certificates.clone()
            } else {
                overlay.root_certificates.clone()
            },
            alpn_protocols: if overlay.alpn_protocols.is_empty() {
                self.alpn_protocols.clone()
            } else {
                overlay.alpn_protocols.clone()
            },
        }
    }

    /// 叠加到进程级默认配置之上；未设置默认配置时原样返回。
    pub fn with_default(self) -> TlsConfig {
        match default_config() {
            Some(defaults) => defaults.merge(&self),
            None => self,
        }
    }

    /// 构建 rustls 服务端配置。
    pub fn build_server_config(&self) -> Result<Arc<ServerConfig>, SocketError> {
        let key = match (&self.private_key, self.cert_chain.is_empty()) {
            (Some(key), false) => key.clone_key(),
            _ => return Err(SocketError::invalid_tls("缺少服务端证书链或私钥")),
        };
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|err| SocketError::invalid_tls(err.to_string()))?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), key)
            .map_err(|err| SocketError::invalid_tls(err.to_string()))?;
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(Arc::new(config))
    }

    /// 构建 rustls 客户端配置。
    pub fn build_client_config(&self) -> Result<Arc<ClientConfig>, SocketError> {
        if self.root_certificates.is_empty() {
            return Err(SocketError::invalid_tls("缺少客户端信任根证书"));
        }
        let mut roots = RootCertStore::empty();
        for certificate in &self.root_certificates {
            roots
                .add(certificate.clone())
                .map_err(|err| SocketError::invalid_tls(err.to_string()))?;
        }
        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|err| SocketError::invalid_tls(err.to_string()))?
            .with_root_certificates(roots);
        let mut config = match (&self.private_key, self.cert_chain.is_empty()) {
            (Some(key), false) => builder
                .with_client_auth_cert(self.cert_chain.clone(), key.clone_key())
                .map_err(|err| SocketError::invalid_tls(err.to_string()))?,
            _ => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(Arc::new(config))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

impl Clone for TlsConfig {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.as_ref().map(PrivateKeyDer::clone_key),
            root_certificates: self.root_certificates.clone(),
            alpn_protocols: self.alpn_protocols.clone(),
        }
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("certificates", &self.cert_chain.len())
            .field("private_key", &self.private_key.is_some())
            .field("root_certificates", &self.root_certificates.len())
            .field("alpn_protocols", &self.alpn_protocols.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use rustls_pki_types::PrivatePkcs8KeyDer;

    /// 生成自签名证书，返回 `(服务端材料, 客户端材料)`。
    pub(crate) fn self_signed(common_name: &str) -> anyhow::Result<(TlsConfig, TlsConfig)> {
        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![common_name.to_owned()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let certificate = params.self_signed(&key_pair)?;
        let cert_der = certificate.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let server = TlsConfig::new().with_certificate(vec![cert_der.clone()], key_der);
        let client = TlsConfig::new().with_root_certificate(cert_der);
        Ok((server, client))
    }

    #[test]
    fn empty_material_is_rejected() {
        let config = TlsConfig::new();
        assert_eq!(config.certificate_count(), 0);
        assert!(matches!(
            config.build_server_config(),
            Err(SocketError::InvalidTlsConfig { .. })
        ));
        assert!(matches!(
            config.build_client_config(),
            Err(SocketError::InvalidTlsConfig { .. })
        ));
    }

    #[test]
    fn overlay_keeps_default_roots() -> anyhow::Result<()> {
        let (server, client) = self_signed("localhost")?;
        let merged = client.merge(&server.clone().with_alpn_protocol("h2"));
        assert_eq!(merged.certificate_count(), 1);
        assert_eq!(merged.root_certificate_count(), 1);
        assert_eq!(merged.alpn_protocols, vec![b"h2".to_vec()]);

        let config = merged.build_server_config()?;
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
        merged.build_client_config()?;
        Ok(())
    }
}
