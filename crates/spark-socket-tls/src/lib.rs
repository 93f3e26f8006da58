#![deny(unsafe_code)]
#![doc = r#"
# spark-socket-tls

## 设计动机（Why）
- 为 TCP 流传输提供可选的 TLS 终结（服务端）与 TLS 发起（客户端）。
- 证书材料由外部证书构建器生成，本 crate 只消费 DER 形式的证书链、私钥与信任根。

## 核心契约（What）
- [`TlsConfig`]：声明式证书材料，可叠加在进程级默认配置（[`set_default_config`]）之上。
- [`ServerTlsBinding`]：服务端 TLS 绑定，监听器在绑定时取一次快照，生命周期内不再变化。
- [`ClientTlsBinding`]：客户端 TLS 绑定，携带 SNI 服务器名。
- [`StreamConn`]：明文 TCP、Unix 流或 TLS 流的统一字节流。

## 实现策略（How）
- 绑定内部使用 `ArcSwapOption` 保存已构建好的 rustls 配置，读写均无锁。
- 加密套件固定使用 aws-lc-rs 提供者，无需调用方安装全局 `CryptoProvider`。

## 风险与考量（Trade-offs）
- 仅 TCP 支持 TLS；Unix 域与数据报传输对 TLS 设置一律视为空操作。
"#]

mod client;
mod config;
mod server;
mod stream;

pub use client::ClientTlsBinding;
pub use config::{TlsConfig, default_config, set_default_config};
pub use server::ServerTlsBinding;
pub use stream::StreamConn;

pub use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
pub use tokio_rustls::{TlsAcceptor, TlsConnector};
