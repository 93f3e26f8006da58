//! 端点描述与 Unix 套接字文件管理。
//!
//! # 意图（Why）
//! - 监听与拨号前统一校验“网络类型 + 地址 + 权限 + 属组”，让非法配置在调用点同步失败，
//!   而不是在监听任务里以异步错误的形式出现。
//!
//! # 契约（What）
//! - 权限与属组只对 `unix`/`unixgram` 生效，其它传输忽略；
//! - 属组取值必须落在 `0..=MAX_GID`；
//! - 形如 `:8080` 的地址在服务端解析为通配地址、在客户端解析为回环地址。

use crate::error::{OperationKind, SocketError};
use crate::network::NetworkProtocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Unix 套接字文件允许设置的最大属组 ID。
pub const MAX_GID: i32 = 32767;

/// Unix 文件权限位（例如 `0o660`）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileMode(u32);

impl FileMode {
    pub const fn new(mode: u32) -> Self {
        Self(mode & 0o7777)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

/// 经过校验的端点描述。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketDescriptor {
    pub network: NetworkProtocol,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<FileMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<i32>,
}

impl SocketDescriptor {
    pub fn new(network: NetworkProtocol, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            permissions: None,
            group: None,
        }
    }

    pub fn with_permissions(mut self, permissions: FileMode) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_group(mut self, group: i32) -> Self {
        self.group = Some(group);
        self
    }

    /// 校验描述是否可用于监听或拨号。
    pub fn validate(&self) -> Result<(), SocketError> {
        if !self.network.is_supported() {
            return Err(SocketError::InvalidProtocol {
                network: self.network.to_string(),
            });
        }
        if self.address.trim().is_empty() {
            return Err(self.invalid_address());
        }
        if self.network.is_unix() {
            validate_group(self.group)?;
        } else {
            split_host_port(&self.address).ok_or_else(|| self.invalid_address())?;
        }
        Ok(())
    }

    /// 服务端绑定目标：空主机名折叠为 IPv4 通配地址。
    pub fn listen_target(&self) -> Result<String, SocketError> {
        self.inet_target("0.0.0.0")
    }

    /// 客户端拨号目标：空主机名折叠为回环地址。
    pub fn dial_target(&self) -> Result<String, SocketError> {
        self.inet_target("127.0.0.1")
    }

    /// Unix 传输的文件路径。
    pub fn unix_path(&self) -> Result<&Path, SocketError> {
        if !self.network.is_unix() {
            return Err(SocketError::InvalidProtocol {
                network: self.network.to_string(),
            });
        }
        if self.address.trim().is_empty() {
            return Err(self.invalid_address());
        }
        Ok(Path::new(&self.address))
    }

    fn inet_target(&self, wildcard: &str) -> Result<String, SocketError> {
        if self.network.is_unix() {
            return Err(SocketError::InvalidProtocol {
                network: self.network.to_string(),
            });
        }
        let (host, port) = split_host_port(&self.address).ok_or_else(|| self.invalid_address())?;
        if host.is_empty() {
            Ok(format!("{wildcard}:{port}"))
        } else {
            Ok(self.address.trim().to_owned())
        }
    }

    fn invalid_address(&self) -> SocketError {
        SocketError::InvalidAddress {
            address: self.address.clone(),
        }
    }
}

/// 校验 Unix 套接字文件属组。
pub fn validate_group(group: Option<i32>) -> Result<(), SocketError> {
    match group {
        Some(group) if !(0..=MAX_GID).contains(&group) => Err(SocketError::InvalidGroup {
            group,
            max: MAX_GID,
        }),
        _ => Ok(()),
    }
}

/// 拆分 `host:port`，支持 `[v6]:port` 与省略主机名的 `:port`。
fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let address = address.trim();
    if address.parse::<SocketAddr>().is_ok() {
        let (host, port) = address.rsplit_once(':')?;
        return Some((host, port.parse().ok()?));
    }
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host);
    if host.contains(':') || host.chars().any(char::is_whitespace) {
        return None;
    }
    Some((host, port))
}

/// 回调中使用的端点表示，覆盖 IP 与 Unix 路径两类地址。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    Inet(SocketAddr),
    /// Unix 域地址；匿名（未绑定路径）的对端为 `None`。
    Unix(Option<PathBuf>),
    Unspecified,
}

impl SocketAddress {
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            SocketAddress::Inet(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn as_pathname(&self) -> Option<&Path> {
        match self {
            SocketAddress::Unix(Some(path)) => Some(path.as_path()),
            _ => None,
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Inet(addr) => write!(f, "{addr}"),
            SocketAddress::Unix(Some(path)) => write!(f, "{}", path.display()),
            SocketAddress::Unix(None) => f.write_str("@unnamed"),
            SocketAddress::Unspecified => f.write_str("-"),
        }
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        SocketAddress::Inet(addr)
    }
}

#[cfg(unix)]
impl From<tokio::net::unix::SocketAddr> for SocketAddress {
    fn from(addr: tokio::net::unix::SocketAddr) -> Self {
        SocketAddress::Unix(addr.as_pathname().map(Path::to_path_buf))
    }
}

/// 监听端持有的 Unix 套接字文件。
///
/// 绑定前清理残留文件，绑定后应用权限与属组，关闭时删除文件。
#[derive(Clone, Debug)]
pub struct UnixSocketFile {
    path: PathBuf,
}

impl UnixSocketFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 删除上一次运行遗留的套接字文件；文件不存在视为成功。
    pub fn remove_stale(&self) -> Result<(), SocketError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "removed stale unix socket file");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SocketError::io(OperationKind::BIND, err)),
        }
    }

    /// 应用文件权限与属组。
    #[cfg(unix)]
    pub fn apply(
        &self,
        permissions: Option<FileMode>,
        group: Option<i32>,
    ) -> Result<(), SocketError> {
        use std::os::unix::fs::PermissionsExt;

        validate_group(group)?;
        if let Some(mode) = permissions {
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode.bits()))
                .map_err(|err| SocketError::io(OperationKind::CONFIGURE, err))?;
        }
        if let Some(group) = group {
            let gid = u32::try_from(group).map_err(|_| SocketError::InvalidGroup {
                group,
                max: MAX_GID,
            })?;
            std::os::unix::fs::chown(&self.path, None, Some(gid))
                .map_err(|err| SocketError::io(OperationKind::CONFIGURE, err))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply(
        &self,
        _permissions: Option<FileMode>,
        group: Option<i32>,
    ) -> Result<(), SocketError> {
        validate_group(group)
    }

    /// 关闭时删除套接字文件，失败只记录日志。
    pub fn remove(&self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to remove unix socket file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn port_only_addresses_resolve_per_role() {
        let descriptor = SocketDescriptor::new(NetworkProtocol::Tcp, ":8080");
        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.listen_target().ok().as_deref(), Some("0.0.0.0:8080"));
        assert_eq!(descriptor.dial_target().ok().as_deref(), Some("127.0.0.1:8080"));
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for address in ["", "localhost", "127.0.0.1:http", "a b:80", "::1:80"] {
            let descriptor = SocketDescriptor::new(NetworkProtocol::Udp, address);
            assert!(
                matches!(descriptor.validate(), Err(SocketError::InvalidAddress { .. })),
                "地址 {address:?} 应当被拒绝"
            );
        }
        let descriptor = SocketDescriptor::new(NetworkProtocol::Tcp, "[::1]:9000");
        assert!(descriptor.validate().is_ok());
        let descriptor = SocketDescriptor::new(NetworkProtocol::Tcp, "example.org:443");
        assert!(descriptor.validate().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn group_above_limit_is_invalid() {
        let descriptor =
            SocketDescriptor::new(NetworkProtocol::Unix, "/tmp/spark.sock").with_group(MAX_GID + 1);
        assert!(matches!(
            descriptor.validate(),
            Err(SocketError::InvalidGroup { group, .. }) if group == MAX_GID + 1
        ));
    }

    #[test]
    fn inet_targets_reject_unix_descriptors() {
        let descriptor = SocketDescriptor::new(NetworkProtocol::UnixGram, "/tmp/spark.sock");
        assert!(matches!(
            descriptor.listen_target(),
            Err(SocketError::InvalidProtocol { .. })
        ));
        assert!(descriptor.unix_path().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn socket_file_lifecycle() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"")?;
        let file = UnixSocketFile::new(&path);
        file.remove_stale()?;
        assert!(!path.exists(), "残留文件应当被删除");
        file.remove_stale()?;

        std::fs::write(&path, b"")?;
        file.apply(Some(FileMode::new(0o640)), None)?;
        let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);

        file.remove();
        assert!(!path.exists());
        Ok(())
    }

    proptest! {
        #[test]
        fn group_range_is_enforced(group in any::<i32>()) {
            let accepted = validate_group(Some(group)).is_ok();
            prop_assert_eq!(accepted, (0..=MAX_GID).contains(&group));
        }
    }
}
