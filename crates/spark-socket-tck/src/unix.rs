//! Unix 流断言：套接字文件权限、属组校验与 TLS 空操作。

use crate::support::{echo, read_exact, wait_until};
use anyhow::Context;
use spark_socket::{CallContext, FileMode, MAX_GID, NetworkProtocol, SocketError};
use spark_socket_client::{SocketClient, StreamClient};
use spark_socket_config::{ClientConfig, ServerConfig};
use std::path::Path;
use std::time::Duration;

fn unix_client(path: &Path) -> Result<StreamClient, SocketError> {
    StreamClient::new(
        &ClientConfig::new(NetworkProtocol::Unix, path.to_string_lossy()),
        None,
    )
}

/// 监听时按配置设置文件权限，关闭后删除套接字文件。
pub async fn assert_socket_file_lifecycle() -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().context("创建临时目录失败")?;
    let path = dir.path().join("lifecycle.sock");
    std::fs::write(&path, b"stale").context("写入残留文件失败")?;

    let config = ServerConfig::new(NetworkProtocol::Unix, path.to_string_lossy())
        .with_permissions(FileMode::new(0o640), None);
    let server = spark_socket_server::new(&config, echo)?;
    server.listen(&CallContext::background()).await.context("残留文件应被清理后绑定")?;

    let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
    anyhow::ensure!(mode == 0o640, "套接字文件权限为 {mode:o}，期望 640");

    let mut client = unix_client(&path)?;
    client.connect(&CallContext::background()).await?;
    client.write(b"unix stream").await?;
    anyhow::ensure!(read_exact(&mut client, 11).await? == b"unix stream", "Unix 回显不一致");
    client.close().await?;

    wait_until(Duration::from_secs(2), "Unix 连接释放", || server.open_connections() == 0).await?;
    server.close().await?;
    anyhow::ensure!(!path.exists(), "关闭后套接字文件仍然存在");
    Ok(())
}

/// 越界属组在绑定任何东西之前被拒绝。
pub async fn assert_invalid_group_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir().context("创建临时目录失败")?;
    let path = dir.path().join("group.sock");

    let config = ServerConfig::new(NetworkProtocol::Unix, path.to_string_lossy())
        .with_permissions(FileMode::new(0o600), Some(MAX_GID + 1));
    anyhow::ensure!(
        matches!(
            spark_socket_server::new(&config, echo),
            Err(SocketError::InvalidGroup { .. })
        ),
        "配置中的越界属组应被拒绝"
    );

    let config = ServerConfig::new(NetworkProtocol::Unix, path.to_string_lossy());
    let server = spark_socket_server::new(&config, echo)?;
    let result = server.register_socket(&path, Some(FileMode::new(0o600)), Some(MAX_GID + 1));
    anyhow::ensure!(
        matches!(result, Err(SocketError::InvalidGroup { group, max }) if group == MAX_GID + 1 && max == MAX_GID),
        "register_socket 应返回 InvalidGroup，实际为 {result:?}"
    );
    anyhow::ensure!(!path.exists(), "属组非法时不应创建套接字文件");
    anyhow::ensure!(!server.is_running(), "属组非法时不应开始监听");
    Ok(())
}

/// Unix 流上的 `set_tls` 返回 `Ok` 且不改变明文行为。
pub async fn assert_tls_is_no_op() -> anyhow::Result<()> {
    let fixture = crate::support::tls_fixture()?;
    let dir = tempfile::tempdir().context("创建临时目录失败")?;
    let path = dir.path().join("tls.sock");

    let server = spark_socket_server::new(
        &ServerConfig::new(NetworkProtocol::Unix, path.to_string_lossy()),
        echo,
    )?;
    server.set_tls(true, Some(&fixture.server)).context("服务端 set_tls 应为空操作")?;
    server.listen(&CallContext::background()).await?;

    let mut client = unix_client(&path)?;
    client
        .set_tls(true, Some(&fixture.client), "localhost")
        .context("客户端 set_tls 应为空操作")?;
    anyhow::ensure!(!client.is_tls(), "Unix 客户端不应开启 TLS");
    client.connect(&CallContext::background()).await?;
    client.write(b"plain").await?;
    anyhow::ensure!(read_exact(&mut client, 5).await? == b"plain", "明文回显不一致");
    client.close().await?;

    wait_until(Duration::from_secs(2), "Unix 连接释放", || server.open_connections() == 0).await?;
    server.close().await?;
    Ok(())
}
