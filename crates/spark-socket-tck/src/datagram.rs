//! 数据报断言：UDP 回复最近发送方、Unix 数据报投递与 1/0 连接计数。

use anyhow::Context;
use spark_socket::{CallContext, NetworkProtocol};
use spark_socket_client::{DatagramClient, SocketClient};
use spark_socket_config::{ClientConfig, ServerConfig};
use spark_socket_server::Session;
use std::time::Duration;

/// 把每个数据报转为大写后回复给发送方。
async fn shout(mut session: Session) {
    let mut buf = vec![0u8; 2048];
    while let Ok(len) = session.read(&mut buf).await {
        if len == 0 {
            break;
        }
        buf[..len].make_ascii_uppercase();
        let _ = session.write(&buf[..len]).await;
    }
}

/// UDP 服务端与客户端往返，连接计数在监听期间为 1、关闭后为 0。
pub async fn assert_udp_round_trip() -> anyhow::Result<()> {
    let server = spark_socket_server::new(
        &ServerConfig::new(NetworkProtocol::Udp, "127.0.0.1:0"),
        shout,
    )?;
    anyhow::ensure!(server.open_connections() == 0, "未监听时计数应为 0");
    server.listen(&CallContext::background()).await?;
    anyhow::ensure!(server.open_connections() == 1, "监听期间计数应为 1");

    let addr = server
        .local_addr()
        .and_then(|addr| addr.as_inet())
        .context("UDP 服务端应有本端地址")?;
    let mut client = DatagramClient::new(&ClientConfig::new(NetworkProtocol::Udp, addr.to_string()))?;
    client.connect(&CallContext::background()).await?;
    for word in ["alpha", "beta"] {
        client.write(word.as_bytes()).await?;
        let mut buf = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .context("等待 UDP 回复超时")??;
        anyhow::ensure!(
            buf[..len] == *word.to_ascii_uppercase().as_bytes(),
            "UDP 回复内容不一致"
        );
    }
    client.close().await?;

    server.close().await.context("UDP 服务端关闭失败")?;
    anyhow::ensure!(server.open_connections() == 0, "关闭后计数应为 0");
    anyhow::ensure!(!server.is_running(), "关闭后服务端仍在运行");
    Ok(())
}

/// Unix 数据报客户端向服务端投递，关闭后删除套接字文件。
#[cfg(unix)]
pub async fn assert_unixgram_delivery() -> anyhow::Result<()> {
    use crate::support::wait_until;
    use tokio::sync::mpsc;

    let dir = tempfile::tempdir().context("创建临时目录失败")?;
    let path = dir.path().join("gram.sock");
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let server = spark_socket_server::new(
        &ServerConfig::new(NetworkProtocol::UnixGram, path.to_string_lossy()),
        move |mut session: Session| {
            let tx = tx.clone();
            async move {
                let mut buf = vec![0u8; 2048];
                while let Ok(len) = session.read(&mut buf).await {
                    if len == 0 || tx.send(buf[..len].to_vec()).is_err() {
                        break;
                    }
                }
            }
        },
    )?;
    server.listen(&CallContext::background()).await?;
    anyhow::ensure!(path.exists(), "监听后应创建套接字文件");

    let mut client = DatagramClient::new(&ClientConfig::new(
        NetworkProtocol::UnixGram,
        path.to_string_lossy(),
    ))?;
    client.connect(&CallContext::background()).await?;
    client.write(b"first").await?;
    client.write(b"second").await?;

    let mut received = Vec::new();
    while received.len() < 2 {
        let datagram = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .context("等待 Unix 数据报超时")?
            .context("处理器通道提前关闭")?;
        received.push(datagram);
    }
    anyhow::ensure!(
        received == [b"first".to_vec(), b"second".to_vec()],
        "Unix 数据报内容或顺序不一致"
    );
    client.close().await?;

    server.close().await?;
    wait_until(Duration::from_secs(1), "套接字文件被删除", || !path.exists()).await?;
    Ok(())
}
