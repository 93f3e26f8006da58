//! 客户端断言：一次性请求与事件顺序。

use crate::support::{inet_addr, loopback_server_config, read_exact, tcp_echo_server};
use anyhow::Context;
use futures::future::BoxFuture;
use spark_socket::{CallContext, ConnState, NetworkProtocol, SocketAddress, SocketError};
use spark_socket_client::{Client, ResponseFn, SocketClient};
use spark_socket_config::ClientConfig;
use std::sync::{Arc, Mutex};

const REQUEST: &[u8] = b"one-shot request";

fn expect_echo(client: &mut Client) -> BoxFuture<'_, Result<(), SocketError>> {
    Box::pin(async move {
        let mut buf = vec![0u8; REQUEST.len()];
        let mut filled = 0;
        while filled < buf.len() {
            let len = client.read(&mut buf[filled..]).await?;
            if len == 0 {
                return Err(SocketError::Connection);
            }
            filled += len;
        }
        if buf == REQUEST {
            Ok(())
        } else {
            Err(SocketError::Connection)
        }
    })
}

/// `once` 发送请求、读取回显并关闭；事件依次为 Dial → New → Write → Read → Close。
pub async fn assert_once_round_trip() -> anyhow::Result<()> {
    let server = tcp_echo_server(loopback_server_config()).await?;
    let config = ClientConfig::new(NetworkProtocol::Tcp, inet_addr(server.as_ref())?.to_string());
    let mut client = spark_socket_client::new(&config, None)?;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client.register_func_info(Some(Arc::new(
        move |_: &SocketAddress, _: &SocketAddress, state: ConnState| {
            if let Ok(mut events) = sink.lock() {
                events.push(state);
            }
        },
    )));

    client
        .once(&CallContext::background(), Some(REQUEST), Some(expect_echo))
        .await
        .context("一次性请求失败")?;
    anyhow::ensure!(!client.is_connected(), "once 结束后连接应已关闭");

    let events = events
        .lock()
        .map_err(|_| anyhow::anyhow!("事件锁中毒"))?
        .clone();
    anyhow::ensure!(
        events.first() == Some(&ConnState::Dial)
            && events.get(1) == Some(&ConnState::New)
            && events.contains(&ConnState::Write)
            && events.contains(&ConnState::Read)
            && events.last() == Some(&ConnState::Close),
        "事件顺序不符合预期: {events:?}"
    );

    client
        .once(&CallContext::background(), None::<&[u8]>, None::<ResponseFn<Client>>)
        .await
        .context("无请求无回调的 once 也应成功")?;

    let mut reused = spark_socket_client::new(&config, None)?;
    reused.connect(&CallContext::background()).await?;
    reused.write(b"again").await?;
    anyhow::ensure!(read_exact(&mut reused, 5).await? == b"again", "once 之后的普通连接回显不一致");
    reused.close().await?;

    server.close().await?;
    Ok(())
}
