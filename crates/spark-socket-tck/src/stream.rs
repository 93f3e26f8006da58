//! TCP 服务端断言：连接计数、优雅关闭、大载荷回显与 TLS。

use crate::support::{
    inet_addr, loopback_server_config, read_exact, tcp_client, tcp_echo_server, tls_fixture,
    wait_until,
};
use anyhow::Context;
use spark_socket::{
    CallContext, ConnState, NetworkProtocol, SHUTDOWN_CEILING, SocketAddress, SocketError,
};
use spark_socket_client::{SocketClient, StreamClient};
use spark_socket_config::ClientConfig;
use spark_socket_server::{Session, SocketServer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};

const SETTLE: Duration = Duration::from_secs(2);

/// 三个客户端的完整生命周期：计数 3 → 关闭一个后为 2 → 关闭等待剩余两个 → `Ok`。
pub async fn assert_connection_count_scenario() -> anyhow::Result<()> {
    let server = tcp_echo_server(loopback_server_config()).await?;
    let addr = inet_addr(server.as_ref())?;

    let mut clients = Vec::new();
    for index in 0..3 {
        let mut client = tcp_client(addr)?;
        client
            .connect(&CallContext::background())
            .await
            .with_context(|| format!("第 {index} 个客户端连接失败"))?;
        clients.push(client);
    }
    wait_until(SETTLE, "开放连接数达到 3", || server.open_connections() == 3).await?;

    let mut first = clients.remove(0);
    first.close().await.context("关闭第一个客户端失败")?;
    wait_until(SETTLE, "开放连接数回落到 2", || server.open_connections() == 2).await?;

    let closer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        for mut client in clients {
            let _ = client.close().await;
        }
    });
    server
        .shutdown(&CallContext::background())
        .await
        .context("剩余连接关闭后 shutdown 应成功")?;
    closer.await.context("关闭任务异常退出")?;
    anyhow::ensure!(server.open_connections() == 0, "关闭后仍有开放连接");
    anyhow::ensure!(!server.is_running(), "关闭后服务端仍在运行");
    anyhow::ensure!(server.is_gone(), "关闭后 gone 标记应置位");
    Ok(())
}

/// 1 MiB 载荷分块回显后逐字节一致。
pub async fn assert_large_payload_echo() -> anyhow::Result<()> {
    let server = tcp_echo_server(loopback_server_config()).await?;
    let mut client = tcp_client(inet_addr(server.as_ref())?)?;
    client.connect(&CallContext::background()).await?;

    let payload: Vec<u8> = (0..1024 * 1024).map(|index| (index % 251) as u8).collect();
    let mut echoed = Vec::with_capacity(payload.len());
    for chunk in payload.chunks(64 * 1024) {
        client.write(chunk).await.context("写入分块失败")?;
        echoed.extend(read_exact(&mut client, chunk.len()).await?);
    }
    anyhow::ensure!(echoed == payload, "回显内容与原始载荷不一致");

    client.close().await?;
    server.close().await?;
    Ok(())
}

/// 零连接时 `shutdown` 立即返回；从未监听的服务端同样立即返回。
pub async fn assert_immediate_shutdown() -> anyhow::Result<()> {
    let idle = spark_socket_server::new(&loopback_server_config(), crate::support::echo)?;
    let started = Instant::now();
    idle.shutdown(&CallContext::background()).await?;
    anyhow::ensure!(started.elapsed() < Duration::from_millis(100), "未监听时关闭应立即返回");

    let server = tcp_echo_server(loopback_server_config()).await?;
    let started = Instant::now();
    server.shutdown(&CallContext::background()).await?;
    anyhow::ensure!(
        started.elapsed() < Duration::from_millis(200),
        "零连接时关闭耗时 {:?}",
        started.elapsed()
    );
    Ok(())
}

/// 处理器不返回时，`shutdown` 在内部上限后以 `ShutdownTimeout` 结束，释放后重试成功。
pub async fn assert_shutdown_timeout() -> anyhow::Result<()> {
    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);
    let server = spark_socket_server::new(&loopback_server_config(), move |_session: Session| {
        let gate = Arc::clone(&gate);
        async move { gate.notified().await }
    })?;
    server.listen(&CallContext::background()).await?;

    let mut client = tcp_client(inet_addr(server.as_ref())?)?;
    client.connect(&CallContext::background()).await?;
    wait_until(SETTLE, "卡住的连接被计数", || server.open_connections() == 1).await?;

    let started = Instant::now();
    let result = server.shutdown(&CallContext::background()).await;
    let elapsed = started.elapsed();
    anyhow::ensure!(
        matches!(result, Err(SocketError::ShutdownTimeout { open: 1 })),
        "应以 ShutdownTimeout 结束，实际为 {result:?}"
    );
    anyhow::ensure!(
        elapsed >= SHUTDOWN_CEILING.saturating_sub(Duration::from_millis(50))
            && elapsed < SHUTDOWN_CEILING * 3,
        "关闭等待时间 {elapsed:?} 偏离上限"
    );
    anyhow::ensure!(server.is_gone(), "超时后 gone 标记应保持置位");

    release.notify_one();
    wait_until(SETTLE, "处理器释放后计数归零", || server.open_connections() == 0).await?;
    server
        .shutdown(&CallContext::background())
        .await
        .context("释放后再次关闭应成功")?;
    let _ = client.close().await;
    Ok(())
}

/// 快速反复连接/断开后计数归零，既不泄漏也不重复扣减。
pub async fn assert_rapid_connect_disconnect() -> anyhow::Result<()> {
    let server = tcp_echo_server(loopback_server_config()).await?;
    let addr = inet_addr(server.as_ref())?;
    for _ in 0..64 {
        let mut client = tcp_client(addr)?;
        client.connect(&CallContext::background()).await?;
        client.close().await?;
        anyhow::ensure!(server.open_connections() >= 0, "开放连接数出现负值");
    }
    wait_until(SETTLE, "反复连接后计数归零", || server.open_connections() == 0).await?;
    server.close().await?;
    Ok(())
}

/// TLS 终结：自签名证书握手后完成回显。
pub async fn assert_tls_round_trip() -> anyhow::Result<()> {
    let fixture = tls_fixture()?;
    let server = tcp_echo_server(loopback_server_config().with_tls(fixture.server)).await?;
    let addr = inet_addr(server.as_ref())?;

    let config =
        ClientConfig::new(NetworkProtocol::Tcp, addr.to_string()).with_tls(fixture.client, "localhost");
    let mut client = StreamClient::new(&config, None)?;
    anyhow::ensure!(client.is_tls(), "客户端应已开启 TLS");
    client.connect(&CallContext::background()).await.context("TLS 握手失败")?;
    client.write(b"over tls").await?;
    let echoed = read_exact(&mut client, 8).await?;
    anyhow::ensure!(echoed == b"over tls", "TLS 回显内容不一致");

    let mut plain = tcp_client(addr)?;
    plain.connect(&CallContext::background()).await?;
    plain.write(b"plaintext").await?;
    let mut buf = [0u8; 16];
    let outcome = tokio::time::timeout(SETTLE, plain.read(&mut buf)).await;
    anyhow::ensure!(
        !matches!(outcome, Ok(Ok(len)) if &buf[..len] == b"plaintext"),
        "明文客户端不应得到回显"
    );

    client.close().await?;
    let _ = plain.close().await;
    wait_until(SETTLE, "TLS 连接释放", || server.open_connections() == 0).await?;
    server.close().await?;
    Ok(())
}

/// 握手失败：错误回调收到 `spark.socket.handshake_failed`，处理器不被调用，
/// 连接事件为 `New` → `Close`，计数回到 0。
pub async fn assert_tls_handshake_failure() -> anyhow::Result<()> {
    let fixture = tls_fixture()?;
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    let server = spark_socket_server::new(
        &loopback_server_config().with_tls(fixture.server),
        move |_session: Session| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}
        },
    )?;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let error_sink = Arc::clone(&errors);
    server.register_func_error(Some(Arc::new(move |err: &SocketError| {
        if let Ok(mut errors) = error_sink.lock() {
            errors.push(err.code());
        }
    })));
    let events = Arc::new(Mutex::new(Vec::new()));
    let event_sink = Arc::clone(&events);
    server.register_func_info(Some(Arc::new(
        move |_: &SocketAddress, _: &SocketAddress, state: ConnState| {
            if let Ok(mut events) = event_sink.lock() {
                events.push(state);
            }
        },
    )));
    server.listen(&CallContext::background()).await?;

    let mut plain = tcp_client(inet_addr(server.as_ref())?)?;
    plain.connect(&CallContext::background()).await?;
    plain.write(b"definitely not a client hello").await?;
    let recorded = Arc::clone(&errors);
    wait_until(SETTLE, "握手失败被上报", || {
        recorded.lock().is_ok_and(|errors| !errors.is_empty())
    })
    .await?;
    wait_until(SETTLE, "握手失败后计数归零", || server.open_connections() == 0).await?;
    let _ = plain.close().await;

    let errors = errors.lock().map_err(|_| anyhow::anyhow!("错误锁中毒"))?.clone();
    anyhow::ensure!(
        errors.contains(&"spark.socket.handshake_failed"),
        "错误回调应收到握手失败，实际为 {errors:?}"
    );
    anyhow::ensure!(handled.load(Ordering::SeqCst) == 0, "握手失败时不应调用处理器");
    let events = events.lock().map_err(|_| anyhow::anyhow!("事件锁中毒"))?.clone();
    anyhow::ensure!(
        events == [ConnState::New, ConnState::Close],
        "握手失败的连接事件应为 New → Close，实际为 {events:?}"
    );

    server.close().await?;
    Ok(())
}

/// 空闲超时：静默连接上的读取在约定时长后以 `IdleTimeout` 结束，连接随之释放。
pub async fn assert_idle_timeout() -> anyhow::Result<()> {
    let idle = Duration::from_secs(1);
    let (tx, mut rx) = mpsc::unbounded_channel::<(Duration, bool)>();
    let server = spark_socket_server::new(
        &loopback_server_config().with_idle_timeout(idle),
        move |mut session: Session| {
            let tx = tx.clone();
            async move {
                let started = Instant::now();
                let mut buf = [0u8; 16];
                let result = session.read(&mut buf).await;
                let timed_out = matches!(result, Err(SocketError::IdleTimeout(limit)) if limit == idle);
                let _ = tx.send((started.elapsed(), timed_out));
            }
        },
    )?;
    server.listen(&CallContext::background()).await?;

    let mut client = tcp_client(inet_addr(server.as_ref())?)?;
    client.connect(&CallContext::background()).await?;
    let (elapsed, timed_out) = tokio::time::timeout(idle * 3, rx.recv())
        .await
        .context("等待空闲超时结果超时")?
        .context("处理器通道提前关闭")?;
    anyhow::ensure!(timed_out, "静默连接上的读取应返回 IdleTimeout");
    anyhow::ensure!(
        elapsed >= idle.saturating_sub(Duration::from_millis(50)),
        "空闲超时过早触发: {elapsed:?}"
    );
    wait_until(SETTLE, "空闲连接释放", || server.open_connections() == 0).await?;

    let _ = client.close().await;
    server.close().await?;
    Ok(())
}
