use crate::SocketClient;
use futures::future::BoxFuture;
use spark_socket::{CallContext, DEFAULT_BUFFER_SIZE, OperationKind, SocketError};
use tokio::io::{AsyncRead, AsyncReadExt};

/// 响应回调的函数指针形态；不需要回调时可写作 `None::<ResponseFn<_>>`。
pub type ResponseFn<C> = fn(&mut C) -> BoxFuture<'_, Result<(), SocketError>>;

/// 一次性请求：连接、发送请求、处理响应、关闭。
///
/// # 契约（What）
/// - `request` 被完整拷贝到连接上，直到其返回流末尾；
/// - `on_response` 在请求发送完毕后以 `&mut client` 调用，可在其中读取响应；
/// - 无论前面哪一步失败，连接都会被关闭；关闭失败经客户端的错误回调上报，
///   不覆盖主流程的结果。
pub async fn once<C, R, F>(
    client: &mut C,
    ctx: &CallContext,
    request: Option<R>,
    on_response: Option<F>,
) -> Result<(), SocketError>
where
    C: SocketClient + ?Sized,
    R: AsyncRead + Unpin + Send,
    F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<(), SocketError>> + Send,
{
    client.connect(ctx).await?;
    let result = exchange(client, request, on_response).await;
    if let Err(err) = client.close().await {
        tracing::debug!(%err, "close after one-shot request failed");
    }
    result
}

async fn exchange<C, R, F>(
    client: &mut C,
    request: Option<R>,
    on_response: Option<F>,
) -> Result<(), SocketError>
where
    C: SocketClient + ?Sized,
    R: AsyncRead + Unpin + Send,
    F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<(), SocketError>> + Send,
{
    if let Some(mut request) = request {
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        loop {
            let len = request
                .read(&mut buf)
                .await
                .map_err(|err| SocketError::io(OperationKind::READ, err))?;
            if len == 0 {
                break;
            }
            client.write(&buf[..len]).await?;
        }
    }
    if let Some(on_response) = on_response {
        on_response(&mut *client).await?;
    }
    Ok(())
}
