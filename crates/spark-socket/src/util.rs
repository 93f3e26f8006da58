use crate::context::{CallContext, Cancellation, Deadline};
use crate::error::{OperationKind, SocketError};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::time::Instant as TokioInstant;

const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub(crate) fn to_tokio_deadline(deadline: Deadline) -> Option<TokioInstant> {
    deadline.instant().map(TokioInstant::from_std)
}

pub(crate) async fn wait_for_cancellation(cancellation: &Cancellation) {
    while !cancellation.is_cancelled() {
        tokio::time::sleep(CANCELLATION_POLL_INTERVAL).await;
    }
}

/// 在保留取消/超时语义的前提下执行 IO Future。
///
/// 先检查上下文是否已经结束，再让 IO、取消轮询与截止时间三者竞争；
/// 取消优先于超时，超时优先于 IO 结果。
pub async fn run_with_context<F, T>(
    ctx: &CallContext,
    kind: OperationKind,
    future: F,
) -> Result<T, SocketError>
where
    F: Future<Output = io::Result<T>>,
{
    if ctx.cancellation().is_cancelled() {
        return Err(SocketError::Cancelled { kind });
    }
    if ctx.deadline().is_expired() {
        return Err(SocketError::Timeout { kind });
    }

    let cancel = wait_for_cancellation(ctx.cancellation());
    tokio::pin!(cancel);
    tokio::pin!(future);

    if let Some(deadline) = to_tokio_deadline(ctx.deadline()) {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            _ = &mut cancel => Err(SocketError::Cancelled { kind }),
            _ = &mut sleep => Err(SocketError::Timeout { kind }),
            result = &mut future => result.map_err(|err| SocketError::io(kind, err)),
        }
    } else {
        tokio::select! {
            biased;
            _ = &mut cancel => Err(SocketError::Cancelled { kind }),
            result = &mut future => result.map_err(|err| SocketError::io(kind, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_deadline_short_circuits() {
        let ctx = CallContext::builder()
            .with_deadline(Deadline::after(Duration::ZERO))
            .build();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let result = run_with_context(&ctx, OperationKind::CONNECT, async { Ok(()) }).await;
        assert!(matches!(result, Err(SocketError::Timeout { kind }) if kind == OperationKind::CONNECT));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_io_observes_cancellation() {
        let ctx = CallContext::background();
        let trigger = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancellation().cancel();
        });
        let result = run_with_context(
            &ctx,
            OperationKind::READ,
            std::future::pending::<io::Result<()>>(),
        )
        .await;
        assert!(matches!(result, Err(SocketError::Cancelled { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn io_errors_are_wrapped_with_operation() {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let result: Result<(), _> = run_with_context(&ctx, OperationKind::WRITE, async {
            Err(io::Error::from(io::ErrorKind::ConnectionReset))
        })
        .await;
        assert!(matches!(result, Err(ref err) if err.code() == "spark.socket.write_failed"));
    }
}
