use crate::session::Session;
use futures::future::BoxFuture;
use std::future::Future;

/// 连接处理器。
///
/// 流式服务端为每个连接调用一次；数据报服务端在监听期间反复调用，
/// 每次调用都拿到绑定套接字上的会话。处理器返回即表示会话结束。
///
/// 任意 `Fn(Session) -> impl Future<Output = ()>` 闭包都自动实现本 trait。
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, session: Session) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, session: Session) -> BoxFuture<'static, ()> {
        Box::pin(self(session))
    }
}
