#![doc = r#"
# spark-socket-tck

## 章节定位（Why）
- 为四种传输的服务端与客户端提供端到端的兼容性断言：连接计数、优雅关闭、TLS、
  Unix 套接字文件与数据报收发。任何一处回归都会在集成测试中被阻断。

## 结构概览（How）
- [`support`]：日志初始化、rcgen 证书夹具、回显处理器与轮询等待工具；
- [`stream`] / [`unix`] / [`datagram`] / [`client`]：按主题分组的断言函数，
  均返回 `anyhow::Result<()>`，由 `tests/` 下的集成测试调用。

## 契约（What）
- 所有断言只绑定回环地址或临时目录中的套接字文件，可在 CI 中并行执行；
- 断言须在 Tokio 多线程运行时内调用。
"#]

pub mod client;
pub mod datagram;
pub mod stream;
pub mod support;
#[cfg(unix)]
pub mod unix;
