use std::fmt;

/// 单个连接在生命周期内经历的事件。
///
/// 每个连接的事件严格按 `Dial → New → Handler → Read/Write… → Close` 的顺序发出；
/// 数据报服务端没有连接概念，只发出 `Read` 与 `Write`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// 客户端开始拨号。
    Dial,
    /// 连接建立（服务端 accept 或客户端拨号成功）。
    New,
    Read,
    /// 读方向到达流末尾。
    CloseRead,
    /// 即将调用连接处理器。
    Handler,
    Write,
    /// 写方向已关闭。
    CloseWrite,
    Close,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Dial => "Dial Connection",
            ConnState::New => "New Connection",
            ConnState::Read => "Read Incoming Stream",
            ConnState::CloseRead => "Close Incoming Stream",
            ConnState::Handler => "Run Handler",
            ConnState::Write => "Write Outgoing Steam",
            ConnState::CloseWrite => "Close Outgoing Stream",
            ConnState::Close => "Close Connection",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
