use std::borrow::Cow;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl OperationKind {
    pub const BIND: OperationKind = OperationKind {
        code: "spark.socket.bind_failed",
        message: "socket bind",
    };
    pub const ACCEPT: OperationKind = OperationKind {
        code: "spark.socket.accept_failed",
        message: "socket accept",
    };
    pub const CONNECT: OperationKind = OperationKind {
        code: "spark.socket.connect_failed",
        message: "socket connect",
    };
    pub const READ: OperationKind = OperationKind {
        code: "spark.socket.read_failed",
        message: "socket read",
    };
    pub const WRITE: OperationKind = OperationKind {
        code: "spark.socket.write_failed",
        message: "socket write",
    };
    pub const SHUTDOWN: OperationKind = OperationKind {
        code: "spark.socket.shutdown_failed",
        message: "socket shutdown",
    };
    pub const HANDSHAKE: OperationKind = OperationKind {
        code: "spark.socket.handshake_failed",
        message: "tls handshake",
    };
    pub const CONFIGURE: OperationKind = OperationKind {
        code: "spark.socket.configure_failed",
        message: "socket configure",
    };
}

/// 错误的粗粒度分类，供调用方决定是否重试或直接放弃。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 配置或参数错误，重试无意义。
    Invalid,
    /// 对端已关闭或连接不存在。
    Closed,
    /// 截止时间到期。
    Timeout,
    /// 调用方主动取消。
    Cancelled,
    /// 短暂性故障，可在退避后重试。
    Retryable,
    /// 其它不可恢复的故障。
    NonRetryable,
}

/// 套接字框架统一错误类型。
///
/// # 契约（What）
/// - 校验类错误（`Invalid*`）在调用点同步返回，不会经过错误回调；
/// - 会话任务内部的错误仅通过错误回调上报；
/// - 每个变体都有稳定的 [`SocketError::code`]，便于日志检索与告警聚合。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SocketError {
    #[error("套接字实例无效或尚未初始化")]
    InvalidInstance,
    #[error("无效的地址: {address:?}")]
    InvalidAddress { address: String },
    #[error("不支持的网络协议: {network}")]
    InvalidProtocol { network: String },
    #[error("Unix 套接字属组 {group} 超出允许范围 0..={max}")]
    InvalidGroup { group: i32, max: i32 },
    #[error("TLS 配置无效: {reason}")]
    InvalidTlsConfig { reason: Cow<'static, str> },
    #[error("配置无效: {reason}")]
    Config { reason: Cow<'static, str> },
    #[error("连接尚未建立或已关闭")]
    Connection,
    #[error("优雅关闭超时，仍有 {open} 个开放连接")]
    ShutdownTimeout { open: i64 },
    #[error("服务已处于运行状态")]
    AlreadyRunning,
    #[error("{} cancelled", .kind.message)]
    Cancelled { kind: OperationKind },
    #[error("{} timed out", .kind.message)]
    Timeout { kind: OperationKind },
    #[error("连接空闲超过 {0:?}")]
    IdleTimeout(Duration),
    #[error("{}: {source}", .kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("TLS 握手失败: {source}")]
    Handshake {
        #[source]
        source: io::Error,
    },
    #[error("执行过程中发生 panic: {0}")]
    Panicked(String),
}

impl SocketError {
    /// 以指定操作包装 IO 错误。
    pub fn io(kind: OperationKind, source: io::Error) -> Self {
        SocketError::Io { kind, source }
    }

    pub fn invalid_tls(reason: impl Into<Cow<'static, str>>) -> Self {
        SocketError::InvalidTlsConfig {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<Cow<'static, str>>) -> Self {
        SocketError::Config {
            reason: reason.into(),
        }
    }

    /// 从 `catch_unwind` 捕获的负载构造 panic 错误。
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_owned()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        SocketError::Panicked(message)
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SocketError::InvalidInstance => "spark.socket.invalid_instance",
            SocketError::InvalidAddress { .. } => "spark.socket.invalid_address",
            SocketError::InvalidProtocol { .. } => "spark.socket.invalid_protocol",
            SocketError::InvalidGroup { .. } => "spark.socket.invalid_group",
            SocketError::InvalidTlsConfig { .. } => "spark.socket.invalid_tls_config",
            SocketError::Config { .. } => "spark.socket.invalid_config",
            SocketError::Connection => "spark.socket.connection",
            SocketError::ShutdownTimeout { .. } => "spark.socket.shutdown_timeout",
            SocketError::AlreadyRunning => "spark.socket.already_running",
            SocketError::Cancelled { .. } => "spark.socket.cancelled",
            SocketError::Timeout { .. } => "spark.socket.timeout",
            SocketError::IdleTimeout(_) => "spark.socket.idle_timeout",
            SocketError::Io { kind, .. } => kind.code,
            SocketError::Handshake { .. } => OperationKind::HANDSHAKE.code,
            SocketError::Panicked(_) => "spark.socket.panicked",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SocketError::InvalidInstance
            | SocketError::InvalidAddress { .. }
            | SocketError::InvalidProtocol { .. }
            | SocketError::InvalidGroup { .. }
            | SocketError::InvalidTlsConfig { .. }
            | SocketError::Config { .. }
            | SocketError::AlreadyRunning => ErrorCategory::Invalid,
            SocketError::Connection => ErrorCategory::Closed,
            SocketError::ShutdownTimeout { .. }
            | SocketError::Timeout { .. }
            | SocketError::IdleTimeout(_) => ErrorCategory::Timeout,
            SocketError::Cancelled { .. } => ErrorCategory::Cancelled,
            SocketError::Io { source, .. } | SocketError::Handshake { source } => {
                categorize_io_error(source)
            }
            SocketError::Panicked(_) => ErrorCategory::NonRetryable,
        }
    }

    /// 是否属于“连接已关闭”一类的噪声错误。
    pub fn is_closed(&self) -> bool {
        match self {
            SocketError::Connection => true,
            SocketError::Io { source, .. } => is_closed_error(source),
            _ => false,
        }
    }
}

/// 判断 IO 错误是否只是“对已关闭连接的操作”。
///
/// 关闭流程中监听器与连接被释放后，未完成的 accept/read 会返回这类错误；
/// 上报它们只会干扰调用方，因此在进入错误回调前过滤。
pub fn is_closed_error(error: &io::Error) -> bool {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof => true,
        _ => {
            let text = error.to_string();
            text.contains("use of closed network connection") || text.contains("closed pipe")
        }
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => ErrorCategory::Retryable,
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable => ErrorCategory::Retryable,
        ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof => ErrorCategory::Closed,
        _ => ErrorCategory::NonRetryable,
    }
}
