/// 自定义错误类型
///
/// 监控器的所有失败都通过 MonitorError 表达，交给 FailureSink 处理；
/// 二进制入口与配置加载仍使用 anyhow
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 转发方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 客户端 → 后端（请求）
    ClientToBackend,
    /// 后端 → 客户端（响应）
    BackendToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client->backend"),
            Direction::BackendToClient => write!(f, "backend->client"),
        }
    }
}

/// TCP 监控器的主要错误类型
#[derive(Error, Debug)]
pub enum MonitorError {
    /// 监听端点已关闭（正常终止 accept 循环，不上报）
    #[error("Listening endpoint closed")]
    ListenClosed,

    /// accept 失败
    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// 无法连接后端
    #[error("Failed to connect to backend {addr}: {source}")]
    BackendConnect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS 握手或配置错误
    #[error("TLS error: {0}")]
    Tls(String),

    /// 转发过程中的 I/O 错误
    #[error("Relay {direction} failed: {source}")]
    Relay {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// TLS 会话等待超时且没有交换任何数据
    #[error("No traffic exchanged within {duration:?}")]
    NoTraffic { duration: Duration },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, MonitorError>;

impl MonitorError {
    /// 创建后端连接失败错误
    pub fn backend_connect(addr: impl Into<String>, source: io::Error) -> Self {
        Self::BackendConnect {
            addr: addr.into(),
            source,
        }
    }

    /// 创建转发错误
    pub fn relay(direction: Direction, source: io::Error) -> Self {
        Self::Relay { direction, source }
    }

    /// 创建 TLS 错误
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建无流量超时错误
    pub fn no_traffic(duration: Duration) -> Self {
        Self::NoTraffic { duration }
    }

    /// 是否为监听关闭信号
    pub fn is_listen_closed(&self) -> bool {
        matches!(self, Self::ListenClosed)
    }

    /// 是否为 accept 失败
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }

    /// 是否为后端连接失败
    pub fn is_backend_connect(&self) -> bool {
        matches!(self, Self::BackendConnect { .. })
    }

    /// 是否为转发错误
    pub fn is_relay(&self) -> bool {
        matches!(self, Self::Relay { .. })
    }

    /// 是否为无流量超时
    pub fn is_no_traffic(&self) -> bool {
        matches!(self, Self::NoTraffic { .. })
    }
}

/// 阻塞读取期间出现的中断类错误，按流结束处理
pub fn is_benign_read_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
