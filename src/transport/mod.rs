mod connector;

pub use connector::{BackendConnector, TcpConnector, DEFAULT_CONNECT_TIMEOUT};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

/// 默认使用 TLS 的后端端口（SSH、HTTPS）
pub const DEFAULT_TLS_PORTS: [u16; 2] = [22, 443];

/// 后端连接的传输安全类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendSecurity {
    /// 明文 TCP
    #[default]
    Plain,
    /// TCP + TLS
    Tls,
}

impl BackendSecurity {
    /// 根据后端端口选择传输安全类型
    pub fn for_port(port: u16, tls_ports: &[u16]) -> Self {
        if tls_ports.contains(&port) {
            Self::Tls
        } else {
            Self::Plain
        }
    }

    pub fn is_tls(self) -> bool {
        self == Self::Tls
    }
}

impl std::fmt::Display for BackendSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendSecurity::Plain => write!(f, "plain"),
            BackendSecurity::Tls => write!(f, "tls"),
        }
    }
}

impl std::str::FromStr for BackendSecurity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "tcp" => Ok(Self::Plain),
            "tls" | "ssl" => Ok(Self::Tls),
            _ => anyhow::bail!("Unknown backend security: {}", s),
        }
    }
}

/// 双向字节流抽象
///
/// 统一封装明文 TCP 与 TLS 连接，客户端连接也使用同一抽象
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
