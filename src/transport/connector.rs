use super::{BackendSecurity, Transport};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::tls;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// 后端连接建立超时
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive 首次探测时间
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// 后端连接工厂
///
/// 由 MonitorServer 在构造时注入，而不是进程级单例
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// 连接到后端并返回双向字节流
    async fn connect(
        &self,
        host: &str,
        port: u16,
        security: BackendSecurity,
    ) -> Result<Pin<Box<dyn Transport>>>;
}

/// 基于 tokio 的 TCP / TLS 连接工厂
pub struct TcpConnector {
    tls: TlsConnector,
    server_name: Option<String>,
    connect_timeout: Duration,
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(tls: TlsConnector) -> Self {
        Self {
            tls,
            server_name: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: Some(KEEPALIVE_TIME),
        }
    }

    /// 根据监控配置创建（加载 TLS 客户端配置）
    pub fn from_config(config: &MonitorConfig) -> anyhow::Result<Self> {
        let tls_config =
            tls::load_client_config(config.tls.ca_cert_path.as_deref(), config.tls.skip_verify)?;

        Ok(Self::new(TlsConnector::from(tls_config))
            .with_server_name(config.tls.server_name.clone())
            .with_connect_timeout(config.connect_timeout()))
    }

    /// 覆盖 TLS SNI / 证书校验使用的名称
    pub fn with_server_name(mut self, server_name: Option<String>) -> Self {
        self.server_name = server_name;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 设置 TCP keepalive（None 表示不启用）
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    async fn connect_tcp(&self, addr: &str) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                MonitorError::backend_connect(
                    addr,
                    io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
                )
            })?
            .map_err(|e| MonitorError::backend_connect(addr, e))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on backend connection: {}", e);
        }
        self.apply_keepalive(&stream);

        Ok(stream)
    }

    fn apply_keepalive(&self, stream: &TcpStream) {
        let Some(time) = self.keepalive else {
            return;
        };

        let keepalive = TcpKeepalive::new().with_time(time);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on backend connection: {}", e);
        }
    }
}

#[async_trait]
impl BackendConnector for TcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        security: BackendSecurity,
    ) -> Result<Pin<Box<dyn Transport>>> {
        let addr = format!("{}:{}", host, port);
        debug!("Connecting to backend {} ({})", addr, security);

        let tcp_stream = self.connect_tcp(&addr).await?;

        match security {
            BackendSecurity::Plain => Ok(Box::pin(tcp_stream)),
            BackendSecurity::Tls => {
                let name = self.server_name.as_deref().unwrap_or(host);
                let server_name = ServerName::try_from(name.to_string())
                    .map_err(|e| MonitorError::tls(format!("Invalid server name '{}': {}", name, e)))?;

                let tls_stream = self
                    .tls
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(|e| {
                        MonitorError::tls(format!("TLS handshake with {} failed: {}", addr, e))
                    })?;

                info!("TLS connection established to {}", addr);
                Ok(Box::pin(tls_stream))
            }
        }
    }
}
