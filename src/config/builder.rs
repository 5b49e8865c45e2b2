use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{validator::ConfigValidator, BackendTlsConfig, MonitorConfig};
use crate::relay::MAX_CHUNK_SIZE;
use crate::rewrite::DEFAULT_HOST_LOOKAHEAD;

/// MonitorConfig Builder
#[derive(Debug, Default)]
pub struct MonitorConfigBuilder {
    bind_addr: Option<String>,
    service_port: u16,
    backend_host: Option<String>,
    backend_port: Option<u16>,
    rewrite_host: Option<bool>,
    host_override: Option<String>,
    host_lookahead: Option<usize>,
    chunk_size: Option<usize>,
    capture_limit: Option<usize>,
    max_sessions: Option<usize>,
    tls_join_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    tls: BackendTlsConfig,
}

impl MonitorConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置监听地址
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    /// 设置监听端口（0 表示由系统分配）
    pub fn service_port(mut self, port: u16) -> Self {
        self.service_port = port;
        self
    }

    /// 设置后端主机
    pub fn backend_host(mut self, host: impl Into<String>) -> Self {
        self.backend_host = Some(host.into());
        self
    }

    /// 设置后端端口
    pub fn backend_port(mut self, port: u16) -> Self {
        self.backend_port = Some(port);
        self
    }

    /// 设置是否改写 Host 头
    pub fn rewrite_host(mut self, enabled: bool) -> Self {
        self.rewrite_host = Some(enabled);
        self
    }

    /// 设置改写使用的 Host 值
    pub fn host_override(mut self, host: impl Into<String>) -> Self {
        self.host_override = Some(host.into());
        self
    }

    pub fn host_lookahead(mut self, bytes: usize) -> Self {
        self.host_lookahead = Some(bytes);
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    /// 设置每个方向的抓包上限
    pub fn capture_limit(mut self, bytes: usize) -> Self {
        self.capture_limit = Some(bytes);
        self
    }

    /// 设置最大并发会话数
    pub fn max_sessions(mut self, sessions: usize) -> Self {
        self.max_sessions = Some(sessions);
        self
    }

    pub fn tls_join_timeout_secs(mut self, secs: u64) -> Self {
        self.tls_join_timeout_secs = Some(secs);
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = Some(secs);
        self
    }

    /// 设置使用 TLS 的后端端口
    pub fn tls_ports(mut self, ports: impl Into<Vec<u16>>) -> Self {
        self.tls.tls_ports = ports.into();
        self
    }

    /// 设置 CA 证书路径
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.ca_cert_path = Some(path.into());
        self
    }

    /// 设置是否跳过证书验证
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.tls.skip_verify = skip;
        self
    }

    /// 设置 TLS SNI 名称
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.tls.server_name = Some(name.into());
        self
    }

    /// 构建 MonitorConfig 并验证
    pub fn build(self) -> Result<MonitorConfig> {
        let config = MonitorConfig {
            bind_addr: self.bind_addr.unwrap_or_else(|| "0.0.0.0".to_string()),
            service_port: self.service_port,
            backend_host: self.backend_host.context("backend_host is required")?,
            backend_port: self.backend_port.context("backend_port is required")?,
            rewrite_host: self.rewrite_host.unwrap_or(true),
            host_override: self.host_override,
            host_lookahead: self.host_lookahead.unwrap_or(DEFAULT_HOST_LOOKAHEAD),
            chunk_size: self.chunk_size.unwrap_or(MAX_CHUNK_SIZE),
            capture_limit: self.capture_limit,
            max_sessions: self.max_sessions,
            tls_join_timeout_secs: self.tls_join_timeout_secs.unwrap_or(10),
            connect_timeout_secs: self.connect_timeout_secs.unwrap_or(10),
            tls: self.tls,
        };

        // 验证配置
        ConfigValidator::validate_monitor_config(&config)?;

        Ok(config)
    }
}
