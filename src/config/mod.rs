// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::MonitorConfigBuilder;
pub use validator::ConfigValidator;

use crate::relay::MAX_CHUNK_SIZE;
use crate::rewrite::{host_header_value, DEFAULT_HOST_LOOKAHEAD};
use crate::transport::{BackendSecurity, DEFAULT_TLS_PORTS};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_rewrite_host() -> bool {
    true
}

fn default_host_lookahead() -> usize {
    DEFAULT_HOST_LOOKAHEAD
}

fn default_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}

fn default_tls_join_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_tls_ports() -> Vec<u16> {
    DEFAULT_TLS_PORTS.to_vec()
}

/// 后端 TLS 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTlsConfig {
    /// 使用 TLS 连接的后端端口
    #[serde(default = "default_tls_ports")]
    pub tls_ports: Vec<u16>,
    /// CA 证书路径（可选，默认使用系统证书）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 是否跳过证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// SNI / 证书校验名称（默认使用 backend_host）
    #[serde(default)]
    pub server_name: Option<String>,
}

impl Default for BackendTlsConfig {
    fn default() -> Self {
        Self {
            tls_ports: default_tls_ports(),
            ca_cert_path: None,
            skip_verify: false,
            server_name: None,
        }
    }
}

/// 监控服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// 监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 监听端口（0 表示由系统分配）
    #[serde(default)]
    pub service_port: u16,
    /// 后端主机
    pub backend_host: String,
    /// 后端端口
    pub backend_port: u16,
    /// 是否改写客户端请求中的 Host 头
    #[serde(default = "default_rewrite_host")]
    pub rewrite_host: bool,
    /// 改写使用的 Host 值（默认由 backend_host/backend_port 推导）
    #[serde(default)]
    pub host_override: Option<String>,
    /// 查找 Host 头的最大字节数
    #[serde(default = "default_host_lookahead")]
    pub host_lookahead: usize,
    /// 单次读取大小
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 每个方向的抓包上限（字节，默认不限制）
    #[serde(default)]
    pub capture_limit: Option<usize>,
    /// 最大并发会话数（默认不限制）
    #[serde(default)]
    pub max_sessions: Option<usize>,
    /// TLS 会话等待两个转发任务的超时（秒）
    #[serde(default = "default_tls_join_timeout_secs")]
    pub tls_join_timeout_secs: u64,
    /// 后端连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 后端 TLS 配置
    #[serde(default)]
    pub tls: BackendTlsConfig,
}

impl MonitorConfig {
    /// 创建 Builder
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_monitor_config(self)
    }

    /// 监听地址（bind_addr:service_port）
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.service_port)
    }

    /// 后端地址（backend_host:backend_port）
    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }

    /// 后端连接的传输安全类型
    pub fn backend_security(&self) -> BackendSecurity {
        BackendSecurity::for_port(self.backend_port, &self.tls.tls_ports)
    }

    /// 改写后的 Host 值；关闭改写时返回 None
    pub fn host_header(&self) -> Option<String> {
        if !self.rewrite_host {
            return None;
        }

        Some(match &self.host_override {
            Some(host) => host.clone(),
            None => host_header_value(
                &self.backend_host,
                self.backend_port,
                self.backend_security().is_tls(),
            ),
        })
    }

    pub fn tls_join_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_join_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// 应用配置
pub struct AppConfig;

impl AppConfig {
    /// 从文件加载监控配置（`[monitor]` 表）
    pub fn load_monitor_config(path: &str) -> anyhow::Result<MonitorConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        let config = Self::parse_monitor_config(&content)?;
        config
            .validate()
            .context("Monitor configuration validation failed")?;
        Ok(config)
    }

    /// 解析 TOML 文本（不做验证）
    pub fn parse_monitor_config(content: &str) -> anyhow::Result<MonitorConfig> {
        #[derive(Deserialize)]
        struct MonitorConfigWrapper {
            monitor: MonitorConfig,
        }

        let wrapper: MonitorConfigWrapper =
            toml::from_str(content).context("Failed to parse monitor configuration")?;
        Ok(wrapper.monitor)
    }
}
