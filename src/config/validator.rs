use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

use super::{BackendTlsConfig, MonitorConfig};
use crate::relay::MAX_CHUNK_SIZE;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证监控配置
    pub fn validate_monitor_config(config: &MonitorConfig) -> Result<()> {
        // 验证地址和端口（service_port 允许为 0）
        Self::validate_address(&config.bind_addr, "Monitor bind_addr")?;
        Self::validate_address(&config.backend_host, "Monitor backend_host")?;
        Self::validate_port(config.backend_port, "Monitor backend_port")?;

        if let Some(ref host) = config.host_override {
            if host.trim().is_empty() {
                bail!("host_override cannot be empty");
            }
            if host.contains(['\r', '\n']) {
                bail!("host_override cannot contain line breaks");
            }
        }

        if config.chunk_size == 0 || config.chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "chunk_size must be between 1 and {} (current: {})",
                MAX_CHUNK_SIZE,
                config.chunk_size
            );
        }

        if config.host_lookahead == 0 {
            bail!("host_lookahead must be greater than 0");
        }

        if config.capture_limit == Some(0) {
            warn!("capture_limit is 0, request and response bytes will not be recorded");
        }

        if config.max_sessions == Some(0) {
            bail!("max_sessions must be greater than 0");
        }

        if config.tls_join_timeout_secs == 0 {
            bail!("tls_join_timeout_secs must be greater than 0");
        }

        if config.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than 0");
        }

        Self::validate_tls_config(&config.tls)?;

        if !config.rewrite_host && config.host_override.is_some() {
            warn!("host_override is set but rewrite_host is disabled, it will be ignored");
        }

        Ok(())
    }

    /// 验证后端 TLS 配置
    pub fn validate_tls_config(config: &BackendTlsConfig) -> Result<()> {
        let mut seen = HashSet::new();
        for port in &config.tls_ports {
            Self::validate_port(*port, "tls_ports")?;
            if !seen.insert(*port) {
                warn!("Duplicate TLS port {} in tls_ports", port);
            }
        }

        if let Some(ref name) = config.server_name {
            if name.trim().is_empty() {
                bail!("tls.server_name cannot be empty");
            }
        }

        if config.skip_verify {
            if config.ca_cert_path.is_some() {
                warn!("tls.skip_verify is enabled, ca_cert_path will not be used for verification");
            }
            warn!("Certificate verification is disabled for TLS backends (skip_verify = true)");
        }

        Ok(())
    }
}
