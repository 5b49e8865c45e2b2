use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{AppConfig, MonitorConfig};

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        // Convert relative path to absolute
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 解析 HOST:PORT 形式的后端地址（支持 [IPv6]:PORT）
pub fn parse_backend(backend: &str) -> Result<(String, u16)> {
    let (host, port) = backend
        .rsplit_once(':')
        .with_context(|| format!("Backend must be HOST:PORT, got '{}'", backend))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("Backend host is empty in '{}'", backend);
    }

    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid backend port in '{}'", backend))?;

    Ok((host.to_string(), port))
}

/// 组合配置文件与命令行参数得到最终配置
pub fn resolve_run_config(
    config: Option<&str>,
    port: Option<u16>,
    backend: Option<&str>,
) -> Result<MonitorConfig> {
    let mut monitor_config = match config {
        Some(path) => {
            let path = expand_path(path)?;
            AppConfig::load_monitor_config(&path)?
        }
        None => {
            let backend = backend.context("--backend is required when no --config is given")?;
            let (host, backend_port) = parse_backend(backend)?;
            MonitorConfig::builder()
                .backend_host(host)
                .backend_port(backend_port)
                .build()?
        }
    };

    // 命令行参数覆盖配置文件
    if let Some(port) = port {
        monitor_config.service_port = port;
    }
    if let Some(backend) = backend {
        let (host, backend_port) = parse_backend(backend)?;
        monitor_config.backend_host = host;
        monitor_config.backend_port = backend_port;
    }

    if let Some(ref ca_path) = monitor_config.tls.ca_cert_path {
        let expanded = expand_path(&ca_path.to_string_lossy())?;
        monitor_config.tls.ca_cert_path = Some(PathBuf::from(expanded));
    }

    monitor_config
        .validate()
        .context("Monitor configuration validation failed")?;

    Ok(monitor_config)
}

/// Check configuration file format
pub fn check_config(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);

    if !path.exists() {
        println!("✗ Configuration file not found: {}", config_path);
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    println!("Checking configuration file: {}\n", config_path);

    match AppConfig::load_monitor_config(config_path) {
        Ok(config) => {
            println!("✓ Listen address: {}", config.listen_addr());
            println!(
                "✓ Backend: {} ({})",
                config.backend_addr(),
                config.backend_security()
            );
            match config.host_header() {
                Some(host) => println!("✓ Host header rewritten to: {}", host),
                None => println!("✓ Host header rewrite: disabled"),
            }
            println!("✓ Chunk size: {} bytes", config.chunk_size);
            match config.capture_limit {
                Some(limit) => println!("✓ Capture limit: {} bytes per direction", limit),
                None => println!("✓ Capture limit: unlimited"),
            }
            match config.max_sessions {
                Some(max) => println!("✓ Max sessions: {}", max),
                None => println!("✓ Max sessions: unlimited"),
            }
            println!("✓ TLS ports: {:?}", config.tls.tls_ports);
            println!("✓ TLS join timeout: {:?}", config.tls_join_timeout());

            if let Some(ref ca_path) = config.tls.ca_cert_path {
                if ca_path.exists() {
                    println!("✓ CA certificate file exists: {:?}", ca_path);
                } else {
                    println!("⚠ Warning: CA certificate file not found: {:?}", ca_path);
                }
            }
            if config.tls.skip_verify {
                println!("⚠ Warning: certificate verification is disabled");
            }

            println!("\n✓ Monitor configuration is valid!");
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed!");
            println!("\nError details:");
            println!("{:#}", e);

            println!("\nCommon issues:");
            println!("  1. Check TOML syntax (brackets, quotes, commas)");
            println!("  2. Ensure the [monitor] section has backend_host and backend_port");
            println!("  3. Ensure port numbers are valid (1-65535)");
            println!("  4. Backend TLS options belong to the [monitor.tls] section");

            Err(e)
        }
    }
}
