use anyhow::{Context, Result};

/// 配置模板内容
pub const MONITOR_TEMPLATE: &str = include_str!("../../templates/monitor.toml");

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, MONITOR_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated monitor configuration template: {}", path);
    } else {
        println!("{}", MONITOR_TEMPLATE);
    }

    Ok(())
}
