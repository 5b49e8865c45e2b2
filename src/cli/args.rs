use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tcp-monitor")]
#[command(author, version, about = "TCP monitor that relays and captures client/backend traffic", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行监控服务
    Run {
        /// 配置文件路径
        #[arg(short, long)]
        config: Option<String>,

        /// 监听端口（覆盖配置文件）
        #[arg(short, long)]
        port: Option<u16>,

        /// 后端地址 HOST:PORT（覆盖配置文件）
        #[arg(short, long, value_name = "HOST:PORT")]
        backend: Option<String>,

        /// 每条记录输出一行 JSON 摘要到 stdout
        #[arg(long)]
        json: bool,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
    /// 生成配置模板
    Template {
        /// 输出文件路径（默认输出到 stdout）
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 生成自签名证书（用于 TLS 测试后端）
    Cert {
        /// 证书输出路径
        #[arg(long, value_name = "PATH", default_value = "cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, value_name = "PATH", default_value = "key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}
