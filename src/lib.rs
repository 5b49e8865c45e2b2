/// TCP Monitor 库入口
///
/// 将核心模块导出为库，方便测试和嵌入
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod record;
pub mod relay;
pub mod rewrite;
pub mod server;
pub mod sink;
pub mod stats;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use capture::CaptureBuffer;
pub use config::{AppConfig, BackendTlsConfig, MonitorConfig};
pub use error::{Direction, MonitorError, Result};
pub use record::{Record, RecordSummary};
pub use rewrite::{replace_host_value, HostRewriter};
pub use server::{Listener, MonitorDependencies, MonitorHandle, MonitorServer};
pub use sink::{ChannelSink, FailureSink, LoggingSink, MemorySink, RecordSink, SinkEvent};
pub use stats::{MonitorStats, MonitorStatsSnapshot};
pub use transport::{BackendConnector, BackendSecurity, TcpConnector};
