mod session;

pub use session::{ProxySession, SessionSettings};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::sink::{FailureSink, LoggingSink, RecordSink};
use crate::stats::{MonitorStats, MonitorStatsSnapshot};
use crate::transport::{BackendConnector, TcpConnector};
use anyhow::Context;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// accept 出错后的退避时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 连接来源
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// 服务器依赖（用于依赖注入）
#[derive(Clone)]
pub struct MonitorDependencies {
    pub connector: Arc<dyn BackendConnector>,
    pub record_sink: Arc<dyn RecordSink>,
    pub failure_sink: Arc<dyn FailureSink>,
}

impl MonitorDependencies {
    pub fn new(
        connector: Arc<dyn BackendConnector>,
        record_sink: Arc<dyn RecordSink>,
        failure_sink: Arc<dyn FailureSink>,
    ) -> Self {
        Self {
            connector,
            record_sink,
            failure_sink,
        }
    }

    /// 根据配置创建默认依赖（TCP/TLS 连接器 + 日志输出）
    pub fn from_config(config: &MonitorConfig) -> anyhow::Result<Self> {
        let connector = TcpConnector::from_config(config)
            .context("Failed to create backend connector")?;
        let sink = Arc::new(LoggingSink::new());
        Ok(Self::new(Arc::new(connector), sink.clone(), sink))
    }

    /// 替换记录输出端
    pub fn with_record_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.record_sink = sink;
        self
    }

    /// 替换失败输出端
    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.failure_sink = sink;
        self
    }
}

/// 监控服务器：监听端口，为每个连接创建一个代理会话
pub struct MonitorServer {
    listener: Box<dyn Listener>,
    local_addr: SocketAddr,
    settings: Arc<SessionSettings>,
    deps: MonitorDependencies,
    stats: MonitorStats,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    session_limit: Option<Arc<Semaphore>>,
}

impl MonitorServer {
    /// 绑定监听端口（service_port 为 0 时由系统分配）
    pub async fn bind(config: &MonitorConfig, deps: MonitorDependencies) -> anyhow::Result<Self> {
        let listen_addr = config.listen_addr();
        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("Failed to bind monitor on {}", listen_addr))?;
        Self::with_listener(listener, config, deps)
    }

    /// 使用已就绪的监听端点创建服务器
    pub fn with_listener(
        listener: impl Listener,
        config: &MonitorConfig,
        deps: MonitorDependencies,
    ) -> anyhow::Result<Self> {
        let local_addr = listener
            .local_addr()
            .context("Failed to get monitor local address")?;

        let settings = Arc::new(SessionSettings::from_config(config));
        let stats = MonitorStats::new(settings.backend_addr());

        info!(
            "Monitor bound on {} -> {} ({})",
            local_addr,
            settings.backend_addr(),
            settings.security
        );

        Ok(Self {
            listener: Box::new(listener),
            local_addr,
            settings,
            deps,
            stats,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            session_limit: config.max_sessions.map(|n| Arc::new(Semaphore::new(n))),
        })
    }

    /// 绑定并在后台运行
    pub async fn start(config: &MonitorConfig, deps: MonitorDependencies) -> anyhow::Result<MonitorHandle> {
        Ok(Self::bind(config, deps).await?.spawn())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn backend_addr(&self) -> String {
        self.settings.backend_addr()
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats.clone()
    }

    /// 取消该 token 即停止 accept 循环
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 在后台任务中运行 accept 循环
    pub fn spawn(self) -> MonitorHandle {
        let local_addr = self.local_addr;
        let backend_addr = self.backend_addr();
        let stats = self.stats.clone();
        let shutdown = self.shutdown.clone();

        MonitorHandle {
            local_addr,
            backend_addr,
            stats,
            shutdown,
            task: Some(tokio::spawn(self.run())),
        }
    }

    /// 运行 accept 循环，直到关闭后所有会话结束
    pub async fn run(self) -> Result<()> {
        let MonitorServer {
            listener,
            local_addr,
            settings,
            deps,
            stats,
            tracker,
            shutdown,
            session_limit,
        } = self;

        info!("Monitor listening on {}", local_addr);

        loop {
            // 达到会话上限时在这里排队，新连接留在内核 backlog 中
            let permit = match &session_limit {
                Some(limit) => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    permit = limit.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(MonitorError::ListenClosed),
                result = listener.accept() => result.map_err(MonitorError::Accept),
            };

            match accepted {
                Ok((stream, client_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY for {}: {}", client_addr, e);
                        drop(stream);
                        stats.accept_error();
                        deps.failure_sink.on_failure(MonitorError::Accept(e));
                        continue;
                    }

                    debug!("Accepted connection from {}", client_addr);
                    dispatch(
                        &tracker, stream, client_addr, &settings, &deps, &stats, permit,
                    );
                }
                Err(e) if e.is_listen_closed() => break,
                Err(e) => {
                    error!("{}", e);
                    stats.accept_error();
                    deps.failure_sink.on_failure(e);

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        }

        // 关闭监听端点，不再接受新会话
        drop(listener);
        info!(
            "Monitor on {} stopped accepting, waiting for {} active sessions",
            local_addr,
            tracker.len()
        );

        tracker.close();
        tracker.wait().await;

        let snapshot = stats.snapshot();
        info!(
            "Monitor stopped: {} sessions ({} recorded, {} failed), {} request bytes, {} response bytes",
            snapshot.total_sessions,
            snapshot.completed_sessions,
            snapshot.failed_sessions,
            snapshot.request_bytes,
            snapshot.response_bytes
        );

        Ok(())
    }
}

/// 把一个已接受的连接交给新的代理会话
fn dispatch(
    tracker: &TaskTracker,
    stream: TcpStream,
    client_addr: SocketAddr,
    settings: &Arc<SessionSettings>,
    deps: &MonitorDependencies,
    stats: &MonitorStats,
    permit: Option<OwnedSemaphorePermit>,
) {
    let session = ProxySession::new(
        stream,
        client_addr,
        Arc::clone(settings),
        Arc::clone(&deps.connector),
    );
    let span = info_span!("session", id = %session.id(), client = %client_addr);

    let guard = stats.session_started();
    let stats = stats.clone();
    let record_sink = Arc::clone(&deps.record_sink);
    let failure_sink = Arc::clone(&deps.failure_sink);

    tracker.spawn(
        async move {
            let _permit = permit;
            let _guard = guard;

            match session.run().await {
                Ok(record) => {
                    debug!(
                        "Session completed: {} request bytes, {} response bytes",
                        record.request().len(),
                        record.response().len()
                    );
                    stats.session_completed(
                        record.request().len() as u64,
                        record.response().len() as u64,
                    );
                    record_sink.on_record(record);
                }
                Err(e) => {
                    debug!("Session failed: {}", e);
                    stats.session_failed();
                    failure_sink.on_failure(e);
                }
            }
        }
        .instrument(span),
    );
}

/// 后台运行的监控服务器句柄
pub struct MonitorHandle {
    local_addr: SocketAddr,
    backend_addr: String,
    stats: MonitorStats,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl MonitorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn backend_addr(&self) -> &str {
        &self.backend_addr
    }

    pub fn stats(&self) -> MonitorStatsSnapshot {
        self.stats.snapshot()
    }

    /// 停止接受新连接，等待进行中的会话全部结束
    pub async fn close(mut self) -> Result<MonitorStatsSnapshot> {
        info!("Closing monitor on {}", self.local_addr);
        self.shutdown.cancel();

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| MonitorError::Other(anyhow::anyhow!("Monitor task failed: {}", e)))??;
        }

        Ok(self.stats.snapshot())
    }
}
