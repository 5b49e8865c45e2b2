use crate::config::MonitorConfig;
use crate::error::{Direction, MonitorError, Result};
use crate::record::Record;
use crate::relay::{Relay, RelayReport};
use crate::rewrite::HostRewriter;
use crate::transport::{BackendConnector, BackendSecurity, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

/// 会话运行参数（所有会话共享，只读）
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub backend_host: String,
    pub backend_port: u16,
    pub security: BackendSecurity,
    /// 改写后的 Host 值；None 表示不改写
    pub host_header: Option<String>,
    pub host_lookahead: usize,
    pub chunk_size: usize,
    pub capture_limit: Option<usize>,
    pub tls_join_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            backend_host: config.backend_host.clone(),
            backend_port: config.backend_port,
            security: config.backend_security(),
            host_header: config.host_header(),
            host_lookahead: config.host_lookahead,
            chunk_size: config.chunk_size,
            capture_limit: config.capture_limit,
            tls_join_timeout: config.tls_join_timeout(),
        }
    }

    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }

    /// 等待两个转发任务的时限，只有 TLS 会话才有
    pub fn join_deadline(&self) -> Option<Duration> {
        self.security.is_tls().then_some(self.tls_join_timeout)
    }

    fn rewriter(&self) -> Option<HostRewriter> {
        self.host_header
            .as_ref()
            .map(|host| HostRewriter::with_lookahead(host.clone(), self.host_lookahead))
    }
}

/// 一个客户端连接对应的代理会话
///
/// 打开后端连接，启动两个方向的转发任务，等待两者结束后
/// 产生一个 Record 或一个错误
pub struct ProxySession<C> {
    id: Uuid,
    client: C,
    client_addr: SocketAddr,
    settings: Arc<SessionSettings>,
    connector: Arc<dyn BackendConnector>,
}

impl<C: Transport> ProxySession<C> {
    pub fn new(
        client: C,
        client_addr: SocketAddr,
        settings: Arc<SessionSettings>,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            client,
            client_addr,
            settings,
            connector,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 运行会话直到两个方向都结束
    pub async fn run(self) -> Result<Record> {
        let ProxySession {
            id,
            client,
            client_addr,
            settings,
            connector,
        } = self;

        let opened_at = SystemTime::now();
        let backend_addr = settings.backend_addr();

        // 连接失败时 client 随函数返回被关闭
        let backend = connector
            .connect(&settings.backend_host, settings.backend_port, settings.security)
            .await?;
        debug!(
            "Relaying {} <-> {} ({})",
            client_addr, backend_addr, settings.security
        );

        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend);
        let cancel = CancellationToken::new();

        let upstream = Relay::new(
            Direction::ClientToBackend,
            client_read,
            backend_write,
            cancel.clone(),
        )
        .with_chunk_size(settings.chunk_size)
        .with_capture_limit(settings.capture_limit)
        .with_filter(settings.rewriter());

        let downstream = Relay::new(
            Direction::BackendToClient,
            backend_read,
            client_write,
            cancel.clone(),
        )
        .with_chunk_size(settings.chunk_size)
        .with_capture_limit(settings.capture_limit);

        let up = spawn_relay(upstream, cancel.clone());
        let down = spawn_relay(downstream, cancel.clone());

        // 同时等待两个方向，TLS 会话带时限
        let joined = async { tokio::join!(up, down) };
        tokio::pin!(joined);

        let mut timed_out = false;
        let (up_result, down_result) = match settings.join_deadline() {
            Some(limit) => match tokio::time::timeout(limit, &mut joined).await {
                Ok(results) => results,
                Err(_) => {
                    debug!("Join deadline of {:?} reached, cancelling relays", limit);
                    timed_out = true;
                    cancel.cancel();
                    joined.await
                }
            },
            None => joined.await,
        };

        // 两个方向都失败时报告 client->backend 的错误
        let upstream = flatten(up_result)?;
        let downstream = flatten(down_result)?;

        if timed_out && upstream.bytes_read == 0 && downstream.bytes_read == 0 {
            return Err(MonitorError::no_traffic(settings.tls_join_timeout));
        }

        if upstream.rewritten {
            debug!("Host header rewritten for session {}", id);
        }

        let (request, request_truncated) = upstream.capture.freeze();
        let (response, response_truncated) = downstream.capture.freeze();

        Ok(Record {
            id,
            client_addr,
            backend_addr,
            security: settings.security,
            opened_at,
            closed_at: SystemTime::now(),
            request,
            response,
            request_truncated,
            response_truncated,
            timed_out,
        })
    }
}

/// 在独立任务中运行转发；出错时取消另一个方向
fn spawn_relay<R, W>(relay: Relay<R, W>, cancel: CancellationToken) -> JoinHandle<Result<RelayReport>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            let result = relay.run().await;
            if let Err(ref e) = result {
                warn!("{}", e);
                cancel.cancel();
            }
            result
        }
        .in_current_span(),
    )
}

fn flatten(result: std::result::Result<Result<RelayReport>, JoinError>) -> Result<RelayReport> {
    result.map_err(|e| MonitorError::Other(anyhow::anyhow!("Relay task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};

    /// 返回预先准备好的内存流作为后端
    struct MockConnector {
        backend: Mutex<Option<Pin<Box<dyn Transport>>>>,
    }

    impl MockConnector {
        fn new(backend: impl Transport) -> Arc<Self> {
            Arc::new(Self {
                backend: Mutex::new(Some(Box::pin(backend))),
            })
        }
    }

    /// 读写交给内存流，半关闭永远挂起
    struct StuckShutdownBackend(DuplexStream);

    impl AsyncRead for StuckShutdownBackend {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StuckShutdownBackend {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[async_trait]
    impl BackendConnector for MockConnector {
        async fn connect(
            &self,
            host: &str,
            port: u16,
            _security: BackendSecurity,
        ) -> Result<Pin<Box<dyn Transport>>> {
            match self.backend.lock().take() {
                Some(stream) => Ok(stream),
                None => Err(MonitorError::backend_connect(
                    format!("{}:{}", host, port),
                    io::Error::from(io::ErrorKind::ConnectionRefused),
                )),
            }
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl BackendConnector for RefusingConnector {
        async fn connect(
            &self,
            host: &str,
            port: u16,
            _security: BackendSecurity,
        ) -> Result<Pin<Box<dyn Transport>>> {
            Err(MonitorError::backend_connect(
                format!("{}:{}", host, port),
                io::Error::from(io::ErrorKind::ConnectionRefused),
            ))
        }
    }

    fn settings(security: BackendSecurity, host_header: Option<&str>) -> Arc<SessionSettings> {
        Arc::new(SessionSettings {
            backend_host: "backend.example".to_string(),
            backend_port: 8080,
            security,
            host_header: host_header.map(str::to_string),
            host_lookahead: 8192,
            chunk_size: 1024,
            capture_limit: None,
            tls_join_timeout: Duration::from_millis(200),
        })
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_session_rewrites_and_records() {
        let (mut client, client_end) = duplex(4096);
        let (backend_end, mut backend) = duplex(4096);

        let session = ProxySession::new(
            client_end,
            client_addr(),
            settings(BackendSecurity::Plain, Some("backend.example:8080")),
            MockConnector::new(backend_end),
        );
        let task = tokio::spawn(session.run());

        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: original.example\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        assert_eq!(
            received,
            b"GET /x HTTP/1.1\r\nHost: backend.example:8080\r\n\r\n".to_vec()
        );

        backend.write_all(b"HTTP/1.1 200 OK\r\n\r\nOK").await.unwrap();
        backend.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\n\r\nOK".to_vec());

        let record = task.await.unwrap().unwrap();
        assert_eq!(
            record.request().as_ref(),
            b"GET /x HTTP/1.1\r\nHost: original.example\r\n\r\n"
        );
        assert_eq!(record.response().as_ref(), b"HTTP/1.1 200 OK\r\n\r\nOK");
        assert_eq!(record.backend_addr(), "backend.example:8080");
        assert_eq!(record.client_addr(), client_addr());
        assert!(!record.timed_out());
        assert!(record.closed_at() >= record.opened_at());
    }

    #[tokio::test]
    async fn test_session_backend_refused() {
        let (_client, client_end) = duplex(64);
        let session = ProxySession::new(
            client_end,
            client_addr(),
            settings(BackendSecurity::Plain, None),
            Arc::new(RefusingConnector),
        );

        let err = session.run().await.unwrap_err();
        assert!(err.is_backend_connect());
    }

    #[tokio::test]
    async fn test_session_progresses_both_directions() {
        let (mut client, client_end) = duplex(4096);
        let (backend_end, mut backend) = duplex(4096);

        let session = ProxySession::new(
            client_end,
            client_addr(),
            settings(BackendSecurity::Plain, None),
            MockConnector::new(backend_end),
        );
        let task = tokio::spawn(session.run());

        // 请求未结束时后端已开始响应
        client.write_all(b"part-1;").await.unwrap();
        let mut buf = [0u8; 7];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"part-1;");

        backend.write_all(b"early").await.unwrap();
        let mut early = [0u8; 5];
        client.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early");

        client.write_all(b"part-2").await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"part-2".to_vec());

        backend.write_all(b"-late").await.unwrap();
        backend.shutdown().await.unwrap();
        let mut late = Vec::new();
        client.read_to_end(&mut late).await.unwrap();
        assert_eq!(late, b"-late".to_vec());

        let record = task.await.unwrap().unwrap();
        assert_eq!(record.request().as_ref(), b"part-1;part-2");
        assert_eq!(record.response().as_ref(), b"early-late");
    }

    #[tokio::test]
    async fn test_tls_deadline_with_traffic_is_record() {
        let (mut client, client_end) = duplex(4096);
        let (backend_end, mut backend) = duplex(4096);

        let session = ProxySession::new(
            client_end,
            client_addr(),
            settings(BackendSecurity::Tls, None),
            MockConnector::new(backend_end),
        );

        // 两端都不关闭，只能靠时限结束
        client.write_all(b"hello").await.unwrap();
        let run = tokio::spawn(session.run());

        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let record = run.await.unwrap().unwrap();
        assert!(record.timed_out());
        assert_eq!(record.security(), BackendSecurity::Tls);
        assert_eq!(record.request().as_ref(), b"hello");
        assert!(record.response().is_empty());

        drop(client);
    }

    #[tokio::test]
    async fn test_tls_deadline_without_traffic_is_failure() {
        let (client, client_end) = duplex(64);
        let (backend_end, backend) = duplex(64);

        let session = ProxySession::new(
            client_end,
            client_addr(),
            settings(BackendSecurity::Tls, None),
            MockConnector::new(backend_end),
        );

        let err = session.run().await.unwrap_err();
        assert!(err.is_no_traffic());

        drop(client);
        drop(backend);
    }

    #[tokio::test]
    async fn test_tls_deadline_bounds_stuck_half_close() {
        let (mut client, client_end) = duplex(4096);
        let (backend_end, mut backend) = duplex(4096);

        let session = ProxySession::new(
            client_end,
            client_addr(),
            settings(BackendSecurity::Tls, None),
            MockConnector::new(StuckShutdownBackend(backend_end)),
        );
        let run = tokio::spawn(session.run());

        // 客户端发完即半关闭，转发到后端的半关闭一直挂起
        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();
        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .expect("join deadline did not end the session")
            .unwrap()
            .unwrap();
        assert!(record.timed_out());
        assert_eq!(record.request().as_ref(), b"hello");
        assert!(record.response().is_empty());
    }

    #[test]
    fn test_settings_join_deadline() {
        assert_eq!(settings(BackendSecurity::Plain, None).join_deadline(), None);
        assert_eq!(
            settings(BackendSecurity::Tls, None).join_deadline(),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            settings(BackendSecurity::Plain, None).backend_addr(),
            "backend.example:8080"
        );
    }
}
