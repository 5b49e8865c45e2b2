/// 单向转发任务
///
/// 从源读取数据块，先写入抓包缓冲区（原始数据），再经过可选的改写过滤器
/// 写到目的端。读到流结束、被中断或被取消时正常结束
use crate::capture::CaptureBuffer;
use crate::error::{is_benign_read_error, Direction, MonitorError, Result};
use crate::rewrite::HostRewriter;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// 单次读取上限：IP 包最大长度减去 IP 头和 TCP 头
pub const MAX_CHUNK_SIZE: usize = 0xffff - 20 - 20;

/// 读取结果（数据 / 流结束），致命错误通过 Err 返回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    Eof,
}

/// 读取一个数据块
///
/// 取消信号和中断类错误都视为流结束
pub async fn read_chunk<R>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> io::Result<ReadOutcome>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(ReadOutcome::Eof),
        result = reader.read(buf) => match result {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if is_benign_read_error(&e) => {
                debug!("Read interrupted ({}), treating as end of stream", e);
                Ok(ReadOutcome::Eof)
            }
            Err(e) => Err(e),
        },
    }
}

/// 写出一个数据块；被取消时返回 false
async fn write_chunk<W>(writer: &mut W, data: &[u8], cancel: &CancellationToken) -> io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(true);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(false),
        result = async {
            writer.write_all(data).await?;
            writer.flush().await
        } => result.map(|_| true),
    }
}

/// 半关闭目的端；被取消时返回 false
///
/// TLS 的 close_notify 可能卡在对端不再读取的发送缓冲区后面
async fn shutdown_sink<W>(writer: &mut W, cancel: &CancellationToken) -> io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(false),
        result = writer.shutdown() => result.map(|_| true),
    }
}

/// 转发任务结束后的报告
#[derive(Debug)]
pub struct RelayReport {
    pub direction: Direction,
    /// 原始（未改写）数据
    pub capture: CaptureBuffer,
    /// 从源读取的字节数
    pub bytes_read: u64,
    /// 写到目的端的字节数（改写后）
    pub bytes_forwarded: u64,
    /// 是否因取消而结束
    pub cancelled: bool,
    /// Host 头是否被改写
    pub rewritten: bool,
}

/// 单向转发任务，只运行一次
pub struct Relay<R, W> {
    direction: Direction,
    source: R,
    sink: W,
    capture: CaptureBuffer,
    filter: Option<HostRewriter>,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl<R, W> Relay<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(direction: Direction, source: R, sink: W, cancel: CancellationToken) -> Self {
        Self {
            direction,
            source,
            sink,
            capture: CaptureBuffer::new(),
            filter: None,
            chunk_size: MAX_CHUNK_SIZE,
            cancel,
        }
    }

    /// 设置抓包上限
    pub fn with_capture_limit(mut self, limit: Option<usize>) -> Self {
        self.capture = CaptureBuffer::with_limit(limit);
        self
    }

    /// 设置改写过滤器
    pub fn with_filter(mut self, filter: Option<HostRewriter>) -> Self {
        self.filter = filter;
        self
    }

    /// 设置单次读取大小
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// 运行直到源结束；目的端随后被半关闭
    pub async fn run(self) -> Result<RelayReport> {
        let Relay {
            direction,
            mut source,
            mut sink,
            mut capture,
            mut filter,
            chunk_size,
            cancel,
        } = self;

        let mut buf = vec![0u8; chunk_size];
        let mut forward = Vec::new();
        let mut bytes_read = 0u64;
        let mut bytes_forwarded = 0u64;
        let mut cancelled = false;

        loop {
            let n = match read_chunk(&mut source, &mut buf, &cancel)
                .await
                .map_err(|e| MonitorError::relay(direction, e))?
            {
                ReadOutcome::Eof => {
                    cancelled = cancel.is_cancelled();
                    break;
                }
                ReadOutcome::Data(n) => n,
            };

            bytes_read += n as u64;
            capture.push_slice(&buf[..n]);
            trace!("{}: read {} bytes", direction, n);

            let out: &[u8] = match filter.as_mut() {
                Some(filter) => {
                    forward.clear();
                    filter.push(&buf[..n], &mut forward);
                    &forward
                }
                None => &buf[..n],
            };

            if !write_chunk(&mut sink, out, &cancel)
                .await
                .map_err(|e| MonitorError::relay(direction, e))?
            {
                cancelled = true;
                break;
            }
            bytes_forwarded += out.len() as u64;
        }

        // 过滤器中滞留的字节
        if let Some(filter) = filter.as_mut() {
            forward.clear();
            filter.finish(&mut forward);
            if !cancelled
                && write_chunk(&mut sink, &forward, &cancel)
                    .await
                    .map_err(|e| MonitorError::relay(direction, e))?
            {
                bytes_forwarded += forward.len() as u64;
            }
        }

        // 半关闭目的端，让对端看到 EOF
        if !cancel.is_cancelled() {
            match shutdown_sink(&mut sink, &cancel).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("{}: shutdown of destination cancelled", direction);
                    cancelled = true;
                }
                Err(e) => debug!("{}: shutdown of destination failed: {}", direction, e),
            }
        }

        debug!(
            "{} finished: {} bytes read, {} bytes forwarded{}",
            direction,
            bytes_read,
            bytes_forwarded,
            if cancelled { " (cancelled)" } else { "" }
        );

        Ok(RelayReport {
            direction,
            capture,
            bytes_read,
            bytes_forwarded,
            cancelled,
            rewritten: filter.as_ref().is_some_and(|f| f.is_rewritten()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};

    /// 先返回一段数据，然后返回指定错误
    struct FailingReader {
        data: Option<&'static [u8]>,
        kind: io::ErrorKind,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::from(self.kind))),
            }
        }
    }

    #[tokio::test]
    async fn test_relay_copies_and_captures() {
        let (mut client, source) = duplex(64);
        let (sink, mut backend) = duplex(1024);

        let relay = Relay::new(
            Direction::BackendToClient,
            source,
            sink,
            CancellationToken::new(),
        )
        .with_chunk_size(7);
        let task = tokio::spawn(relay.run());

        client.write_all(b"HTTP/1.1 200 OK\r\n\r\nOK").await.unwrap();
        drop(client);

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();

        let report = task.await.unwrap().unwrap();
        assert_eq!(received, b"HTTP/1.1 200 OK\r\n\r\nOK".to_vec());
        assert_eq!(report.capture.as_slice(), b"HTTP/1.1 200 OK\r\n\r\nOK");
        assert_eq!(report.bytes_read, 21);
        assert_eq!(report.bytes_forwarded, 21);
        assert!(!report.cancelled);
        assert!(!report.rewritten);
    }

    #[tokio::test]
    async fn test_relay_captures_raw_bytes_but_forwards_rewritten() {
        let (mut client, source) = duplex(64);
        let (sink, mut backend) = duplex(1024);

        let relay = Relay::new(
            Direction::ClientToBackend,
            source,
            sink,
            CancellationToken::new(),
        )
        .with_filter(Some(HostRewriter::new("backend.example:8080")));
        let task = tokio::spawn(relay.run());

        client.write_all(b"GET /x HTTP/1.1\r\nHo").await.unwrap();
        client.flush().await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"st: original.example\r\n\r\n").await.unwrap();
        drop(client);

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        let report = task.await.unwrap().unwrap();

        assert_eq!(
            received,
            b"GET /x HTTP/1.1\r\nHost: backend.example:8080\r\n\r\n".to_vec()
        );
        assert_eq!(
            report.capture.as_slice(),
            b"GET /x HTTP/1.1\r\nHost: original.example\r\n\r\n"
        );
        assert_eq!(report.bytes_read, report.capture.len() as u64);
        assert!(report.rewritten);
    }

    #[tokio::test]
    async fn test_relay_benign_error_is_end_of_stream() {
        for kind in [io::ErrorKind::ConnectionReset, io::ErrorKind::Interrupted] {
            let source = FailingReader {
                data: Some(b"partial"),
                kind,
            };
            let relay = Relay::new(
                Direction::ClientToBackend,
                source,
                Vec::new(),
                CancellationToken::new(),
            );
            let report = relay.run().await.unwrap();
            assert_eq!(report.capture.as_slice(), b"partial");
        }
    }

    #[tokio::test]
    async fn test_relay_fatal_error_propagates() {
        let source = FailingReader {
            data: None,
            kind: io::ErrorKind::PermissionDenied,
        };
        let relay = Relay::new(
            Direction::BackendToClient,
            source,
            Vec::new(),
            CancellationToken::new(),
        );
        let err = relay.run().await.unwrap_err();
        assert!(err.is_relay());
    }

    #[tokio::test]
    async fn test_relay_cancel_is_end_of_stream() {
        let (mut client, source) = duplex(64);
        let (sink, _backend) = duplex(1024);
        let cancel = CancellationToken::new();

        let relay = Relay::new(Direction::ClientToBackend, source, sink, cancel.clone());
        let task = tokio::spawn(relay.run());

        client.write_all(b"hello").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        let report = task.await.unwrap().unwrap();
        assert!(report.cancelled);
        assert_eq!(report.capture.as_slice(), b"hello");
    }

    /// 写入正常，半关闭永远挂起
    struct StuckShutdown(Vec<u8>);

    impl AsyncWrite for StuckShutdown {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.0.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_relay_cancel_interrupts_stuck_shutdown() {
        let cancel = CancellationToken::new();
        let relay = Relay::new(
            Direction::ClientToBackend,
            &b"hello"[..],
            StuckShutdown(Vec::new()),
            cancel.clone(),
        );
        let task = tokio::spawn(relay.run());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        cancel.cancel();

        let report = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("relay did not stop after cancel")
            .unwrap()
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.capture.as_slice(), b"hello");
        assert_eq!(report.bytes_forwarded, 5);
    }

    #[tokio::test]
    async fn test_relay_capture_limit() {
        let (mut client, source) = duplex(64);
        let (sink, mut backend) = duplex(1024);

        let relay = Relay::new(
            Direction::BackendToClient,
            source,
            sink,
            CancellationToken::new(),
        )
        .with_capture_limit(Some(4));
        let task = tokio::spawn(relay.run());

        client.write_all(b"0123456789").await.unwrap();
        drop(client);

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        let report = task.await.unwrap().unwrap();

        assert_eq!(received, b"0123456789".to_vec());
        assert_eq!(report.capture.as_slice(), b"0123");
        assert!(report.capture.is_truncated());
        assert_eq!(report.bytes_read, 10);
    }
}
