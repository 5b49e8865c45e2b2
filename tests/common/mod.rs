/// Common utilities for integration tests
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcp_monitor::config::{MonitorConfig, MonitorConfigBuilder};
use tcp_monitor::server::MonitorDependencies;
use tcp_monitor::sink::MemorySink;
use tcp_monitor::tls;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

/// Find a port nobody is listening on
pub fn get_unused_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let temp_dir = std::env::temp_dir();
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", uuid::Uuid::new_v4(), counter, std::process::id());

    let cert_path = temp_dir.join(format!("monitor-test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("monitor-test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Monitor config on 127.0.0.1 with an ephemeral service port
pub fn monitor_config(backend_port: u16) -> MonitorConfigBuilder {
    MonitorConfig::builder()
        .bind_addr("127.0.0.1")
        .backend_host("127.0.0.1")
        .backend_port(backend_port)
        .connect_timeout_secs(2)
}

/// Real connector, both sinks collected into `sink`
pub fn dependencies(config: &MonitorConfig, sink: &MemorySink) -> MonitorDependencies {
    MonitorDependencies::from_config(config)
        .expect("Failed to create dependencies")
        .with_record_sink(Arc::new(sink.clone()))
        .with_failure_sink(Arc::new(sink.clone()))
}

/// Echo server: echoes every connection until EOF, then closes it
pub async fn start_echo_server() -> u16 {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break, // Connection closed
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });

    port
}

/// HTTP-like backend: reads each request to EOF, reports it, then answers
pub async fn start_http_backend(response: &'static [u8]) -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind HTTP backend");
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                if socket.read_to_end(&mut request).await.is_err() {
                    return;
                }
                let _ = tx.send(request);
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (port, rx)
}

/// Backend that holds each connection until the gate opens, then answers "done"
pub async fn start_gated_backend(gate: watch::Receiver<bool>, received: Arc<AtomicUsize>) -> u16 {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind gated backend");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut gate = gate.clone();
            let received = received.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                match socket.read(&mut buf).await {
                    Ok(n) if n > 0 => {
                        received.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => return,
                }

                if gate.wait_for(|open| *open).await.is_err() {
                    return;
                }
                let _ = socket.write_all(b"done").await;
                let _ = socket.shutdown().await;
            });
        }
    });

    port
}

/// TLS backend: reads `expect` bytes, answers with `reply` and closes
pub async fn start_tls_reply_backend(
    cert: &Path,
    key: &Path,
    expect: usize,
    reply: &'static [u8],
) -> u16 {
    let acceptor = TlsAcceptor::from(
        tls::load_server_config(cert, key).expect("Failed to load server TLS config"),
    );
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind TLS backend");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut stream) = acceptor.accept(socket).await else {
                    return;
                };
                let mut request = vec![0u8; expect];
                if stream.read_exact(&mut request).await.is_err() {
                    return;
                }
                let _ = stream.write_all(reply).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    port
}

/// TLS backend that completes the handshake and never answers
pub async fn start_tls_silent_backend(cert: &Path, key: &Path) -> u16 {
    let acceptor = TlsAcceptor::from(
        tls::load_server_config(cert, key).expect("Failed to load server TLS config"),
    );
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind TLS backend");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut stream) = acceptor.accept(socket).await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    port
}

/// Poll `condition` until it holds or `max_wait` elapses
pub async fn wait_until<F>(condition: F, max_wait: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + max_wait;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Wait until connecting to `addr` is refused
pub async fn wait_until_refused(addr: std::net::SocketAddr, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(addr).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}
