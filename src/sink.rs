/// 记录与失败的输出端
///
/// 服务器本身不产生任何输出，所有结果都通过这两个 trait 交给使用方
use crate::error::MonitorError;
use crate::record::Record;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// 默认预览长度
const PREVIEW_LEN: usize = 256;

/// 完整会话记录的接收端，每个成功会话调用一次
pub trait RecordSink: Send + Sync {
    fn on_record(&self, record: Record);
}

/// 失败的接收端，每个失败会话或失败的 accept 调用一次
pub trait FailureSink: Send + Sync {
    fn on_failure(&self, error: MonitorError);
}

impl<F> RecordSink for F
where
    F: Fn(Record) + Send + Sync,
{
    fn on_record(&self, record: Record) {
        self(record)
    }
}

impl<F> FailureSink for F
where
    F: Fn(MonitorError) + Send + Sync,
{
    fn on_failure(&self, error: MonitorError) {
        self(error)
    }
}

/// 通过 tracing 输出的 sink，可选同时向 stdout 输出 JSON 行
#[derive(Debug, Clone, Default)]
pub struct LoggingSink {
    json: bool,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每条记录额外输出一行 JSON 摘要
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

impl RecordSink for LoggingSink {
    fn on_record(&self, record: Record) {
        info!(
            id = %record.id(),
            client = %record.client_addr(),
            backend = %record.backend_addr(),
            security = %record.security(),
            request_bytes = record.request().len(),
            response_bytes = record.response().len(),
            timed_out = record.timed_out(),
            "Session recorded in {:?}",
            record.duration()
        );

        if self.json {
            match serde_json::to_string(&record.summary(PREVIEW_LEN)) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to serialize record {}: {}", record.id(), e),
            }
        }
    }
}

impl FailureSink for LoggingSink {
    fn on_failure(&self, error: MonitorError) {
        error!("Session failed: {}", error);
    }
}

/// 通道输出的事件
#[derive(Debug)]
pub enum SinkEvent {
    Record(Record),
    Failure(MonitorError),
}

/// 把记录和失败送入无界通道，便于嵌入和测试
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RecordSink for ChannelSink {
    fn on_record(&self, record: Record) {
        // 接收端已关闭时直接丢弃
        let _ = self.tx.send(SinkEvent::Record(record));
    }
}

impl FailureSink for ChannelSink {
    fn on_failure(&self, error: MonitorError) {
        let _ = self.tx.send(SinkEvent::Failure(error));
    }
}

/// 在内存中收集记录和失败
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
    failures: Arc<Mutex<Vec<MonitorError>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.lock().len()
    }

    /// 取出所有失败（MonitorError 不可克隆）
    pub fn take_failures(&self) -> Vec<MonitorError> {
        std::mem::take(&mut *self.failures.lock())
    }
}

impl RecordSink for MemorySink {
    fn on_record(&self, record: Record) {
        self.records.lock().push(record);
    }
}

impl FailureSink for MemorySink {
    fn on_failure(&self, error: MonitorError) {
        self.failures.lock().push(error);
    }
}
