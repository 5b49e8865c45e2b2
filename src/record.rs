use crate::transport::BackendSecurity;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// 一次完整会话的抓包记录
///
/// 会话结束时创建一次，之后不可修改；request/response 保存的是原始字节
#[derive(Debug, Clone)]
pub struct Record {
    pub(crate) id: Uuid,
    pub(crate) client_addr: SocketAddr,
    pub(crate) backend_addr: String,
    pub(crate) security: BackendSecurity,
    pub(crate) opened_at: SystemTime,
    pub(crate) closed_at: SystemTime,
    pub(crate) request: Bytes,
    pub(crate) response: Bytes,
    pub(crate) request_truncated: bool,
    pub(crate) response_truncated: bool,
    pub(crate) timed_out: bool,
}

impl Record {
    /// 会话 ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn backend_addr(&self) -> &str {
        &self.backend_addr
    }

    /// 后端连接使用的传输安全类型
    pub fn security(&self) -> BackendSecurity {
        self.security
    }

    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }

    pub fn closed_at(&self) -> SystemTime {
        self.closed_at
    }

    /// 会话持续时间
    pub fn duration(&self) -> Duration {
        self.closed_at
            .duration_since(self.opened_at)
            .unwrap_or_default()
    }

    /// 客户端发送的原始请求字节（未改写）
    pub fn request(&self) -> &Bytes {
        &self.request
    }

    /// 后端返回的原始响应字节
    pub fn response(&self) -> &Bytes {
        &self.response
    }

    /// 请求抓包是否因上限被截断
    pub fn request_truncated(&self) -> bool {
        self.request_truncated
    }

    /// 响应抓包是否因上限被截断
    pub fn response_truncated(&self) -> bool {
        self.response_truncated
    }

    /// 是否因 TLS 等待超时而结束
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// 生成可序列化的摘要，预览最多 `preview_len` 字节
    pub fn summary(&self, preview_len: usize) -> RecordSummary {
        RecordSummary {
            id: self.id.to_string(),
            client_addr: self.client_addr.to_string(),
            backend_addr: self.backend_addr.clone(),
            security: self.security,
            opened_at_ms: unix_millis(self.opened_at),
            closed_at_ms: unix_millis(self.closed_at),
            request_len: self.request.len(),
            response_len: self.response.len(),
            request_truncated: self.request_truncated,
            response_truncated: self.response_truncated,
            timed_out: self.timed_out,
            request_preview: preview(&self.request, preview_len),
            response_preview: preview(&self.response, preview_len),
        }
    }
}

/// Record 的可序列化摘要（用于日志和 JSON 输出）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: String,
    pub client_addr: String,
    pub backend_addr: String,
    pub security: BackendSecurity,
    pub opened_at_ms: u64,
    pub closed_at_ms: u64,
    pub request_len: usize,
    pub response_len: usize,
    pub request_truncated: bool,
    pub response_truncated: bool,
    pub timed_out: bool,
    pub request_preview: String,
    pub response_preview: String,
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn preview(data: &[u8], limit: usize) -> String {
    let end = data.len().min(limit);
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[cfg(test)]
pub(crate) fn sample_record(request: &'static [u8], response: &'static [u8]) -> Record {
    let opened_at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_000);
    Record {
        id: Uuid::new_v4(),
        client_addr: "127.0.0.1:50000".parse().unwrap(),
        backend_addr: "backend.example:8080".to_string(),
        security: BackendSecurity::Plain,
        opened_at,
        closed_at: opened_at + Duration::from_millis(250),
        request: Bytes::from_static(request),
        response: Bytes::from_static(response),
        request_truncated: false,
        response_truncated: false,
        timed_out: false,
    }
}
