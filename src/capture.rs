/// 抓包缓冲区模块
///
/// 单方向转发数据的只追加缓冲区，可选字节上限
use bytes::{Bytes, BytesMut};

/// 初始容量
const INITIAL_CAPACITY: usize = 4096;

/// 只追加的抓包缓冲区
///
/// # 示例
/// ```rust
/// use tcp_monitor::capture::CaptureBuffer;
///
/// let mut buf = CaptureBuffer::with_limit(Some(8));
/// buf.push_slice(b"Hello, ");
/// buf.push_slice(b"World!");
/// assert_eq!(buf.as_slice(), b"Hello, W");
/// assert!(buf.is_truncated());
/// assert_eq!(buf.observed(), 13);
/// ```
#[derive(Debug)]
pub struct CaptureBuffer {
    inner: BytesMut,
    limit: Option<usize>,
    observed: u64,
    truncated: bool,
}

impl CaptureBuffer {
    /// 创建无上限的缓冲区
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// 创建带上限的缓冲区，超出部分只计数不保存
    pub fn with_limit(limit: Option<usize>) -> Self {
        let capacity = limit.map_or(INITIAL_CAPACITY, |l| l.min(INITIAL_CAPACITY));
        Self {
            inner: BytesMut::with_capacity(capacity),
            limit,
            observed: 0,
            truncated: false,
        }
    }

    /// 追加数据
    pub fn push_slice(&mut self, data: &[u8]) {
        self.observed += data.len() as u64;

        let accepted = match self.limit {
            Some(limit) => {
                let room = limit.saturating_sub(self.inner.len());
                if room < data.len() {
                    self.truncated = true;
                }
                &data[..room.min(data.len())]
            }
            None => data,
        };
        self.inner.extend_from_slice(accepted);
    }

    /// 已保存的数据
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// 已保存的字节数
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 观察到的总字节数（包括超限未保存的部分）
    pub fn observed(&self) -> u64 {
        self.observed
    }

    /// 是否因上限丢弃过数据
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// 冻结为不可变数据
    pub fn freeze(self) -> (Bytes, bool) {
        (self.inner.freeze(), self.truncated)
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<[u8]> for CaptureBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}
