/// HTTP Host 头改写
///
/// 定位和替换是纯函数；HostRewriter 把它们用在分块到达的字节流上，
/// 让基于名字的虚拟主机后端看到自己的主机名
use std::ops::Range;
use tracing::debug;

const HOST_PREFIX: &[u8] = b"Host: ";

/// Only the first 8 KiB of a stream are searched for the header.
pub const DEFAULT_HOST_LOOKAHEAD: usize = 8 * 1024;

/// Result of scanning a byte window for the `Host` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSearch {
    /// A complete header line; `value` excludes the line terminator.
    Found { value: Range<usize> },
    /// The header starts at `line_start` but its line-feed has not arrived yet.
    Unterminated { line_start: usize },
    /// An empty line ended the header block before any `Host` header.
    HeaderEnd,
    /// No header yet. Bytes from `hold_from` on could still start one.
    NotFound { hold_from: usize },
}

/// Scan `input` for a `Host: ` line.
///
/// `previous` is the byte that preceded `input` in the stream (`None` at
/// stream start). Matches are only accepted at the beginning of a line, so
/// fields like `X-Forwarded-Host` are left alone.
pub fn find_host_header(input: &[u8], previous: Option<u8>) -> HostSearch {
    let mut next = match previous {
        None | Some(b'\n') => Some(0),
        Some(_) => line_after(input, 0),
    };

    while let Some(start) = next {
        let line = &input[start..];
        let after_newline = start > 0 || previous == Some(b'\n');

        if after_newline && (line.starts_with(b"\r\n") || line.starts_with(b"\n")) {
            return HostSearch::HeaderEnd;
        }

        if line.starts_with(HOST_PREFIX) {
            let value_start = start + HOST_PREFIX.len();
            return match input[value_start..].iter().position(|&b| b == b'\n') {
                Some(offset) => {
                    let mut value_end = value_start + offset;
                    if value_end > value_start && input[value_end - 1] == b'\r' {
                        value_end -= 1;
                    }
                    HostSearch::Found {
                        value: value_start..value_end,
                    }
                }
                None => HostSearch::Unterminated { line_start: start },
            };
        }

        // 行首残片可能在下一块中补全为 "Host: " 或空行
        if line.len() < HOST_PREFIX.len() && (HOST_PREFIX.starts_with(line) || line == b"\r") {
            return HostSearch::NotFound { hold_from: start };
        }

        next = line_after(input, start);
    }

    HostSearch::NotFound {
        hold_from: input.len(),
    }
}

/// Index of the first byte after the next line-feed at or after `from`.
fn line_after(input: &[u8], from: usize) -> Option<usize> {
    input[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|offset| from + offset + 1)
}

/// Replace the value of the first `Host` header in `input` with `new_value`.
///
/// Returns `None` when the header is absent or its line is incomplete. Bytes
/// after the value are shifted by the length difference and otherwise kept
/// as they were.
pub fn replace_host_value(input: &[u8], new_value: &[u8]) -> Option<Vec<u8>> {
    match find_host_header(input, None) {
        HostSearch::Found { value } => Some(splice(input, value, new_value)),
        _ => None,
    }
}

fn splice(input: &[u8], range: Range<usize>, new_value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() - range.len() + new_value.len());
    out.extend_from_slice(&input[..range.start]);
    out.extend_from_slice(new_value);
    out.extend_from_slice(&input[range.end..]);
    out
}

/// `Host` value advertised for a backend: the port is omitted when it is the
/// default for the transport in use.
pub fn host_header_value(host: &str, port: u16, secure: bool) -> String {
    let default_port = if secure { 443 } else { 80 };
    if port == default_port {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Scanning,
    Passthrough,
}

/// Streaming `Host` rewriter for the client→backend direction.
///
/// Bytes are released as soon as they can no longer be part of a `Host`
/// line; at most a started header line (bounded by the lookahead) is held.
#[derive(Debug)]
pub struct HostRewriter {
    replacement: Vec<u8>,
    lookahead: usize,
    pending: Vec<u8>,
    previous: Option<u8>,
    released: usize,
    state: FilterState,
    rewritten: bool,
}

impl HostRewriter {
    pub fn new(replacement: impl Into<Vec<u8>>) -> Self {
        Self::with_lookahead(replacement, DEFAULT_HOST_LOOKAHEAD)
    }

    pub fn with_lookahead(replacement: impl Into<Vec<u8>>, lookahead: usize) -> Self {
        Self {
            replacement: replacement.into(),
            lookahead,
            pending: Vec::new(),
            previous: None,
            released: 0,
            state: FilterState::Scanning,
            rewritten: false,
        }
    }

    /// Whether the header has been rewritten.
    pub fn is_rewritten(&self) -> bool {
        self.rewritten
    }

    /// Bytes currently held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one chunk; bytes ready to forward are appended to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        if self.state == FilterState::Passthrough {
            out.extend_from_slice(chunk);
            return;
        }

        self.pending.extend_from_slice(chunk);

        match find_host_header(&self.pending, self.previous) {
            HostSearch::Found { value } => {
                // 整行（含换行符）必须落在 lookahead 之内，与分块方式无关
                let line_end = line_after(&self.pending, value.end).unwrap_or(self.pending.len());
                if self.released + line_end > self.lookahead {
                    debug!("Host header line exceeds lookahead, forwarding unmodified");
                    self.pass_through(out);
                    return;
                }
                debug!(
                    "Rewriting Host header {:?} -> {:?}",
                    String::from_utf8_lossy(&self.pending[value.clone()]),
                    String::from_utf8_lossy(&self.replacement)
                );
                out.extend_from_slice(&splice(&self.pending, value, &self.replacement));
                self.pending.clear();
                self.rewritten = true;
                self.state = FilterState::Passthrough;
            }
            HostSearch::HeaderEnd => {
                self.pass_through(out);
            }
            HostSearch::Unterminated { line_start } => {
                self.release(line_start, out);
                if self.released + self.pending.len() >= self.lookahead {
                    debug!("Host header line exceeds lookahead, forwarding unmodified");
                    self.pass_through(out);
                }
            }
            HostSearch::NotFound { hold_from } => {
                self.release(hold_from, out);
                if self.released >= self.lookahead {
                    self.pass_through(out);
                }
            }
        }
    }

    /// Flush everything still held back (end of stream).
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        self.pass_through(out);
    }

    fn release(&mut self, n: usize, out: &mut Vec<u8>) {
        if n == 0 {
            return;
        }
        out.extend_from_slice(&self.pending[..n]);
        self.previous = Some(self.pending[n - 1]);
        self.released += n;
        self.pending.drain(..n);
    }

    fn pass_through(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.pending);
        self.state = FilterState::Passthrough;
    }
}
