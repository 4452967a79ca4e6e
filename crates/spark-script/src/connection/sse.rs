//! Server-Sent Events 流。
//!
//! # 教案式说明
//! - **意图（Why）**：SSE 流是一个永不主动结束的 HTTP 响应；脚本通过流 id 在任意时刻
//!   （定时器、其它连接的回调）推送事件，因此流必须作为注册表句柄存在。
//! - **逻辑（How）**：
//!   - 打开时立即提交 `200 text/event-stream` 响应头并写入一条注释帧，随后登记句柄；
//!   - 发送遇到背压时帧进入待发队列，等到同一连接的 `HttpWritable` 再按序冲刷；
//!     队列按字节计量，超过 `sse.max_pending_bytes` 的新帧被丢弃并报告 `Dropped`；
//!   - 调用原生 `try_write` 时不持有队列锁，原生侧在写入中同步投递中止也不会死锁；
//!   - 显式关闭、对端中止、重启静默三条路径都从 `sse_streams` 中 `remove` 条目，
//!     谁先拿到谁负责清理，清理因此恰好一次。
//! - **契约（What）**：
//!   - `sse_send` 对未知或已终止的 id 返回 `ResourceClosed`；
//!   - 积压字节数不超过配置上限；
//!   - `sse_close` 幂等；关闭回调在显式关闭或中止时恰好调用一次，重启静默不调用脚本。

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, RuntimeError};
use crate::native::{ConnectionId, WriteStatus};
use crate::registry::{HandleKind, NativeResource, SessionPhase};
use crate::response::ResponseHandle;
use crate::router::SseBehavior;
use crate::value::{CallbackRef, ScriptValue};

use super::ConnectionManager;
use super::http::HttpExchange;

/// 打开时写出的注释帧，用于提交响应头。
const PREAMBLE: &[u8] = b":ok\n\n";

/// 一条 `text/event-stream` 事件。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, millis: u64) -> Self {
        self.retry = Some(millis);
        self
    }

    /// 编码为一帧：每行负载一条 `data:`，空行结束。
    pub fn encode(&self) -> Bytes {
        let mut frame = String::with_capacity(self.data.len() + 32);
        if let Some(id) = &self.id {
            let _ = writeln!(frame, "id: {}", single_line(id));
        }
        if let Some(event) = &self.event {
            let _ = writeln!(frame, "event: {}", single_line(event));
        }
        if let Some(retry) = self.retry {
            let _ = writeln!(frame, "retry: {retry}");
        }
        for line in self.data.split('\n') {
            let _ = writeln!(frame, "data: {}", line.strip_suffix('\r').unwrap_or(line));
        }
        frame.push('\n');
        Bytes::from(frame)
    }
}

fn single_line(value: &str) -> &str {
    value.lines().next().unwrap_or("")
}

/// `sse_send` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SseSendStatus {
    Sent,
    /// 帧已排队，等待连接重新可写。
    Backpressured,
    /// 积压已达上限，帧被丢弃；流保持打开。
    Dropped,
}

/// 按字节计量的待发帧队列。
#[derive(Debug, Default)]
struct Backlog {
    frames: VecDeque<Bytes>,
    bytes: usize,
}

impl Backlog {
    fn push_back(&mut self, frame: Bytes) {
        self.bytes += frame.len();
        self.frames.push_back(frame);
    }

    fn push_front(&mut self, frame: Bytes) {
        self.bytes += frame.len();
        self.frames.push_front(frame);
    }

    fn pop_front(&mut self) -> Option<Bytes> {
        let frame = self.frames.pop_front()?;
        self.bytes -= frame.len();
        Some(frame)
    }

    fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn admits(&self, len: usize, limit: usize) -> bool {
        self.bytes.saturating_add(len) <= limit
    }

    fn clear(&mut self) {
        self.frames.clear();
        self.bytes = 0;
    }
}

#[derive(Clone)]
pub(super) struct SseStream {
    conn: ConnectionId,
    close: Option<CallbackRef>,
    pending: Arc<Mutex<Backlog>>,
}

impl ConnectionManager {
    pub(super) fn open_stream(&self, exchange: &HttpExchange, behavior: SseBehavior) {
        let response = exchange.response().clone();
        let conn = response.conn();
        let mut pending = Backlog::default();
        match commit_stream_head(&response) {
            Ok(WriteStatus::Written) => {}
            Ok(WriteStatus::Full) => pending.push_back(Bytes::from_static(PREAMBLE)),
            Err(err) => {
                tracing::debug!(target: "spark_script::connection", %conn, error = %err, "sse stream closed before open");
                return;
            }
        }

        let handle = self
            .streams
            .register(NativeResource::SseStream(response.clone()));
        let id = handle.id().clone();
        self.sse_streams.insert(
            id.clone(),
            SseStream {
                conn,
                close: behavior.close,
                pending: Arc::new(Mutex::new(pending)),
            },
        );
        self.sse_conns.insert(conn, id.clone());
        handle.set_phase(SessionPhase::Open);
        tracing::debug!(target: "spark_script::connection", %conn, id = %id, "sse stream opened");

        let args = vec![
            ScriptValue::str(&*id),
            ScriptValue::Request(exchange.request().clone()),
        ];
        if self.bridge.invoke("sse.open", behavior.open, args).is_err() {
            let _ = self.sse_close(&id);
        }
    }

    /// 向流推送一条事件。
    pub fn sse_send(&self, id: &str, event: &SseEvent) -> Result<SseSendStatus> {
        let closed = || RuntimeError::resource_closed(HandleKind::SseStream.as_str(), id);
        let handle = self.streams.lookup(id).ok_or_else(closed)?;
        let NativeResource::SseStream(response) = handle.native()? else {
            return Err(closed());
        };
        let stream = self
            .sse_streams
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(closed)?;

        let frame = event.encode();
        {
            let mut pending = stream.pending.lock();
            if !pending.is_empty() {
                return Ok(self.enqueue(&mut pending, frame, id));
            }
        }
        match response.write(&frame)? {
            WriteStatus::Written => Ok(SseSendStatus::Sent),
            WriteStatus::Full => Ok(self.enqueue(&mut stream.pending.lock(), frame, id)),
        }
    }

    fn enqueue(&self, pending: &mut Backlog, frame: Bytes, id: &str) -> SseSendStatus {
        if !pending.admits(frame.len(), self.sse_backlog_limit) {
            tracing::warn!(
                target: "spark_script::connection",
                id,
                backlog = pending.bytes,
                limit = self.sse_backlog_limit,
                "sse backlog full, dropping event"
            );
            return SseSendStatus::Dropped;
        }
        pending.push_back(frame);
        SseSendStatus::Backpressured
    }

    /// 结束流；对未知或已关闭的 id 是空操作。
    pub fn sse_close(&self, id: &str) -> Result<()> {
        let Some((_, stream)) = self.sse_streams.remove(id) else {
            return Ok(());
        };
        self.sse_conns.remove(&stream.conn);
        self.finish_stream(id, stream, true);
        Ok(())
    }

    /// 连接重新可写：按序冲刷待发帧。
    pub(super) fn flush_stream(&self, conn: ConnectionId) {
        let Some(id) = self.sse_conns.get(&conn).map(|entry| entry.value().clone()) else {
            return;
        };
        let Some(stream) = self.sse_streams.get(&id).map(|entry| entry.value().clone()) else {
            return;
        };
        let Some(NativeResource::SseStream(response)) =
            self.streams.lookup(&id).and_then(|handle| handle.native().ok())
        else {
            return;
        };

        loop {
            let Some(frame) = stream.pending.lock().pop_front() else {
                break;
            };
            match response.write(&frame) {
                Ok(WriteStatus::Written) => {}
                Ok(WriteStatus::Full) => {
                    stream.pending.lock().push_front(frame);
                    break;
                }
                Err(_) => {
                    stream.pending.lock().clear();
                    break;
                }
            }
        }
    }

    /// 对端中止：响应已被标记为中止，只做清理与关闭回调。
    pub(super) fn abort_stream(&self, conn: ConnectionId) {
        let Some((_, id)) = self.sse_conns.remove(&conn) else {
            return;
        };
        if let Some((_, stream)) = self.sse_streams.remove(&id) {
            tracing::debug!(target: "spark_script::connection", %conn, id = %id, "sse stream aborted by peer");
            self.finish_stream(&id, stream, false);
        }
    }

    pub(super) fn quiesce_streams(&self) -> usize {
        let ids: Vec<_> = self
            .sse_streams
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut count = 0;
        for id in ids {
            let Some((_, stream)) = self.sse_streams.remove(&id) else {
                continue;
            };
            count += 1;
            self.sse_conns.remove(&stream.conn);
            let Some(handle) = self.streams.remove(&id) else {
                continue;
            };
            handle.claim_terminal();
            if let Some(NativeResource::SseStream(response)) = self.streams.kill(&handle) {
                let _ = response.end(&[]);
            }
            handle.set_phase(SessionPhase::Closed);
        }
        count
    }

    fn finish_stream(&self, id: &str, stream: SseStream, end_response: bool) {
        stream.pending.lock().clear();
        let Some(handle) = self.streams.lookup(id) else {
            return;
        };
        handle.set_phase(SessionPhase::Closing);
        if let Some(NativeResource::SseStream(response)) = self.streams.kill(&handle)
            && end_response
        {
            let _ = response.end(&[]);
        }
        handle.set_phase(SessionPhase::Closed);
        if handle.claim_terminal()
            && let Some(close) = stream.close
        {
            let _ = self
                .bridge
                .invoke("sse.close", close, vec![ScriptValue::str(id)]);
        }
        self.streams.remove(id);
        tracing::debug!(target: "spark_script::connection", conn = %stream.conn, id, "sse stream closed");
    }
}

fn commit_stream_head(response: &ResponseHandle) -> Result<WriteStatus> {
    response.write_status(200)?;
    response.write_header("Content-Type", "text/event-stream")?;
    response.write_header("Cache-Control", "no-cache")?;
    response.write_header("Connection", "keep-alive")?;
    response.write(PREAMBLE)
}
