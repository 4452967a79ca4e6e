//! 文件传输引擎：按文件大小选择策略，并在背压下分块推送。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 小文件整体读入一次写出最省事；大文件必须分块，且在发送缓冲已满时挂起、
//!   等待原生引擎的可写通知后原样重试，既不丢块也不重复读取。
//!
//! ## 逻辑 (How)
//! - `size < inline_threshold` → [`TransferStrategy::Inline`]：同步读入，一次 `end`；
//! - `size > mapped_threshold` → [`TransferStrategy::Mapped`]：内存映射，按偏移切片；
//! - 其余 → [`TransferStrategy::Buffered`]：每块读入固定缓冲；
//! - 会话存放在 `DashMap` 中；推送时先把会话移出表，推送期间不持有任何表锁，
//!   挂起时若响应仍然打开再放回。
//!
//! ## 契约 (What)
//! - 写出的字节连续、单调，总和恰好等于文件大小；响应恰好结束一次；
//! - 完成、读取失败、中止、超时任一发生时会话被释放恰好一次（文件句柄/映射随 `Drop` 关闭）；
//! - 超过截止时间的会话由 [`TransferEngine::expire`] 终止并记录 `TransferTimeout`：
//!   尚无 body 字节被接收时响应头仍可替换，改答 500；已有字节上线时只能关闭连接。

mod session;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::Clock;
use crate::error::{FileOp, Result, RuntimeError};
use crate::mime::content_type_for;
use crate::native::ConnectionId;
use crate::response::ResponseHandle;

use self::session::{PumpOutcome, TransferSession};

/// 传输策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferStrategy {
    Inline,
    Buffered,
    Mapped,
}

/// 策略阈值与分块参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferLimits {
    pub inline_threshold: u64,
    pub mapped_threshold: u64,
    pub chunk_size: usize,
    pub deadline: Duration,
}

impl TransferLimits {
    pub fn select(&self, size: u64) -> TransferStrategy {
        if size < self.inline_threshold {
            TransferStrategy::Inline
        } else if size > self.mapped_threshold {
            TransferStrategy::Mapped
        } else {
            TransferStrategy::Buffered
        }
    }
}

impl Default for TransferLimits {
    fn default() -> Self {
        crate::config::TransferConfig::default().limits()
    }
}

/// 传输计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub timed_out: u64,
    pub failed: u64,
}

/// 传输引擎。
pub struct TransferEngine {
    limits: TransferLimits,
    clock: Arc<dyn Clock>,
    sessions: DashMap<ConnectionId, TransferSession>,
    started: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
}

impl TransferEngine {
    /// `chunk_size` 为零时按 1 处理，否则推送循环永远无法前进。
    pub fn new(limits: TransferLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits: TransferLimits {
                chunk_size: limits.chunk_size.max(1),
                ..limits
            },
            clock,
            sessions: DashMap::new(),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> &TransferLimits {
        &self.limits
    }

    /// 把 `path` 作为 200 响应发送出去。
    ///
    /// 打开或读取失败时返回错误且不写任何响应头，调用方据此回复 500。
    pub fn start(&self, response: ResponseHandle, path: &Path) -> Result<TransferStrategy> {
        let size = std::fs::metadata(path)
            .map_err(|err| RuntimeError::io(FileOp::Metadata, path, err))?
            .len();
        let strategy = self.limits.select(size);
        let content_type = content_type_for(path);

        if strategy == TransferStrategy::Inline {
            let body =
                std::fs::read(path).map_err(|err| RuntimeError::io(FileOp::Read, path, err))?;
            self.started.fetch_add(1, Ordering::Relaxed);
            write_head(&response, content_type, body.len() as u64)?;
            response.end(&body)?;
            self.completed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(target: "spark_script::transfer", path = %path.display(), size, "inline transfer completed");
            return Ok(strategy);
        }

        let session = TransferSession::open(
            response.clone(),
            path,
            size,
            strategy,
            self.limits.chunk_size,
            self.clock.now(),
        )?;
        self.started.fetch_add(1, Ordering::Relaxed);
        write_head(&response, content_type, size)?;
        tracing::debug!(target: "spark_script::transfer", path = %path.display(), size, ?strategy, "streaming transfer started");
        self.drive(session);
        Ok(strategy)
    }

    /// 发送缓冲重新可写：继续推送。返回该连接是否仍有挂起的传输。
    pub fn on_writable(&self, conn: ConnectionId) -> bool {
        match self.sessions.remove(&conn) {
            Some((_, session)) => {
                self.drive(session);
                self.sessions.contains_key(&conn)
            }
            None => false,
        }
    }

    /// 对端中止：释放会话。只有第一次调用返回 `true`。
    pub fn abort(&self, conn: ConnectionId) -> bool {
        match self.sessions.remove(&conn) {
            Some((_, session)) => {
                self.aborted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    target: "spark_script::transfer",
                    %conn,
                    path = %session.path().display(),
                    sent = session.sent(),
                    "transfer aborted by peer"
                );
                true
            }
            None => false,
        }
    }

    /// 关闭所有超过截止时间的会话，返回数量。
    pub fn expire(&self) -> usize {
        let now = self.clock.now();
        let deadline = self.limits.deadline;
        let expired: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.value().started()) >= deadline)
            .map(|entry| *entry.key())
            .collect();

        let mut count = 0;
        for conn in expired {
            let Some((_, session)) = self.sessions.remove(&conn) else {
                continue;
            };
            count += 1;
            self.timed_out.fetch_add(1, Ordering::Relaxed);
            let err = RuntimeError::TransferTimeout {
                path: session.path().to_path_buf(),
                deadline,
            };
            if session.sent() == 0 {
                tracing::warn!(
                    target: "spark_script::transfer",
                    %conn,
                    code = err.code(),
                    error = %err,
                    "answering stalled transfer with 500"
                );
                if fail_head(session.response()).is_err() {
                    let _ = session.response().close();
                }
            } else {
                tracing::warn!(
                    target: "spark_script::transfer",
                    %conn,
                    sent = session.sent(),
                    code = err.code(),
                    error = %err,
                    "closing stalled transfer"
                );
                let _ = session.response().close();
            }
        }
        count
    }

    /// 关闭全部会话（重启/关机）。
    pub fn abort_all(&self) -> usize {
        let conns: Vec<ConnectionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut count = 0;
        for conn in conns {
            if let Some((_, session)) = self.sessions.remove(&conn) {
                count += 1;
                self.aborted.fetch_add(1, Ordering::Relaxed);
                let _ = session.response().close();
            }
        }
        count
    }

    pub fn is_active(&self, conn: ConnectionId) -> bool {
        self.sessions.contains_key(&conn)
    }

    pub fn active_len(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn drive(&self, mut session: TransferSession) {
        match session.pump() {
            PumpOutcome::Pending => {
                if session.response().is_open() {
                    self.sessions.insert(session.conn(), session);
                } else {
                    self.aborted.fetch_add(1, Ordering::Relaxed);
                }
            }
            PumpOutcome::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target: "spark_script::transfer",
                    conn = %session.conn(),
                    sent = session.sent(),
                    "transfer completed"
                );
            }
            PumpOutcome::Failed(err) => {
                if err.is_resource_closed() {
                    self.aborted.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        target: "spark_script::transfer",
                        conn = %session.conn(),
                        code = err.code(),
                        error = %err,
                        "transfer failed mid-stream"
                    );
                    let _ = session.response().close();
                }
            }
        }
    }
}

impl fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEngine")
            .field("limits", &self.limits)
            .field("active", &self.sessions.len())
            .finish()
    }
}

fn write_head(response: &ResponseHandle, content_type: &str, length: u64) -> Result<()> {
    response.write_status(200)?;
    response.write_header("Content-Type", content_type)?;
    response.write_header("Content-Length", &length.to_string())
}

/// 替换尚未提交的 200 响应头并以 500 结束。
fn fail_head(response: &ResponseHandle) -> Result<()> {
    const BODY: &[u8] = b"Internal Server Error";
    response.write_status(500)?;
    response.write_header("Content-Type", "text/plain; charset=utf-8")?;
    response.write_header("Content-Length", &BODY.len().to_string())?;
    response.end(BODY)
}
