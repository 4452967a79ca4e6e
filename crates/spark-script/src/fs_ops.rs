//! 脚本可见的文件操作：同步读写与基于工作线程的异步读写。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 同步读写直接在事件循环线程上执行，适合小文件与启动阶段；
//! - 异步读写把阻塞 I/O 交给一次性工作线程，但工作线程绝不触碰解释器状态。
//!
//! ## 逻辑 (How)
//! - 每个异步操作分配一个操作号，回调引用登记在 `pending` 表；
//! - 工作线程完成后把结果投入 `tokio::sync::mpsc` 无界通道，并调用可选的唤醒钩子；
//! - 事件循环线程在每次迭代结束时 [`FileWorkers::drain_completions`]，按操作号认领回调并调用，
//!   调用后释放回调引用；认领失败（已被取消）的完成结果直接丢弃。
//!
//! ## 契约 (What)
//! - 结果以 `(true, value)` / `(false, message)` 两元组的形式交给脚本；
//! - 正在进行的 I/O 无法取消，[`FileWorkers::cancel_all`] 只保证其结果不再投递。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::bridge::CallbackBridge;
use crate::error::{FileOp, Result, RuntimeError};
use crate::value::{CallbackRef, ScriptValue};

/// 工作线程完成后唤醒事件循环的钩子。
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// 同步读取整个文件。
pub fn read_file(path: impl AsRef<Path>) -> Result<Bytes> {
    let path = path.as_ref();
    std::fs::read(path)
        .map(Bytes::from)
        .map_err(|err| RuntimeError::io(FileOp::Read, path, err))
}

/// 同步写入（覆盖）文件，返回写入字节数。
pub fn write_file(path: impl AsRef<Path>, data: &[u8]) -> Result<usize> {
    let path = path.as_ref();
    std::fs::write(path, data)
        .map(|()| data.len())
        .map_err(|err| RuntimeError::io(FileOp::Write, path, err))
}

/// 把操作结果翻译为脚本可见的两元组。
pub fn outcome_values(outcome: Result<ScriptValue>) -> Vec<ScriptValue> {
    match outcome {
        Ok(value) => vec![ScriptValue::Bool(true), value],
        Err(err) => vec![ScriptValue::Bool(false), ScriptValue::str(err.to_string())],
    }
}

enum FileOutcome {
    Read(Bytes),
    Written(usize),
}

impl FileOutcome {
    fn into_value(self) -> ScriptValue {
        match self {
            FileOutcome::Read(bytes) => ScriptValue::Bytes(bytes),
            FileOutcome::Written(len) => {
                ScriptValue::Integer(i64::try_from(len).unwrap_or(i64::MAX))
            }
        }
    }
}

struct Completion {
    op: u64,
    outcome: Result<FileOutcome>,
}

/// 异步文件操作表。
pub struct FileWorkers {
    bridge: Arc<CallbackBridge>,
    sender: mpsc::UnboundedSender<Completion>,
    receiver: Mutex<mpsc::UnboundedReceiver<Completion>>,
    pending: DashMap<u64, CallbackRef>,
    next_op: AtomicU64,
    waker: Option<Waker>,
}

impl FileWorkers {
    pub fn new(bridge: Arc<CallbackBridge>, waker: Option<Waker>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            bridge,
            sender,
            receiver: Mutex::new(receiver),
            pending: DashMap::new(),
            next_op: AtomicU64::new(1),
            waker,
        }
    }

    /// 异步读取；`callback(ok, bytes | message)` 在事件循环线程上调用。
    pub fn read_async(&self, path: impl Into<PathBuf>, callback: CallbackRef) -> u64 {
        let path = path.into();
        self.spawn(callback, move || read_file(&path).map(FileOutcome::Read))
    }

    /// 异步写入；`callback(ok, written | message)`。
    pub fn write_async(&self, path: impl Into<PathBuf>, data: Bytes, callback: CallbackRef) -> u64 {
        let path = path.into();
        self.spawn(callback, move || {
            write_file(&path, &data).map(FileOutcome::Written)
        })
    }

    /// 投递全部已完成操作的回调，返回投递数量。
    pub fn drain_completions(&self) -> usize {
        let completions: Vec<Completion> = {
            let mut receiver = self.receiver.lock();
            std::iter::from_fn(|| receiver.try_recv().ok()).collect()
        };

        let mut delivered = 0;
        for completion in completions {
            let Some((_, callback)) = self.pending.remove(&completion.op) else {
                tracing::debug!(target: "spark_script::fs", op = completion.op, "completion for cancelled operation discarded");
                continue;
            };
            if let Err(err) = &completion.outcome {
                tracing::warn!(target: "spark_script::fs", op = completion.op, code = err.code(), error = %err, "file operation failed");
            }
            let args = outcome_values(completion.outcome.map(FileOutcome::into_value));
            let _ = self.bridge.invoke("fs.complete", callback, args);
            self.bridge.release_callback(callback);
            delivered += 1;
        }
        delivered
    }

    /// 放弃全部挂起操作并释放回调引用，返回数量。
    pub fn cancel_all(&self) -> usize {
        let ops: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut count = 0;
        for op in ops {
            if let Some((_, callback)) = self.pending.remove(&op) {
                self.bridge.release_callback(callback);
                count += 1;
            }
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn spawn<F>(&self, callback: CallbackRef, work: F) -> u64
    where
        F: FnOnce() -> Result<FileOutcome> + Send + 'static,
    {
        let op = self.next_op.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(op, callback);

        let sender = self.sender.clone();
        let waker = self.waker.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("spark-script-fs-{op}"))
            .spawn(move || {
                let outcome = work();
                if sender.send(Completion { op, outcome }).is_ok()
                    && let Some(wake) = waker
                {
                    wake();
                }
            });

        if let Err(err) = spawned {
            tracing::error!(target: "spark_script::fs", op, error = %err, "failed to spawn file worker");
            let outcome = Err(RuntimeError::io(FileOp::Open, PathBuf::new(), err));
            let _ = self.sender.send(Completion { op, outcome });
        }
        op
    }
}

impl fmt::Debug for FileWorkers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWorkers")
            .field("pending", &self.pending.len())
            .finish()
    }
}
