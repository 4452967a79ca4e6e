//! 脚本可见的 HTTP 响应句柄。
//!
//! # 教案式说明
//! - **意图（Why）**：原生响应对象在连接中止后立即失效；脚本却可能把 `res` 保存到定时器或
//!   异步回调里稍后使用。句柄在原生对象外包一层终态标记，保证中止或结束后的任何调用都得到
//!   `ResourceClosed`，而不是触碰悬空的原生资源。
//! - **契约（What）**：
//!   - 状态机 `Open → Finished | Aborted`，只迁移一次；
//!   - `end`/`close` 成功后触发一次完成钩子，由连接管理器用来回收交换表条目；
//!   - 中止只由连接管理器调用，不回调原生引擎。

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{Result, RuntimeError};
use crate::native::{ConnectionId, HttpResponse, WriteStatus};

const OPEN: u8 = 0;
const FINISHED: u8 = 1;
const ABORTED: u8 = 2;

const RESOURCE_KIND: &str = "response";

type FinishHook = Box<dyn Fn(ConnectionId) + Send + Sync>;

struct ResponseInner {
    conn: ConnectionId,
    native: Arc<dyn HttpResponse>,
    state: AtomicU8,
    body_bytes: AtomicU64,
    on_finish: OnceLock<FinishHook>,
}

/// HTTP 响应句柄，可廉价克隆，所有克隆共享同一终态。
#[derive(Clone)]
pub struct ResponseHandle {
    inner: Arc<ResponseInner>,
}

impl ResponseHandle {
    pub fn new(conn: ConnectionId, native: Arc<dyn HttpResponse>) -> Self {
        Self {
            inner: Arc::new(ResponseInner {
                conn,
                native,
                state: AtomicU8::new(OPEN),
                body_bytes: AtomicU64::new(0),
                on_finish: OnceLock::new(),
            }),
        }
    }

    pub fn conn(&self) -> ConnectionId {
        self.inner.conn
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == OPEN
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == ABORTED
    }

    /// 两个句柄是否指向同一次响应。
    pub fn same_as(&self, other: &ResponseHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 已被原生引擎接收的 body 字节数。
    pub fn bytes_written(&self) -> u64 {
        self.inner.body_bytes.load(Ordering::Acquire)
    }

    pub fn write_status(&self, status: u16) -> Result<()> {
        self.ensure_open()?;
        self.inner.native.write_status(status);
        Ok(())
    }

    pub fn write_header(&self, name: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.native.write_header(name, value);
        Ok(())
    }

    /// 非阻塞写入一块 body；`Full` 表示本块未被接收。
    pub fn write(&self, chunk: &[u8]) -> Result<WriteStatus> {
        self.ensure_open()?;
        let status = self.inner.native.try_write(chunk);
        if status == WriteStatus::Written {
            self.inner
                .body_bytes
                .fetch_add(chunk.len() as u64, Ordering::AcqRel);
        }
        Ok(status)
    }

    /// 写出最后一段 body 并结束响应。重复调用返回 `ResourceClosed`。
    pub fn end(&self, body: &[u8]) -> Result<()> {
        self.transition(FINISHED)?;
        self.inner
            .body_bytes
            .fetch_add(body.len() as u64, Ordering::AcqRel);
        self.inner.native.end(body);
        self.run_finish_hook();
        Ok(())
    }

    /// 立即断开连接。
    pub fn close(&self) -> Result<()> {
        self.transition(FINISHED)?;
        self.inner.native.close();
        self.run_finish_hook();
        Ok(())
    }

    pub fn remote_address(&self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.inner.native.remote_address())
    }

    /// 连接被对端中止：只翻转状态，不再触碰原生资源。首次迁移返回 `true`。
    pub(crate) fn mark_aborted(&self) -> bool {
        self.transition(ABORTED).is_ok()
    }

    /// 若响应仍然打开，则以纯文本结束它。
    pub(crate) fn respond_text(&self, status: u16, body: &str) -> bool {
        if !self.is_open() {
            return false;
        }
        self.inner.native.write_status(status);
        self.inner
            .native
            .write_header("Content-Type", "text/plain");
        self.end(body.as_bytes()).is_ok()
    }

    pub(crate) fn set_finish_hook(&self, hook: impl Fn(ConnectionId) + Send + Sync + 'static) {
        let _ = self.inner.on_finish.set(Box::new(hook));
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn transition(&self, next: u8) -> Result<()> {
        self.inner
            .state
            .compare_exchange(OPEN, next, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| self.closed_error())
    }

    fn run_finish_hook(&self) {
        if let Some(hook) = self.inner.on_finish.get() {
            hook(self.inner.conn);
        }
    }

    fn closed_error(&self) -> RuntimeError {
        RuntimeError::resource_closed(RESOURCE_KIND, self.inner.conn.to_string())
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("conn", &self.inner.conn)
            .field("state", &self.inner.state.load(Ordering::Acquire))
            .finish()
    }
}
