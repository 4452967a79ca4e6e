//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为运行时核心暴露统一的错误域，覆盖脚本回调失败、句柄已关闭、文件 I/O、传输超时、
//!   监听失败与生命周期非法迁移等路径；
//! - 每个变体绑定稳定错误码（`spark.script.*`），便于日志检索与告警聚合。
//!
//! ## 设计要求（What）
//! - 所有错误均派生 [`thiserror::Error`]，可被 `?` 直接传播；
//! - 错误在发生的边界处被处理：HTTP 客户端看到 500/403/404，WebSocket/SSE 对端看到连接关闭，
//!   文件操作调用方收到 `(false, message)`，不会越过事件分发点继续展开。

use std::{fmt, io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::server::ServerState;

/// 运行时核心的结果别名。
pub type Result<T, E = RuntimeError> = core::result::Result<T, E>;

pub(crate) const CALLBACK_FAILED: &str = "spark.script.callback_failed";
pub(crate) const RESOURCE_CLOSED: &str = "spark.script.resource_closed";
pub(crate) const IO_FAILED: &str = "spark.script.io_failed";
pub(crate) const TRANSFER_TIMEOUT: &str = "spark.script.transfer_timeout";
pub(crate) const BIND_FAILED: &str = "spark.script.bind_failed";
pub(crate) const INVALID_STATE: &str = "spark.script.invalid_state";
pub(crate) const STATIC_ROOT: &str = "spark.script.static_root_missing";
pub(crate) const NO_APPLICATION: &str = "spark.script.no_application";

/// 触发 I/O 错误的文件操作类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileOp {
    Open,
    Metadata,
    Read,
    Write,
    Map,
}

impl FileOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            FileOp::Open => "open",
            FileOp::Metadata => "stat",
            FileOp::Read => "read",
            FileOp::Write => "write",
            FileOp::Map => "mmap",
        }
    }
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行时核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“脚本失败”“资源已死”“底层 I/O 失败”等不同来源的异常收敛到一个枚举，
///   组件之间可以直接 `?` 传播，边界处再统一翻译为协议层响应。
/// - **契约 (What)**：
///   - [`RuntimeError::code`] 返回稳定错误码，不随文案调整而变化；
///   - `ScriptCallback` 只在回调桥内部构造，永远不会以 panic 形式越过事件循环；
///   - `ResourceClosed` 表示目标句柄或响应已经进入终态，调用方不应重试。
/// - **设计权衡 (Trade-offs)**：上下文使用 `String`/`PathBuf` 持有，牺牲少量分配换取可读日志。
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// 脚本回调抛出错误或在解释器内部 panic。
    #[error("script callback #{callback} failed during {site}: {message}")]
    ScriptCallback {
        site: &'static str,
        callback: u64,
        message: String,
    },

    /// 目标资源已进入终态（句柄死亡、响应结束或连接中止）。
    #[error("{kind} `{id}` is closed")]
    ResourceClosed { kind: &'static str, id: String },

    #[error("{op} `{}` failed: {source}", path.display())]
    Io {
        op: FileOp,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 流式传输在截止时间内没有完成。
    #[error("transfer of `{}` exceeded its {deadline:?} deadline", path.display())]
    TransferTimeout { path: PathBuf, deadline: Duration },

    #[error("listen on port {port} failed: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// 生命周期状态机拒绝当前动作。
    #[error("cannot {action} while server is {state}")]
    InvalidState {
        action: &'static str,
        state: ServerState,
    },

    #[error("static root `{}` is not a directory", path.display())]
    StaticRoot { path: PathBuf },

    /// 服务器已终止或尚未创建应用实例。
    #[error("no application instance is current")]
    NoApplication,
}

impl RuntimeError {
    /// 构造 `ResourceClosed`。
    pub fn resource_closed(kind: &'static str, id: impl Into<String>) -> Self {
        RuntimeError::ResourceClosed {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn io(op: FileOp, path: impl Into<PathBuf>, source: io::Error) -> Self {
        RuntimeError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::ScriptCallback { .. } => CALLBACK_FAILED,
            RuntimeError::ResourceClosed { .. } => RESOURCE_CLOSED,
            RuntimeError::Io { .. } => IO_FAILED,
            RuntimeError::TransferTimeout { .. } => TRANSFER_TIMEOUT,
            RuntimeError::Bind { .. } => BIND_FAILED,
            RuntimeError::InvalidState { .. } => INVALID_STATE,
            RuntimeError::StaticRoot { .. } => STATIC_ROOT,
            RuntimeError::NoApplication => NO_APPLICATION,
        }
    }

    pub fn is_resource_closed(&self) -> bool {
        matches!(self, RuntimeError::ResourceClosed { .. })
    }
}

/// 解释器返回的脚本级错误。
///
/// 解释器协作方把脚本异常（含 traceback 文本）折叠为一条消息，运行时只负责记录与转换。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ScriptError {
    message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
