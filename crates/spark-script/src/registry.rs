//! 句柄注册表：把原生资源以不透明 id 暴露给脚本，并在资源死亡后保留“僵尸”句柄。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 脚本会把 WebSocket 或 SSE 句柄长期保存在自己的表里；原生资源随时可能因对端断开而失效。
//! - 句柄必须在资源死亡后继续可读（id 与元数据），但再也不能触碰原生资源。
//!
//! ## 逻辑 (How)
//! - 活性用带标签的状态表达：`Live { native, metadata }` / `Closed { metadata }`，
//!   死亡即把 `native` 从状态中移走，类型层面杜绝悬空访问；
//! - 注册表使用 `DashMap<Arc<str>, Arc<Handle>>`，只在插入/删除时短暂持有分片锁；
//! - `mark_dead` 幂等，只有第一次迁移会交出原生资源，确保捕获的引用不会被释放两次。
//!
//! ## 契约 (What)
//! - 句柄 id 为 UUID v4 字符串，注册表内唯一；
//! - `lookup` 在句柄被 `remove` 之前始终可以取回僵尸句柄；
//! - 调用原生资源前先把 `Arc` 克隆出句柄锁，任何原生调用期间都不持有句柄锁，
//!   以便原生引擎同步回投的关闭事件可以重新进入本句柄。
//!
//! ## 注意事项 (Trade-offs)
//! - 元数据使用 `HashMap<String, ScriptValue>`，键的顺序不稳定；脚本侧若需要有序遍历应自行排序。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::native::WebSocketConnection;
use crate::response::ResponseHandle;
use crate::value::ScriptValue;

/// 句柄元数据。
pub type Metadata = HashMap<String, ScriptValue>;

/// 句柄 id。
pub type HandleId = Arc<str>;

/// 句柄所包装的资源种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    WebSocket,
    SseStream,
}

impl HandleKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            HandleKind::WebSocket => "websocket",
            HandleKind::SseStream => "sse stream",
        }
    }
}

/// 会话阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Opening,
    Open,
    Closing,
    Closed,
}

impl SessionPhase {
    const fn to_raw(self) -> u8 {
        match self {
            SessionPhase::Opening => 0,
            SessionPhase::Open => 1,
            SessionPhase::Closing => 2,
            SessionPhase::Closed => 3,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SessionPhase::Opening,
            1 => SessionPhase::Open,
            2 => SessionPhase::Closing,
            _ => SessionPhase::Closed,
        }
    }
}

/// 原生资源。
#[derive(Clone)]
pub enum NativeResource {
    WebSocket(Arc<dyn WebSocketConnection>),
    SseStream(ResponseHandle),
}

impl NativeResource {
    fn kind(&self) -> HandleKind {
        match self {
            NativeResource::WebSocket(_) => HandleKind::WebSocket,
            NativeResource::SseStream(_) => HandleKind::SseStream,
        }
    }
}

enum HandleState {
    Live {
        native: NativeResource,
        metadata: Metadata,
    },
    Closed {
        metadata: Metadata,
    },
}

impl HandleState {
    fn metadata(&self) -> &Metadata {
        match self {
            HandleState::Live { metadata, .. } | HandleState::Closed { metadata } => metadata,
        }
    }
}

/// 注册表中的一个句柄。
pub struct Handle {
    id: HandleId,
    kind: HandleKind,
    state: Mutex<HandleState>,
    phase: AtomicU8,
    terminal_delivered: AtomicBool,
}

impl Handle {
    fn new(native: NativeResource) -> Self {
        Self {
            id: Arc::from(Uuid::new_v4().to_string()),
            kind: native.kind(),
            state: Mutex::new(HandleState::Live {
                native,
                metadata: Metadata::new(),
            }),
            phase: AtomicU8::new(SessionPhase::Opening.to_raw()),
            terminal_delivered: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &HandleId {
        &self.id
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Live { .. })
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_raw(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase.to_raw(), Ordering::Release);
    }

    /// 死活均可读取。
    pub fn metadata(&self, key: &str) -> Option<ScriptValue> {
        self.state.lock().metadata().get(key).cloned()
    }

    pub fn metadata_snapshot(&self) -> Metadata {
        self.state.lock().metadata().clone()
    }

    /// 写入元数据；句柄死亡后返回 `ResourceClosed`。
    pub fn set_metadata(&self, key: impl Into<String>, value: ScriptValue) -> Result<()> {
        let mut state = self.state.lock();
        match &mut *state {
            HandleState::Live { metadata, .. } => {
                metadata.insert(key.into(), value);
                Ok(())
            }
            HandleState::Closed { .. } => Err(self.closed_error()),
        }
    }

    /// 克隆出原生资源；调用方在句柄锁之外使用它。
    pub fn native(&self) -> Result<NativeResource> {
        match &*self.state.lock() {
            HandleState::Live { native, .. } => Ok(native.clone()),
            HandleState::Closed { .. } => Err(self.closed_error()),
        }
    }

    /// 清除活性。只有第一次调用返回原生资源。
    pub(crate) fn kill(&self) -> Option<NativeResource> {
        let mut state = self.state.lock();
        let previous = std::mem::replace(
            &mut *state,
            HandleState::Closed {
                metadata: Metadata::new(),
            },
        );
        match previous {
            HandleState::Live { native, metadata } => {
                *state = HandleState::Closed { metadata };
                Some(native)
            }
            closed @ HandleState::Closed { .. } => {
                *state = closed;
                None
            }
        }
    }

    /// 认领终态回调的投递权；只有第一次调用返回 `true`。
    pub(crate) fn claim_terminal(&self) -> bool {
        !self.terminal_delivered.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn closed_error(&self) -> RuntimeError {
        RuntimeError::resource_closed(self.kind.as_str(), self.id.to_string())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .field("live", &self.is_live())
            .finish()
    }
}

/// 注册表计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered: u64,
    pub killed: u64,
    pub removed: u64,
}

/// 句柄注册表。
#[derive(Default)]
pub struct HandleRegistry {
    entries: DashMap<HandleId, Arc<Handle>>,
    registered: AtomicU64,
    killed: AtomicU64,
    removed: AtomicU64,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为新打开的原生资源分配句柄。
    pub fn register(&self, native: NativeResource) -> Arc<Handle> {
        let handle = Arc::new(Handle::new(native));
        self.entries.insert(handle.id.clone(), handle.clone());
        self.registered.fetch_add(1, Ordering::Relaxed);
        handle
    }

    /// 活句柄与僵尸句柄都可以查到，直到被 `remove`。
    pub fn lookup(&self, id: &str) -> Option<Arc<Handle>> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// 幂等地清除活性；只有首次迁移返回 `true`。
    pub fn mark_dead(&self, id: &str) -> bool {
        self.lookup(id)
            .map(|handle| self.kill(&handle).is_some())
            .unwrap_or(false)
    }

    /// 清除活性并交出原生资源。
    pub(crate) fn kill(&self, handle: &Handle) -> Option<NativeResource> {
        let native = handle.kill();
        if native.is_some() {
            self.killed.fetch_add(1, Ordering::Relaxed);
        }
        native
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Handle>> {
        let removed = self.entries.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            self.removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// 取出全部句柄（重启/关机时使用）。
    pub fn drain(&self) -> Vec<Arc<Handle>> {
        let ids: Vec<HandleId> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.registered.load(Ordering::Relaxed),
            killed: self.killed.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
        }
    }
}
