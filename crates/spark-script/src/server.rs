//! 服务器生命周期：`Created → Listening → Draining → Terminated`，以及热重启。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 热重启必须在不重启进程的前提下替换整套路由与状态；旧实例的连接、定时器与脚本引用
//!   必须在新实例注册之前全部终止，否则旧回调可能在新世界里被触发。
//! - 重启请求通常来自脚本回调内部，而回调执行期间正处于连接分发的调用栈上；
//!   因此请求只登记，实际切换推迟到下一次 `after_iteration`。
//!
//! ## 逻辑 (How)
//! - 当前实例存放在 `ArcSwapOption` 中，事件分发只做一次无锁 `load_full`；
//! - 重启：`Draining` → 静默旧实例 → 置空 → `Created` → 新实例 → `reregister` 回调 →
//!   若回调没有自行监听则重新绑定原端口 → `done(true)` / `done(false, message)`；
//! - 状态锁只保护状态值本身，任何脚本回调与原生调用都在锁外进行。
//!
//! ## 契约 (What)
//! - `create_app` 在已有当前实例时幂等；
//! - `listen` 失败时以 `(false, message)` 调用就绪回调并返回 `Bind` 错误，不会 panic；
//! - `shutdown` 幂等：第二次调用返回 `Ok(false)`。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::app::Application;
use crate::bridge::CallbackBridge;
use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::fs_ops::Waker;
use crate::native::NativeEngine;
use crate::value::{CallbackRef, ScriptValue};

/// 服务器状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerState {
    Created,
    Listening,
    Draining,
    Terminated,
}

impl ServerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ServerState::Created => "created",
            ServerState::Listening => "listening",
            ServerState::Draining => "draining",
            ServerState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次挂起的热重启请求。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartRequest {
    /// 在新实例上重建路由的脚本入口。
    pub reregister: CallbackRef,
    /// `done(true)` 或 `done(false, message)`。
    pub done: Option<CallbackRef>,
}

/// 生命周期管理器。
pub struct ServerLifecycle {
    config: RuntimeConfig,
    bridge: Arc<CallbackBridge>,
    clock: Arc<dyn Clock>,
    native: Arc<dyn NativeEngine>,
    current: ArcSwapOption<Application>,
    state: Mutex<ServerState>,
    port: Mutex<Option<u16>>,
    pending_restart: Mutex<Option<RestartRequest>>,
    epochs: AtomicU64,
    timer_ids: Arc<AtomicU64>,
}

impl ServerLifecycle {
    pub fn new(
        config: RuntimeConfig,
        bridge: Arc<CallbackBridge>,
        clock: Arc<dyn Clock>,
        native: Arc<dyn NativeEngine>,
    ) -> Self {
        Self {
            config,
            bridge,
            clock,
            native,
            current: ArcSwapOption::empty(),
            state: Mutex::new(ServerState::Created),
            port: Mutex::new(None),
            pending_restart: Mutex::new(None),
            epochs: AtomicU64::new(0),
            timer_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// 最近一次成功绑定的端口。
    pub fn port(&self) -> Option<u16> {
        *self.port.lock()
    }

    pub fn current(&self) -> Option<Arc<Application>> {
        self.current.load_full()
    }

    /// 当前实例；不存在时返回 `NoApplication`。
    pub fn app(&self) -> Result<Arc<Application>> {
        self.current().ok_or(RuntimeError::NoApplication)
    }

    /// 创建应用实例；已有当前实例时直接返回它。
    pub fn create_app(&self) -> Result<Arc<Application>> {
        let state = self.state();
        if matches!(state, ServerState::Terminated | ServerState::Draining) {
            return Err(RuntimeError::InvalidState {
                action: "create an application",
                state,
            });
        }
        if let Some(app) = self.current() {
            return Ok(app);
        }
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let app = Arc::new(Application::new(
            epoch,
            &self.config,
            self.bridge.clone(),
            self.clock.clone(),
            self.timer_ids.clone(),
            Some(self.waker()),
        ));
        self.current.store(Some(app.clone()));
        tracing::debug!(target: "spark_script::server", epoch, "application created");
        Ok(app)
    }

    /// 绑定端口并调用就绪回调；回调引用在调用后释放。
    pub fn listen(&self, port: u16, ready: Option<CallbackRef>) -> Result<u16> {
        let outcome = self.bind(port);
        if let Some(ready) = ready {
            let args = match &outcome {
                Ok(bound) => vec![ScriptValue::Bool(true), ScriptValue::Integer(i64::from(*bound))],
                Err(err) => vec![ScriptValue::Bool(false), ScriptValue::str(err.to_string())],
            };
            let _ = self.bridge.invoke("server.listen", ready, args);
            self.bridge.release_callback(ready);
        }
        outcome
    }

    fn bind(&self, port: u16) -> Result<u16> {
        let app = self.app()?;
        let state = self.state();
        if state != ServerState::Created {
            return Err(RuntimeError::InvalidState {
                action: "listen",
                state,
            });
        }
        let socket = match self.native.listen(port) {
            Ok(socket) => socket,
            Err(source) => {
                let err = RuntimeError::Bind { port, source };
                tracing::error!(target: "spark_script::server", port, code = err.code(), error = %err, "failed to listen");
                return Err(err);
            }
        };
        let bound = socket.port();
        app.set_listen_socket(socket);
        *self.port.lock() = Some(bound);
        *self.state.lock() = ServerState::Listening;
        tracing::info!(target: "spark_script::server", port = bound, "Listening on port {bound}");
        Ok(bound)
    }

    /// 登记热重启，推迟到下一次迭代结束时执行。后到的请求覆盖先到的请求。
    pub fn request_restart(&self, reregister: CallbackRef, done: Option<CallbackRef>) -> Result<()> {
        let state = self.state();
        if state == ServerState::Terminated {
            return Err(RuntimeError::InvalidState {
                action: "restart",
                state,
            });
        }
        let replaced = self
            .pending_restart
            .lock()
            .replace(RestartRequest { reregister, done });
        if let Some(previous) = replaced {
            tracing::debug!(target: "spark_script::server", "superseded pending restart request");
            self.release_request(previous);
        }
        self.native.wake();
        Ok(())
    }

    pub fn has_pending_restart(&self) -> bool {
        self.pending_restart.lock().is_some()
    }

    /// 执行挂起的重启（若有）。
    pub fn apply_pending_restart(&self) -> Option<Result<()>> {
        let request = self.pending_restart.lock().take()?;
        Some(self.restart_now(request.reregister, request.done))
    }

    /// 同步热重启。
    pub fn restart_now(&self, reregister: CallbackRef, done: Option<CallbackRef>) -> Result<()> {
        let request = RestartRequest { reregister, done };
        let previous = std::mem::replace(&mut *self.state.lock(), ServerState::Draining);
        if previous == ServerState::Terminated {
            *self.state.lock() = ServerState::Terminated;
            self.release_request(request);
            return Err(RuntimeError::InvalidState {
                action: "restart",
                state: previous,
            });
        }

        let port = self.port();
        tracing::info!(target: "spark_script::server", ?port, "hot restart started");
        if let Some(old) = self.current.swap(None) {
            old.quiesce();
        }
        *self.state.lock() = ServerState::Created;

        let outcome = self.rebuild(reregister, port);
        let args = match &outcome {
            Ok(()) => vec![ScriptValue::Bool(true)],
            Err(err) => {
                tracing::error!(target: "spark_script::server", code = err.code(), error = %err, "hot restart failed");
                vec![ScriptValue::Bool(false), ScriptValue::str(err.to_string())]
            }
        };
        if let Some(done) = done {
            let _ = self.bridge.invoke("server.restart", done, args);
        }
        self.release_request(request);
        if outcome.is_ok() {
            tracing::info!(target: "spark_script::server", port = ?self.port(), "hot restart completed");
        }
        outcome
    }

    fn rebuild(&self, reregister: CallbackRef, port: Option<u16>) -> Result<()> {
        let app = self.create_app()?;
        self.bridge.invoke("server.reregister", reregister, Vec::new())?;
        if let Some(port) = port
            && self.state() == ServerState::Created
            && app.listen_port().is_none()
        {
            self.bind(port)?;
        }
        Ok(())
    }

    /// 静默当前实例并停止原生循环。
    pub fn shutdown(&self) -> Result<bool> {
        {
            let mut state = self.state.lock();
            if *state == ServerState::Terminated {
                return Ok(false);
            }
            *state = ServerState::Draining;
        }
        if let Some(request) = self.pending_restart.lock().take() {
            self.release_request(request);
        }
        if let Some(app) = self.current.swap(None) {
            app.quiesce();
        }
        *self.state.lock() = ServerState::Terminated;
        self.native.stop();
        tracing::info!(target: "spark_script::server", "server terminated");
        Ok(true)
    }

    fn release_request(&self, request: RestartRequest) {
        self.bridge.release_callback(request.reregister);
        if let Some(done) = request.done {
            self.bridge.release_callback(done);
        }
    }

    fn waker(&self) -> Waker {
        let native = self.native.clone();
        Arc::new(move || native.wake())
    }
}

impl fmt::Debug for ServerLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerLifecycle")
            .field("state", &self.state())
            .field("port", &self.port())
            .field("epoch", &self.epochs.load(Ordering::Relaxed))
            .finish()
    }
}
