//! 运行时门面：脚本绑定层调用的全部入口，以及原生引擎的事件接收端。
//!
//! # 教案式说明
//! - **意图（Why）**：绑定层只需要一个对象即可完成“注册路由 → 监听 → 运行 → 重启 → 关闭”
//!   的完整流程；原生引擎也只需要一个 [`EventSink`]。
//! - **逻辑（How）**：所有注册类方法都作用于当前应用实例，没有实例时返回 `NoApplication`；
//!   [`EventSink::after_iteration`] 推进当前实例的一次迭代，然后执行挂起的热重启。
//! - **契约（What）**：文件操作以 `(true, value)` / `(false, message)` 形式返回；
//!   其余方法返回 [`Result`]，错误不会以 panic 形式越过绑定层。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::app::{Application, IterationReport};
use crate::bridge::{CallbackBridge, ScriptEngine};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, RuntimeConfig};
use crate::connection::sse::{SseEvent, SseSendStatus};
use crate::error::Result;
use crate::fs_ops::{self, outcome_values};
use crate::native::{EventSink, HttpMethod, NativeEngine, NativeEvent};
use crate::router::{MethodFilter, RouteTarget, SseBehavior, WebSocketBehavior};
use crate::server::{ServerLifecycle, ServerState};
use crate::timer::TimerId;
use crate::value::{CallbackRef, ScriptValue};

/// [`Runtime`] 构建器。
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// 替换时间来源（测试注入 `ManualClock`）。
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(
        self,
        engine: impl ScriptEngine + 'static,
        native: Arc<dyn NativeEngine>,
    ) -> core::result::Result<Runtime, ConfigError> {
        self.config.validate()?;
        let bridge = Arc::new(CallbackBridge::new(engine));
        let server = ServerLifecycle::new(self.config, bridge.clone(), self.clock, native.clone());
        Ok(Runtime {
            bridge,
            native,
            server,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行时核心。
pub struct Runtime {
    bridge: Arc<CallbackBridge>,
    native: Arc<dyn NativeEngine>,
    server: ServerLifecycle,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn bridge(&self) -> &CallbackBridge {
        &self.bridge
    }

    pub fn server(&self) -> &ServerLifecycle {
        &self.server
    }

    pub fn state(&self) -> ServerState {
        self.server.state()
    }

    pub fn app(&self) -> Result<Arc<Application>> {
        self.server.app()
    }

    pub fn create_app(&self) -> Result<()> {
        self.server.create_app().map(|_| ())
    }

    pub fn route(&self, method: MethodFilter, pattern: &str, handler: CallbackRef) -> Result<()> {
        self.app()?
            .router()
            .add_route(method, pattern, RouteTarget::Handler(handler));
        Ok(())
    }

    pub fn get(&self, pattern: &str, handler: CallbackRef) -> Result<()> {
        self.route(MethodFilter::Only(HttpMethod::Get), pattern, handler)
    }

    pub fn post(&self, pattern: &str, handler: CallbackRef) -> Result<()> {
        self.route(MethodFilter::Only(HttpMethod::Post), pattern, handler)
    }

    pub fn put(&self, pattern: &str, handler: CallbackRef) -> Result<()> {
        self.route(MethodFilter::Only(HttpMethod::Put), pattern, handler)
    }

    pub fn delete(&self, pattern: &str, handler: CallbackRef) -> Result<()> {
        self.route(MethodFilter::Only(HttpMethod::Delete), pattern, handler)
    }

    pub fn patch(&self, pattern: &str, handler: CallbackRef) -> Result<()> {
        self.route(MethodFilter::Only(HttpMethod::Patch), pattern, handler)
    }

    pub fn head(&self, pattern: &str, handler: CallbackRef) -> Result<()> {
        self.route(MethodFilter::Only(HttpMethod::Head), pattern, handler)
    }

    pub fn options(&self, pattern: &str, handler: CallbackRef) -> Result<()> {
        self.route(MethodFilter::Only(HttpMethod::Options), pattern, handler)
    }

    pub fn any(&self, pattern: &str, handler: CallbackRef) -> Result<()> {
        self.route(MethodFilter::Any, pattern, handler)
    }

    /// 注册中间件；`scope` 为路由模式字符串，`None` 表示全局。
    pub fn use_middleware(&self, middleware: CallbackRef, scope: Option<&str>) -> Result<()> {
        self.app()?.router().add_middleware(middleware, scope);
        Ok(())
    }

    pub fn ws(&self, pattern: &str, behavior: WebSocketBehavior) -> Result<()> {
        self.app()?.router().add_websocket(pattern, behavior);
        Ok(())
    }

    pub fn sse(&self, pattern: &str, behavior: SseBehavior) -> Result<()> {
        self.app()?.router().add_route(
            MethodFilter::Only(HttpMethod::Get),
            pattern,
            RouteTarget::Sse(behavior),
        );
        Ok(())
    }

    pub fn sse_send(&self, id: &str, event: &SseEvent) -> Result<SseSendStatus> {
        self.app()?.connections().sse_send(id, event)
    }

    pub fn sse_close(&self, id: &str) -> Result<()> {
        self.app()?.connections().sse_close(id)
    }

    pub fn set_timeout(
        &self,
        callback: CallbackRef,
        delay: Duration,
        args: Vec<ScriptValue>,
    ) -> Result<TimerId> {
        Ok(self.app()?.timers().set_timeout(callback, delay, args))
    }

    pub fn set_interval(
        &self,
        callback: CallbackRef,
        interval: Duration,
        args: Vec<ScriptValue>,
    ) -> Result<TimerId> {
        Ok(self.app()?.timers().set_interval(callback, interval, args))
    }

    /// 停止定时器；没有当前实例或 id 未知时返回 `false`。
    pub fn clear_timer(&self, id: TimerId) -> bool {
        self.server
            .current()
            .is_some_and(|app| app.timers().clear(id))
    }

    pub fn serve_static(&self, prefix: &str, dir: impl AsRef<Path>) -> Result<()> {
        self.app()?.serve_static(prefix, dir)
    }

    /// 同步读取：`(true, bytes)` 或 `(false, message)`。
    pub fn read_file(&self, path: impl AsRef<Path>) -> Vec<ScriptValue> {
        outcome_values(fs_ops::read_file(path).map(ScriptValue::Bytes))
    }

    /// 同步写入：`(true, written)` 或 `(false, message)`。
    pub fn write_file(&self, path: impl AsRef<Path>, data: &[u8]) -> Vec<ScriptValue> {
        outcome_values(
            fs_ops::write_file(path, data)
                .map(|len| ScriptValue::Integer(i64::try_from(len).unwrap_or(i64::MAX))),
        )
    }

    pub fn read_file_async(&self, path: impl Into<PathBuf>, callback: CallbackRef) -> Result<()> {
        self.app()?.files().read_async(path, callback);
        Ok(())
    }

    pub fn write_file_async(
        &self,
        path: impl Into<PathBuf>,
        data: Bytes,
        callback: CallbackRef,
    ) -> Result<()> {
        self.app()?.files().write_async(path, data, callback);
        Ok(())
    }

    pub fn listen(&self, port: u16, ready: Option<CallbackRef>) -> Result<u16> {
        self.server.listen(port, ready)
    }

    /// 在调用线程上运行原生事件循环，直到 `shutdown`。
    pub fn run(&self) {
        tracing::debug!(target: "spark_script::server", state = %self.state(), "entering native loop");
        self.native.run(self);
    }

    /// 不经过原生循环手动推进一次迭代。
    pub fn tick(&self) -> Option<IterationReport> {
        let report = self.server.current().map(|app| app.on_iteration());
        self.apply_pending_restart();
        report
    }

    pub fn request_restart(&self, reregister: CallbackRef, done: Option<CallbackRef>) -> Result<()> {
        self.server.request_restart(reregister, done)
    }

    pub fn restart_now(&self, reregister: CallbackRef, done: Option<CallbackRef>) -> Result<()> {
        self.server.restart_now(reregister, done)
    }

    pub fn shutdown(&self) -> Result<bool> {
        self.server.shutdown()
    }

    fn apply_pending_restart(&self) {
        if let Some(Err(err)) = self.server.apply_pending_restart() {
            tracing::warn!(target: "spark_script::server", code = err.code(), error = %err, "deferred restart did not complete");
        }
    }
}

impl EventSink for Runtime {
    fn deliver(&self, event: NativeEvent) {
        match self.server.current() {
            Some(app) => app.dispatch(event),
            None => {
                tracing::trace!(target: "spark_script::server", conn = %event.conn(), kind = event.kind(), "event without application dropped");
            }
        }
    }

    fn after_iteration(&self) {
        self.tick();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("server", &self.server)
            .field("bridge", &self.bridge)
            .finish()
    }
}
