//! 应用实例：一次 `create_app` 所拥有的全部状态。
//!
//! # 教案式说明
//! - **意图（Why）**：热重启要求“旧实例的一切”可以被整体静默并丢弃，新实例从空白开始；
//!   因此路由、句柄注册表、定时器、传输、异步文件操作与连接表全部归实例所有，
//!   不存在进程级全局表。
//! - **逻辑（How）**：[`Application::on_iteration`] 按“定时器扫描 → 定时器回收 → 传输截止 →
//!   文件完成队列”的顺序推进一次迭代；[`Application::quiesce`] 按固定顺序终止全部资源并释放
//!   所有回调引用，期间不调用任何脚本回调。
//! - **契约（What）**：实例在 `quiesce` 之后不再持有任何原生资源或脚本引用，可以直接丢弃。

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::bridge::CallbackBridge;
use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::connection::{ConnectionManager, QuiesceReport};
use crate::error::Result;
use crate::fs_ops::{FileWorkers, Waker};
use crate::native::{HttpMethod, ListenSocket, NativeEvent};
use crate::registry::HandleRegistry;
use crate::router::{MethodFilter, RouteTarget, Router};
use crate::static_files::StaticMount;
use crate::timer::{ScanReport, TimerEngine};
use crate::transfer::TransferEngine;

/// 单次迭代的统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub timers: ScanReport,
    pub swept: usize,
    pub expired_transfers: usize,
    pub file_completions: usize,
}

/// 静默一个实例后的统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub listen_socket_closed: bool,
    pub connections: QuiesceReport,
    pub timers: usize,
    pub file_ops: usize,
    pub callbacks: usize,
}

/// 一个应用实例。
pub struct Application {
    epoch: u64,
    bridge: Arc<CallbackBridge>,
    router: Arc<Router>,
    websockets: Arc<HandleRegistry>,
    streams: Arc<HandleRegistry>,
    transfers: Arc<TransferEngine>,
    timers: TimerEngine,
    files: FileWorkers,
    connections: ConnectionManager,
    listen_socket: Mutex<Option<Arc<dyn ListenSocket>>>,
    iterations: AtomicU64,
    sweep_every: u64,
}

impl Application {
    pub fn new(
        epoch: u64,
        config: &RuntimeConfig,
        bridge: Arc<CallbackBridge>,
        clock: Arc<dyn Clock>,
        timer_ids: Arc<AtomicU64>,
        waker: Option<Waker>,
    ) -> Self {
        let router = Arc::new(Router::new());
        let websockets = Arc::new(HandleRegistry::new());
        let streams = Arc::new(HandleRegistry::new());
        let transfers = Arc::new(TransferEngine::new(
            config.transfer.limits(),
            clock.clone(),
        ));
        let connections = ConnectionManager::new(
            bridge.clone(),
            router.clone(),
            transfers.clone(),
            websockets.clone(),
            streams.clone(),
            config.sse.max_pending_bytes,
        );
        Self {
            epoch,
            timers: TimerEngine::with_ids(clock, bridge.clone(), timer_ids),
            files: FileWorkers::new(bridge.clone(), waker),
            bridge,
            router,
            websockets,
            streams,
            transfers,
            connections,
            listen_socket: Mutex::new(None),
            iterations: AtomicU64::new(0),
            sweep_every: u64::from(config.timers.sweep_every_iterations.max(1)),
        }
    }

    /// 实例代号，每次创建递增。
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn timers(&self) -> &TimerEngine {
        &self.timers
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub fn files(&self) -> &FileWorkers {
        &self.files
    }

    pub fn websockets(&self) -> &HandleRegistry {
        &self.websockets
    }

    pub fn streams(&self) -> &HandleRegistry {
        &self.streams
    }

    /// 挂载静态目录：`GET {prefix}/*`。
    pub fn serve_static(&self, prefix: &str, dir: impl AsRef<Path>) -> Result<()> {
        let mount = Arc::new(StaticMount::new(prefix, dir)?);
        tracing::info!(
            target: "spark_script::server",
            prefix = mount.prefix(),
            root = %mount.root().display(),
            "static directory mounted"
        );
        let pattern = mount.pattern();
        self.router.add_route(
            MethodFilter::Only(HttpMethod::Get),
            &pattern,
            RouteTarget::Static(mount),
        );
        Ok(())
    }

    pub fn dispatch(&self, event: NativeEvent) {
        self.connections.handle(event);
    }

    /// 推进一次循环迭代。
    pub fn on_iteration(&self) -> IterationReport {
        let timers = self.timers.scan();
        let iteration = self.iterations.fetch_add(1, Ordering::Relaxed) + 1;
        let swept = if iteration % self.sweep_every == 0 {
            self.timers.sweep()
        } else {
            0
        };
        IterationReport {
            timers,
            swept,
            expired_transfers: self.transfers.expire(),
            file_completions: self.files.drain_completions(),
        }
    }

    pub(crate) fn set_listen_socket(&self, socket: Arc<dyn ListenSocket>) {
        if let Some(previous) = self.listen_socket.lock().replace(socket) {
            previous.close();
        }
    }

    /// 当前监听端口；未监听时为 `None`。
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_socket.lock().as_ref().map(|socket| socket.port())
    }

    fn close_listen_socket(&self) -> bool {
        let socket = self.listen_socket.lock().take();
        match socket {
            Some(socket) => {
                socket.close();
                true
            }
            None => false,
        }
    }

    /// 终止全部资源并释放全部脚本引用。
    pub fn quiesce(&self) -> ShutdownReport {
        let listen_socket_closed = self.close_listen_socket();
        let connections = self.connections.quiesce();
        let timers = self.timers.drain();
        let file_ops = self.files.cancel_all();
        let callbacks = self.router.clear();
        for callback in &callbacks {
            self.bridge.release_callback(*callback);
        }
        self.websockets.drain();
        self.streams.drain();

        let report = ShutdownReport {
            listen_socket_closed,
            connections,
            timers,
            file_ops,
            callbacks: callbacks.len(),
        };
        tracing::info!(target: "spark_script::server", epoch = self.epoch, ?report, "application quiesced");
        report
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("epoch", &self.epoch)
            .field("router", &self.router)
            .field("connections", &self.connections)
            .field("timers", &self.timers)
            .finish()
    }
}
