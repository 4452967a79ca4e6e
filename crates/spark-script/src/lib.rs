#![deny(unsafe_code)]

//! `spark-script` 是脚本解释器与事件驱动原生 I/O 引擎之间的运行时核心。
//!
//! # 模块定位（Why）
//! - 解释器只允许单个活动调用，原生引擎却在自己的线程上以回调形式投递连接事件；
//!   本 crate 负责两者之间的串行化、句柄生命周期、定时器、带背压的文件传输与热重启。
//! - HTTP 解析、TCP/TLS 与就绪通知属于原生引擎，脚本语义属于解释器，均通过
//!   [`native`] 与 [`bridge`] 中的窄接口接入。
//!
//! # 设计概要（How）
//! - [`registry`]：把原生资源包装为不透明句柄，资源死亡后保留僵尸句柄；
//! - [`bridge`]：可重入串行化锁包住解释器，脚本错误与 panic 在此被捕获；
//! - [`timer`]：每次迭代扫描一次，调用脚本时不持有定时器表锁；
//! - [`transfer`] 与 [`static_files`]：按文件大小选择内联、缓冲或内存映射策略，背压下原样重试；
//! - [`connection`]：HTTP 交换、WebSocket 会话与 SSE 流的状态机；
//! - [`server`]、[`app`]、[`runtime`]：应用实例、生命周期状态机与脚本可见入口。
//!
//! # 命名约定（Consistency）
//! - 日志 target 统一为 `spark_script::<组件>`；错误码统一为 `spark.script.<原因>`。

pub mod app;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod fs_ops;
pub mod mime;
pub mod native;
pub mod observability;
pub mod registry;
pub mod response;
pub mod router;
pub mod runtime;
pub mod server;
pub mod static_files;
pub mod test_stubs;
pub mod timer;
pub mod transfer;
pub mod value;

pub use app::{Application, IterationReport, ShutdownReport};
pub use bridge::{BridgeStats, CallbackBridge, ScriptEngine};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, RuntimeConfig};
pub use connection::sse::{SseEvent, SseSendStatus};
pub use connection::websocket::WebSocketHandle;
pub use connection::{ConnectionManager, QuiesceReport};
pub use error::{Result, RuntimeError, ScriptError};
pub use native::{
    ConnectionId, EventSink, HttpMethod, HttpResponse, ListenSocket, NativeEngine, NativeEvent,
    OpCode, RequestInfo, SendStatus, WebSocketConnection, WriteStatus,
};
pub use registry::{Handle, HandleKind, HandleRegistry, SessionPhase};
pub use response::ResponseHandle;
pub use router::{MethodFilter, SseBehavior, WebSocketBehavior};
pub use runtime::{Runtime, RuntimeBuilder};
pub use server::{ServerLifecycle, ServerState};
pub use timer::{TimerEngine, TimerId};
pub use transfer::{TransferEngine, TransferLimits, TransferStrategy};
pub use value::{CallbackRef, ScriptRef, ScriptValue};
